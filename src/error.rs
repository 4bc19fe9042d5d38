//! Errors surfaced by regions, locks, rings and sessions

use std::io;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, MirrorError>;

#[derive(Debug, Error)]
pub enum MirrorError {
    /// `shm_open(O_CREAT)` failed or the segment could not be registered
    #[error("Cannot create region '{name}': {source}")]
    RegionCreate {
        name: String,
        #[source]
        source: io::Error,
    },

    /// The named region does not exist or cannot be opened
    #[error("Cannot open region '{name}': {source}")]
    RegionOpen {
        name: String,
        #[source]
        source: io::Error,
    },

    #[error("Cannot map region: {0}")]
    Map(#[source] io::Error),

    #[error("Cannot size region: {0}")]
    Resize(#[source] io::Error),

    /// Region names are limited by the platform's shm name length
    #[error("Region name too long: max {max} chars, got {got}")]
    NameTooLong { max: usize, got: usize },

    /// Failed to open or initialize the interprocess lock
    #[error("Failed to open lock '{name}': {source}")]
    LockOpen {
        name: String,
        #[source]
        source: io::Error,
    },

    /// The interprocess lock was not acquired before the deadline
    #[error("Timed out after {timeout_ms}ms waiting for the session lock")]
    LockTimeout { timeout_ms: u32 },

    /// The region was written by an incompatible format version
    #[error("Format version mismatch: expected {expected}, got {got}")]
    VersionMismatch { expected: u32, got: u32 },

    /// Both ends must be built from the same schema
    #[error("Schema hash mismatch")]
    SchemaMismatch,

    /// Existing region was created with different sizes
    #[error("Layout mismatch: expected {expected} bytes, existing region has {got} bytes")]
    LayoutMismatch { expected: usize, got: usize },

    /// Region is too small for what was asked of it
    #[error("Region too small: need {required} bytes, have {got} bytes")]
    RegionTooSmall { required: usize, got: usize },

    /// Ring buffer geometry cannot be used
    #[error("Invalid ring geometry: block size {block_size}, block count {block_count}")]
    InvalidGeometry { block_size: u32, block_count: u32 },

    /// An existing ring was formatted with other block dimensions
    #[error(
        "Ring geometry mismatch: requested {block_size}x{block_count}, \
         existing ring is {existing_block_size}x{existing_block_count}"
    )]
    GeometryMismatch {
        block_size: u32,
        block_count: u32,
        existing_block_size: u32,
        existing_block_count: u32,
    },

    /// A change-log record can never fit in the pool
    #[error("Change-log record of {requested} bytes does not fit a {pool} byte pool")]
    OutOfMemory { requested: usize, pool: usize },

    /// The region was never initialized by its creator
    #[error("Shared region '{0}' is not initialized")]
    Uninitialized(String),
}

//! Lock-free single-producer / multi-consumer block ring
//!
//! Carries high-rate byte payloads (audio frames, sensor samples) between
//! processes without a lock. The producer never waits for consumers: old
//! entries are evicted as the ring laps, and consumers detect what they
//! missed.
//!
//! # Layout
//!
//! ```text
//! +0   pool_size        u32   bytes of block storage
//! +4   block_size       u32   multiple of 4, includes the 4-byte size field
//! +8   block_count      u32   published last, 0 = not initialized
//! +12  reserved         u32
//! +16  write_index      u32   atomic, monotonic, in blocks
//! +20  min_read_index   u32   atomic, oldest block still valid
//! +24  blocks           [block_size; block_count]
//! ```
//!
//! An entry starts with a `u32` payload length and continues through as many
//! headerless blocks as that length needs. Entries never straddle the end of
//! the pool; the tail blocks are marked with a zero length instead.

use crate::atomic::AtomicWord;
use crate::error::{MirrorError, Result};
use crate::view::MemoryView;
use std::sync::atomic::{fence, Ordering};

const POOL_SIZE: usize = 0;
const BLOCK_SIZE: usize = 4;
const BLOCK_COUNT: usize = 8;
const RESERVED: usize = 12;
const WRITE_INDEX: usize = 16;
const MIN_READ_INDEX: usize = 20;

/// Size of the length field at the start of an entry
pub const BLOCK_HEADER: usize = 4;

/// Number of blocks an entry of `size` bytes spans
#[inline]
pub const fn blocks_needed(block_size: u32, size: usize) -> u32 {
    let first = block_size as usize - BLOCK_HEADER;
    if size <= first {
        1
    } else {
        let rest = size - first;
        1 + rest.div_ceil(block_size as usize) as u32
    }
}

/// Result of [`SpmcIterator::read_next`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    /// An entry was handed to the callback and is consistent
    Read,
    /// Nothing new has been published
    Empty,
    /// The entry was overwritten while it was being copied; discard the copy
    Stale,
}

impl ReadOutcome {
    #[inline]
    pub fn is_read(self) -> bool {
        self == ReadOutcome::Read
    }
}

/// Block ring over a [`MemoryView`]
#[derive(Clone, Copy)]
pub struct SpmcRingBuffer<'a> {
    view: MemoryView<'a>,
    block_size: u32,
    block_count: u32,
}

impl<'a> SpmcRingBuffer<'a> {
    pub const HEADER_SIZE: usize = 24;

    /// Bytes needed for a ring of `block_count` blocks of `block_size`
    pub const fn required_size(block_size: u32, block_count: u32) -> usize {
        Self::HEADER_SIZE + block_size as usize * block_count as usize
    }

    fn check_geometry(block_size: u32, block_count: u32) -> Result<()> {
        if block_size % 4 != 0 || (block_size as usize) <= BLOCK_HEADER || block_count == 0 {
            return Err(MirrorError::InvalidGeometry {
                block_size,
                block_count,
            });
        }
        Ok(())
    }

    /// Format `view` as an empty ring, using as many blocks as fit
    pub fn init(view: MemoryView<'a>, block_size: u32) -> Result<Self> {
        if view.len() < Self::HEADER_SIZE {
            return Err(MirrorError::RegionTooSmall {
                required: Self::HEADER_SIZE,
                got: view.len(),
            });
        }
        let block_count = if block_size == 0 {
            0
        } else {
            ((view.len() - Self::HEADER_SIZE) / block_size as usize) as u32
        };
        Self::check_geometry(block_size, block_count)?;

        let header = view.slice(0, Self::HEADER_SIZE);
        header.atomic_u32(BLOCK_COUNT).store_release(0);
        header.write_u32(POOL_SIZE, block_size * block_count);
        header.write_u32(BLOCK_SIZE, block_size);
        header.write_u32(RESERVED, 0);
        header.atomic_u32(WRITE_INDEX).store_release(0);
        header.atomic_u32(MIN_READ_INDEX).store_release(0);
        view.tail(Self::HEADER_SIZE).fill(0);
        header.atomic_u32(BLOCK_COUNT).store_release(block_count);

        Ok(Self {
            view,
            block_size,
            block_count,
        })
    }

    /// Attach to a ring formatted by another handle
    pub fn attach(view: MemoryView<'a>) -> Result<Self> {
        if view.len() < Self::HEADER_SIZE {
            return Err(MirrorError::RegionTooSmall {
                required: Self::HEADER_SIZE,
                got: view.len(),
            });
        }
        let block_count = view.atomic_u32(BLOCK_COUNT).load_acquire();
        if block_count == 0 {
            return Err(MirrorError::Uninitialized("signal ring".to_string()));
        }
        let block_size = view.read_u32(BLOCK_SIZE);
        Self::check_geometry(block_size, block_count)?;
        let required = Self::required_size(block_size, block_count);
        if required > view.len() {
            return Err(MirrorError::RegionTooSmall {
                required,
                got: view.len(),
            });
        }
        Ok(Self {
            view,
            block_size,
            block_count,
        })
    }

    /// Rebuild a handle for a view already formatted with this geometry
    pub(crate) fn from_validated(view: MemoryView<'a>, block_size: u32, block_count: u32) -> Self {
        Self {
            view,
            block_size,
            block_count,
        }
    }

    #[inline]
    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    #[inline]
    pub fn block_count(&self) -> u32 {
        self.block_count
    }

    /// Largest payload a single entry can carry
    #[inline]
    pub fn max_payload(&self) -> usize {
        self.block_size as usize * self.block_count as usize - BLOCK_HEADER
    }

    #[inline]
    pub fn blocks_needed(&self, size: usize) -> u32 {
        blocks_needed(self.block_size, size)
    }

    #[inline]
    fn write_word(&self) -> AtomicWord<'a> {
        self.view.atomic_u32(WRITE_INDEX)
    }

    #[inline]
    fn min_read_word(&self) -> AtomicWord<'a> {
        self.view.atomic_u32(MIN_READ_INDEX)
    }

    /// Published write index, in blocks
    #[inline]
    pub fn write_index(&self) -> u32 {
        self.write_word().load_acquire()
    }

    /// Oldest block index still guaranteed valid
    #[inline]
    pub fn min_read_index(&self) -> u32 {
        self.min_read_word().load_acquire()
    }

    #[inline]
    fn block_offset(&self, slot: u32) -> usize {
        Self::HEADER_SIZE + slot as usize * self.block_size as usize
    }

    #[inline]
    fn data_size(&self, slot: u32) -> usize {
        self.view.read_u32(self.block_offset(slot)) as usize
    }

    /// Publish an entry of `size` bytes filled by `fill`.
    ///
    /// Returns false without calling `fill` when `size` is not positive or the
    /// entry would not fit even in an empty ring. Must only be called from the
    /// single producer.
    pub fn write<F>(&self, size: i32, fill: F) -> bool
    where
        F: FnOnce(MemoryView<'a>),
    {
        if size <= 0 {
            return false;
        }
        let size = size as usize;
        let needed = self.blocks_needed(size);
        if needed > self.block_count {
            return false;
        }

        let count = self.block_count;
        let write = self.write_word().load_acquire();
        let start = write % count;
        let skip = if start + needed > count { count - start } else { 0 };
        let new_write = write + skip + needed;

        let required_min = new_write.saturating_sub(count);
        let mut min = self.min_read_word().load_acquire();
        if min < required_min {
            // Walk published entries; anything past `write` is about to
            // become skip markers or this entry
            while min < required_min && min < write {
                match self.data_size(min % count) {
                    0 => min += 1,
                    ds => min += self.blocks_needed(ds),
                }
            }
            min = min.max(required_min);
            tracing::trace!(min_read = min, write = new_write, "evicting signal entries");
            self.min_read_word().store_release(min);
            fence(Ordering::Release);
        }

        for slot in start..start + skip {
            self.view.write_u32(self.block_offset(slot), 0);
        }

        let slot = (write + skip) % count;
        let offset = self.block_offset(slot);
        self.view.write_u32(offset, size as u32);
        fill(self.view.slice(offset + BLOCK_HEADER, size));

        self.write_word().store_release(new_write);
        true
    }
}

/// A consumer's position in a [`SpmcRingBuffer`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SpmcIterator {
    cursor: u32,
}

impl SpmcIterator {
    pub fn new(cursor: u32) -> Self {
        Self { cursor }
    }

    /// Start at the oldest entry still retained
    pub fn at_oldest(ring: &SpmcRingBuffer<'_>) -> Self {
        Self::new(ring.min_read_index())
    }

    /// Start after everything already published
    pub fn at_end(ring: &SpmcRingBuffer<'_>) -> Self {
        Self::new(ring.write_index())
    }

    #[inline]
    pub fn cursor(&self) -> u32 {
        self.cursor
    }

    #[inline]
    pub fn has_next(&self, ring: &SpmcRingBuffer<'_>) -> bool {
        self.cursor < ring.write_index()
    }

    /// True if the producer evicted entries this cursor had not read yet
    #[inline]
    pub fn has_missed_entries(&self, ring: &SpmcRingBuffer<'_>) -> bool {
        self.cursor < ring.min_read_index()
    }

    /// Hand the next entry to `read`.
    ///
    /// Entries evicted before this call are skipped. If the producer overwrote
    /// the entry while `read` was copying it, returns [`ReadOutcome::Stale`]
    /// and moves the cursor to the oldest valid entry.
    pub fn read_next<'a, F>(&mut self, ring: &SpmcRingBuffer<'a>, read: F) -> ReadOutcome
    where
        F: FnOnce(MemoryView<'a>),
    {
        let write = ring.write_index();
        let min = ring.min_read_index();
        if self.cursor > write && min < self.cursor {
            // Ring was formatted again behind this cursor
            tracing::debug!(cursor = self.cursor, write, "signal ring restarted");
            self.cursor = min;
        }
        if self.cursor < min {
            self.cursor = min;
        }

        let count = ring.block_count;
        let (slot, size) = loop {
            if self.cursor >= write {
                return ReadOutcome::Empty;
            }
            let slot = self.cursor % count;
            match ring.data_size(slot) {
                0 => self.cursor += 1,
                size => break (slot, size),
            }
        };

        let entry = self.cursor;
        let span = ring.blocks_needed(size);
        if size > ring.max_payload() || slot + span > count {
            // Header was overwritten under us
            return self.snap_to_min(ring, entry);
        }

        read(ring.view.slice(ring.block_offset(slot) + BLOCK_HEADER, size));
        fence(Ordering::Acquire);

        if ring.min_read_index() > entry {
            return self.snap_to_min(ring, entry);
        }
        self.cursor = entry + span;
        ReadOutcome::Read
    }

    fn snap_to_min(&mut self, ring: &SpmcRingBuffer<'_>, entry: u32) -> ReadOutcome {
        self.cursor = ring.min_read_index().max(entry + 1);
        ReadOutcome::Stale
    }
}

//! venom_mirror - Shared-memory state mirroring between processes
//!
//! This library keeps typed object collections in sync across processes
//! through a named shared-memory region, and streams high-rate signals
//! through a lock-free ring.
//!
//! # Architecture
//!
//! - **Transport session**: a region holding a small header and a change log
//!   (`PlacedRingBuffer`), guarded by a cross-process mutex
//! - **Reconciliation**: `LocalCollection` publishes creates, updates and
//!   deletes; `RemoteCollection` mirrors them on the other side
//! - **Signals**: `SignalWriter` / `SignalReader` over a single-producer,
//!   multi-consumer block ring that never blocks the producer
//!
//! # Recovery
//!
//! A session whose owner stops heartbeating is treated as stale and rebuilt
//! by the next process that joins. Readers that fall behind the change log
//! resynchronize from the oldest entry and ask for a snapshot.

pub mod atomic;
pub mod bindings;
pub mod error;
pub mod event;
pub mod mutex;
pub mod placed_ring;
pub mod reconcile;
pub mod region;
pub mod session;
pub mod signal;
pub mod spmc;
pub mod view;

pub use error::{MirrorError, Result};
pub use event::{ChangeEvent, ChangeEventType, EventPayload, FieldMask, ObjectEvent, ObjectId};
pub use mutex::{InterprocessMutex, MutexBackend};
pub use reconcile::{
    pump, Collection, InboundCollection, IndexHooks, LocalCollection, NoIndex, PumpStats,
    Reconciled, RemoteCollection,
};
pub use region::{Backing, SharedRegion};
pub use session::{SessionConfig, SessionState, Transaction, TransportSession};
pub use signal::{SignalConfig, SignalReader, SignalWriter, StartAt};
pub use spmc::ReadOutcome;
pub use view::MemoryView;

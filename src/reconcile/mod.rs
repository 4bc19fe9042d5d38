//! Object reconciliation over a transport session
//!
//! A collection mirrors a set of typed objects between processes. Each side
//! holds one of two roles:
//!
//! - [`LocalCollection`]: this process owns the objects. Local calls create,
//!   mutate and remove them; [`LocalCollection::flush`] turns the pending
//!   changes into change events.
//! - [`RemoteCollection`]: objects are spawned and destroyed by inbound change
//!   events through a factory callback.
//!
//! Keeping the roles in separate types means a remote mirror has no local
//! mutation entry points and a local collection cannot be driven by inbound
//! events.
//!
//! Field data is opaque here. Generated accessors implement [`Reconciled`] and
//! know how fields are laid out for a given [`FieldMask`].

mod local;
mod remote;

pub use local::LocalCollection;
pub use remote::RemoteCollection;

use crate::error::Result;
use crate::event::{ChangeEventType, EventPayload, FieldMask, ObjectEvent, ObjectId, ALL_COLLECTIONS};
use crate::session::TransportSession;
use crate::view::MemoryView;
use std::collections::HashSet;

/// An object that can be mirrored field by field
pub trait Reconciled {
    /// Bytes needed to encode the fields in `fields`
    fn encoded_len(&self, fields: FieldMask) -> usize;

    /// Encode the fields in `fields` into `out` (exactly `encoded_len` bytes)
    fn encode(&self, fields: FieldMask, out: MemoryView<'_>);

    /// Decode `data`, which holds the fields in `encoded`, and apply the ones
    /// in `accept`
    fn apply(&mut self, encoded: FieldMask, accept: FieldMask, data: MemoryView<'_>);

    /// Called before the object leaves its collection
    fn removed(&mut self) {}
}

/// Secondary index notifications
pub trait IndexHooks<T> {
    fn on_insert(&mut self, _id: ObjectId, _object: &T) {}

    /// Only called when an indexed field changed
    fn on_update(&mut self, _id: ObjectId, _object: &T, _fields: FieldMask) {}

    fn on_remove(&mut self, _id: ObjectId, _object: &T) {}
}

/// Hooks that do nothing
#[derive(Debug, Default, Clone, Copy)]
pub struct NoIndex;

impl<T> IndexHooks<T> for NoIndex {}

/// Read access shared by both collection roles
pub trait Collection<T> {
    fn collection_id(&self) -> u32;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn get(&self, id: ObjectId) -> Option<&T>;

    fn contains(&self, id: ObjectId) -> bool {
        self.get(id).is_some()
    }

    /// Ids in ascending order
    fn ids(&self) -> Vec<ObjectId>;
}

/// A collection that accepts inbound change events
pub trait InboundCollection {
    fn collection_id(&self) -> u32;

    /// Apply a create, update, upsert or delete. Returns false if it was a no-op.
    fn apply_event(&mut self, event: &ObjectEvent<'_>) -> bool;

    /// Drop every object missing from `authoritative`. Returns how many went.
    fn process_full_reconcile(&mut self, authoritative: &HashSet<ObjectId>) -> usize;

    /// The peer went away; drop everything. Returns how many went.
    fn process_shutdown(&mut self) -> usize;
}

/// Outcome of one [`pump`] call
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PumpStats {
    /// Events that changed a collection
    pub applied: usize,
    /// Events for unregistered collections, unknown tags, or no-ops
    pub skipped: usize,
    /// Entries were evicted before they were read; ask the owner for a snapshot
    pub resync_needed: bool,
}

/// Drain the session's change log into `collections`.
///
/// Returns immediately without locking when nothing is queued. Fails only if
/// the lock is not acquired in `timeout_ms`.
pub fn pump(
    session: &mut TransportSession,
    timeout_ms: u32,
    collections: &mut [&mut dyn InboundCollection],
) -> Result<PumpStats> {
    if !session.needs_processing() {
        return Ok(PumpStats::default());
    }

    session.transact(timeout_ms, |tx| {
        let mut stats = PumpStats::default();
        loop {
            if tx.has_missed_entries() {
                tracing::warn!(
                    oldest = tx.changelog().min_id(),
                    "change-log entries evicted before they were read"
                );
                tx.resync_to_oldest();
                stats.resync_needed = true;
            }
            if !tx.has_next() {
                break;
            }
            let applied = match tx.next_entry() {
                Some(event) => match event.payload() {
                    Some(payload) => dispatch(&payload, collections),
                    None => {
                        tracing::debug!(id = event.id, tag = event.tag, "skipping unknown change event");
                        false
                    }
                },
                None => {
                    tracing::debug!("skipping truncated change event");
                    false
                }
            };
            if applied {
                stats.applied += 1;
            } else {
                stats.skipped += 1;
            }
        }
        Ok(stats)
    })
}

fn dispatch(payload: &EventPayload<'_>, collections: &mut [&mut dyn InboundCollection]) -> bool {
    match payload {
        EventPayload::Object(event) => collections
            .iter_mut()
            .find(|c| c.collection_id() == event.collection_id)
            .map(|c| c.apply_event(event))
            .unwrap_or(false),
        EventPayload::FullReconcile { collection_id, ids } => {
            let authoritative: HashSet<ObjectId> = ids.iter().collect();
            collections
                .iter_mut()
                .find(|c| c.collection_id() == *collection_id)
                .map(|c| {
                    c.process_full_reconcile(&authoritative);
                    true
                })
                .unwrap_or(false)
        }
        EventPayload::Shutdown { collection_id } => {
            let mut any = false;
            for c in collections.iter_mut() {
                if *collection_id == ALL_COLLECTIONS || c.collection_id() == *collection_id {
                    c.process_shutdown();
                    any = true;
                }
            }
            any
        }
    }
}

/// Route an object event to the matching remote operation
pub(crate) fn apply_object_event<T, H>(
    collection: &mut RemoteCollection<T, H>,
    event: &ObjectEvent<'_>,
) -> bool
where
    T: Reconciled,
    H: IndexHooks<T>,
{
    match event.kind {
        ChangeEventType::CreateObject => {
            collection.process_create(event.object_id, event.fields, event.data)
        }
        ChangeEventType::UpdateObject => {
            collection.process_update(event.object_id, event.fields, event.data)
        }
        ChangeEventType::UpsertObject => {
            collection.process_upsert(event.object_id, event.fields, event.data)
        }
        ChangeEventType::DeleteObject => collection.process_delete(event.object_id),
        ChangeEventType::FullReconcile | ChangeEventType::Shutdown => false,
    }
}

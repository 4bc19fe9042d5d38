//! Collection owned by this process

use super::{Collection, IndexHooks, NoIndex, Reconciled};
use crate::error::Result;
use crate::event::{ChangeEventType, FieldMask, ObjectId};
use crate::session::Transaction;
use std::collections::BTreeMap;

/// Change waiting for the next flush
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pending {
    Created,
    Updated(FieldMask),
    Deleted,
}

/// Objects created and mutated locally, published as change events
pub struct LocalCollection<T, H = NoIndex> {
    collection_id: u32,
    objects: BTreeMap<ObjectId, T>,
    pending: BTreeMap<ObjectId, Pending>,
    indexed_fields: FieldMask,
    hooks: H,
}

impl<T: Reconciled> LocalCollection<T, NoIndex> {
    /// Create a new collection without secondary indexes
    pub fn new(collection_id: u32) -> Self {
        Self::with_hooks(collection_id, FieldMask::EMPTY, NoIndex)
    }
}

impl<T: Reconciled, H: IndexHooks<T>> LocalCollection<T, H> {
    /// Create a new collection whose `hooks` see changes to `indexed_fields`
    pub fn with_hooks(collection_id: u32, indexed_fields: FieldMask, hooks: H) -> Self {
        Self {
            collection_id,
            objects: BTreeMap::new(),
            pending: BTreeMap::new(),
            indexed_fields,
            hooks,
        }
    }

    pub fn hooks(&self) -> &H {
        &self.hooks
    }

    /// Add a new object. Returns false if `id` is taken.
    pub fn add_object(&mut self, id: ObjectId, object: T) -> bool {
        if self.objects.contains_key(&id) {
            return false;
        }
        self.hooks.on_insert(id, &object);
        self.objects.insert(id, object);
        // A delete still queued for this id is superseded by the create
        self.pending.insert(id, Pending::Created);
        true
    }

    /// Remove an object, returning it.
    ///
    /// An object that never reached the change log leaves no trace.
    pub fn remove_object(&mut self, id: ObjectId) -> Option<T> {
        let object = self.objects.get_mut(&id)?;
        self.hooks.on_remove(id, object);
        object.removed();
        let object = self.objects.remove(&id)?;
        match self.pending.get(&id) {
            Some(Pending::Created) => {
                self.pending.remove(&id);
            }
            _ => {
                self.pending.insert(id, Pending::Deleted);
            }
        }
        Some(object)
    }

    /// Mutate an object through `f` and mark `fields` dirty
    pub fn modify<R>(&mut self, id: ObjectId, fields: FieldMask, f: impl FnOnce(&mut T) -> R) -> Option<R> {
        let object = self.objects.get_mut(&id)?;
        let result = f(object);
        if fields.intersects(self.indexed_fields) {
            self.hooks.on_update(id, object, fields & self.indexed_fields);
        }
        self.mark_dirty(id, fields);
        Some(result)
    }

    /// Mark `fields` of an existing object for the next flush
    pub fn mark_dirty(&mut self, id: ObjectId, fields: FieldMask) {
        if fields.is_empty() || !self.objects.contains_key(&id) {
            return;
        }
        let next = match self.pending.get(&id) {
            Some(Pending::Created) => Pending::Created,
            Some(Pending::Updated(mask)) => Pending::Updated(*mask | fields),
            Some(Pending::Deleted) | None => Pending::Updated(fields),
        };
        self.pending.insert(id, next);
    }

    /// Number of objects with unflushed changes
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Write the pending change for `id`.
    ///
    /// A new object is written in full, a modified one with its dirty fields,
    /// and an id with no object becomes a delete. An object with nothing
    /// pending is written as a full upsert.
    pub fn write_changes(&mut self, tx: &mut Transaction<'_>, id: ObjectId) -> Result<()> {
        match self.objects.get(&id) {
            None => {
                tx.write_object_event(
                    ChangeEventType::DeleteObject,
                    id,
                    self.collection_id,
                    FieldMask::EMPTY,
                    0,
                )?;
            }
            Some(object) => {
                let (kind, fields) = match self.pending.get(&id) {
                    Some(Pending::Created) => (ChangeEventType::CreateObject, FieldMask::ALL),
                    Some(Pending::Updated(mask)) => (ChangeEventType::UpdateObject, *mask),
                    Some(Pending::Deleted) | None => (ChangeEventType::UpsertObject, FieldMask::ALL),
                };
                write_object(tx, kind, self.collection_id, id, object, fields)?;
            }
        }
        self.pending.remove(&id);
        Ok(())
    }

    /// Publish every pending change in id order.
    ///
    /// Stops at the first failure; changes not yet written stay pending.
    pub fn flush(&mut self, tx: &mut Transaction<'_>) -> Result<usize> {
        let ids: Vec<ObjectId> = self.pending.keys().copied().collect();
        for id in &ids {
            self.write_changes(tx, *id)?;
        }
        if !ids.is_empty() {
            tracing::trace!(collection = self.collection_id, count = ids.len(), "flushed changes");
        }
        Ok(ids.len())
    }

    /// Publish the whole collection so a lagging mirror can rebuild itself.
    ///
    /// Every object goes out as an upsert, followed by a full reconcile
    /// listing the ids that exist.
    pub fn write_snapshot(&mut self, tx: &mut Transaction<'_>) -> Result<()> {
        for (id, object) in &self.objects {
            write_object(
                tx,
                ChangeEventType::UpsertObject,
                self.collection_id,
                *id,
                object,
                FieldMask::ALL,
            )?;
        }
        let ids: Vec<ObjectId> = self.objects.keys().copied().collect();
        tx.write_full_reconcile(self.collection_id, &ids)?;
        self.pending.clear();
        tracing::debug!(collection = self.collection_id, objects = ids.len(), "wrote snapshot");
        Ok(())
    }

    /// Tell mirrors this collection is going away
    pub fn write_shutdown(&self, tx: &mut Transaction<'_>) -> Result<()> {
        tx.write_shutdown(self.collection_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (ObjectId, &T)> {
        self.objects.iter().map(|(id, o)| (*id, o))
    }
}

fn write_object<T: Reconciled>(
    tx: &mut Transaction<'_>,
    kind: ChangeEventType,
    collection_id: u32,
    id: ObjectId,
    object: &T,
    fields: FieldMask,
) -> Result<()> {
    let data = tx.write_object_event(kind, id, collection_id, fields, object.encoded_len(fields))?;
    object.encode(fields, data);
    Ok(())
}

impl<T: Reconciled, H: IndexHooks<T>> Collection<T> for LocalCollection<T, H> {
    fn collection_id(&self) -> u32 {
        self.collection_id
    }

    fn len(&self) -> usize {
        self.objects.len()
    }

    fn get(&self, id: ObjectId) -> Option<&T> {
        self.objects.get(&id)
    }

    fn ids(&self) -> Vec<ObjectId> {
        self.objects.keys().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::{Journal, Marker, LABEL, X, Y};
    use super::*;

    fn id(n: u128) -> ObjectId {
        ObjectId::from_u128(n)
    }

    fn marker(x: i32) -> Marker {
        Marker {
            x,
            ..Marker::default()
        }
    }

    #[test]
    fn test_add_and_duplicate() {
        let mut c: LocalCollection<Marker> = LocalCollection::new(7);
        assert!(c.add_object(id(1), marker(1)));
        assert!(!c.add_object(id(1), marker(2)));
        assert_eq!(c.len(), 1);
        assert_eq!(c.get(id(1)).map(|m| m.x), Some(1));
        assert_eq!(c.collection_id(), 7);
    }

    #[test]
    fn test_pending_transitions() {
        let mut c: LocalCollection<Marker> = LocalCollection::new(1);
        c.add_object(id(1), marker(1));
        c.modify(id(1), X, |m| m.x = 5);
        assert_eq!(c.pending.get(&id(1)), Some(&Pending::Created));

        c.pending.clear();
        c.modify(id(1), X, |m| m.x = 6);
        c.modify(id(1), Y, |m| m.y = 6);
        assert_eq!(c.pending.get(&id(1)), Some(&Pending::Updated(X | Y)));

        let removed = c.remove_object(id(1)).unwrap();
        assert!(removed.removed);
        assert_eq!(c.pending.get(&id(1)), Some(&Pending::Deleted));
    }

    #[test]
    fn test_remove_before_flush_leaves_nothing() {
        let mut c: LocalCollection<Marker> = LocalCollection::new(1);
        c.add_object(id(3), marker(3));
        assert!(c.remove_object(id(3)).is_some());
        assert_eq!(c.pending_len(), 0);
        assert!(c.remove_object(id(3)).is_none());
    }

    #[test]
    fn test_modify_missing() {
        let mut c: LocalCollection<Marker> = LocalCollection::new(1);
        assert!(c.modify(id(9), X, |m| m.x = 1).is_none());
        c.mark_dirty(id(9), X);
        assert_eq!(c.pending_len(), 0);
    }

    #[test]
    fn test_index_hooks() {
        let mut c = LocalCollection::with_hooks(1, LABEL, Journal::default());
        c.add_object(id(1), marker(1));
        c.modify(id(1), X, |m| m.x = 2);
        c.modify(id(1), X | LABEL, |m| m.label = 3);
        c.remove_object(id(1));

        let journal = c.hooks();
        assert_eq!(journal.inserted, vec![id(1)]);
        assert_eq!(journal.updated, vec![(id(1), LABEL)]);
        assert_eq!(journal.removed, vec![id(1)]);
    }
}

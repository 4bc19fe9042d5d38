//! Collection mirrored from another process

use super::{apply_object_event, Collection, IndexHooks, InboundCollection, NoIndex, Reconciled};
use crate::event::{FieldMask, ObjectEvent, ObjectId};
use crate::view::MemoryView;
use std::collections::{BTreeMap, HashSet};

type Factory<T> = Box<dyn FnMut(ObjectId) -> T + Send>;

/// Objects spawned and destroyed by inbound change events
pub struct RemoteCollection<T, H = NoIndex> {
    collection_id: u32,
    objects: BTreeMap<ObjectId, T>,
    inbound_fields: FieldMask,
    indexed_fields: FieldMask,
    create: Factory<T>,
    hooks: H,
}

impl<T: Reconciled> RemoteCollection<T, NoIndex> {
    /// Create a new mirror that accepts `inbound_fields` and builds objects with `create`
    pub fn new(
        collection_id: u32,
        inbound_fields: FieldMask,
        create: impl FnMut(ObjectId) -> T + Send + 'static,
    ) -> Self {
        Self::with_hooks(collection_id, inbound_fields, FieldMask::EMPTY, create, NoIndex)
    }
}

impl<T: Reconciled, H: IndexHooks<T>> RemoteCollection<T, H> {
    pub fn with_hooks(
        collection_id: u32,
        inbound_fields: FieldMask,
        indexed_fields: FieldMask,
        create: impl FnMut(ObjectId) -> T + Send + 'static,
        hooks: H,
    ) -> Self {
        Self {
            collection_id,
            objects: BTreeMap::new(),
            inbound_fields,
            indexed_fields,
            create: Box::new(create),
            hooks,
        }
    }

    pub fn hooks(&self) -> &H {
        &self.hooks
    }

    pub fn inbound_fields(&self) -> FieldMask {
        self.inbound_fields
    }

    /// Spawn an object through the factory and apply its fields.
    ///
    /// A create for an id already present is applied as an update.
    pub fn process_create(&mut self, id: ObjectId, fields: FieldMask, data: MemoryView<'_>) -> bool {
        if self.objects.contains_key(&id) {
            return self.process_update(id, fields, data);
        }
        let mut object = (self.create)(id);
        let accept = fields & self.inbound_fields;
        if !accept.is_empty() {
            object.apply(fields, accept, data);
        }
        self.hooks.on_insert(id, &object);
        self.objects.insert(id, object);
        true
    }

    /// Apply inbound fields to an existing object.
    ///
    /// Ignored when none of `fields` are inbound or the object is unknown.
    pub fn process_update(&mut self, id: ObjectId, fields: FieldMask, data: MemoryView<'_>) -> bool {
        let accept = fields & self.inbound_fields;
        if accept.is_empty() {
            return false;
        }
        let Some(object) = self.objects.get_mut(&id) else {
            tracing::trace!(collection = self.collection_id, object = %id, "update for unknown object");
            return false;
        };
        object.apply(fields, accept, data);
        if accept.intersects(self.indexed_fields) {
            self.hooks.on_update(id, object, accept & self.indexed_fields);
        }
        true
    }

    /// Update if present, create otherwise
    pub fn process_upsert(&mut self, id: ObjectId, fields: FieldMask, data: MemoryView<'_>) -> bool {
        if self.objects.contains_key(&id) {
            self.process_update(id, fields, data)
        } else {
            self.process_create(id, fields, data)
        }
    }

    /// Remove an object. Returns false if it was unknown.
    pub fn process_delete(&mut self, id: ObjectId) -> bool {
        let Some(object) = self.objects.get_mut(&id) else {
            return false;
        };
        self.hooks.on_remove(id, object);
        object.removed();
        self.objects.remove(&id);
        true
    }

    /// Remove every object whose id is missing from `authoritative`
    pub fn process_full_reconcile(&mut self, authoritative: &HashSet<ObjectId>) -> usize {
        let stale: Vec<ObjectId> = self
            .objects
            .keys()
            .filter(|id| !authoritative.contains(id))
            .copied()
            .collect();
        for id in &stale {
            self.process_delete(*id);
        }
        if !stale.is_empty() {
            tracing::debug!(collection = self.collection_id, removed = stale.len(), "full reconcile");
        }
        stale.len()
    }

    /// Remove every object
    pub fn process_shutdown(&mut self) -> usize {
        let ids: Vec<ObjectId> = self.objects.keys().copied().collect();
        for id in &ids {
            self.process_delete(*id);
        }
        tracing::info!(collection = self.collection_id, removed = ids.len(), "peer shut down");
        ids.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (ObjectId, &T)> {
        self.objects.iter().map(|(id, o)| (*id, o))
    }
}

impl<T: Reconciled, H: IndexHooks<T>> Collection<T> for RemoteCollection<T, H> {
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

impl<T: Reconciled, H: IndexHooks<T>> InboundCollection for RemoteCollection<T, H> {
    fn collection_id(&self) -> u32 {
        self.collection_id
    }

    fn apply_event(&mut self, event: &ObjectEvent<'_>) -> bool {
        apply_object_event(self, event)
    }

    fn process_full_reconcile(&mut self, authoritative: &HashSet<ObjectId>) -> usize {
        RemoteCollection::process_full_reconcile(self, authoritative)
    }

    fn process_shutdown(&mut self) -> usize {
        RemoteCollection::process_shutdown(self)
    }
}

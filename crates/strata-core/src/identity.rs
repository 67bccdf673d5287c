//! Identity table: live object identity ↔ durable reference id
//!
//! Slots are keyed by [`PersistenceReference`] and hold the object weakly, so
//! an object the agent no longer references can disappear. While an object is
//! scheduled for the delta being written, its slot additionally holds a strong
//! pin, which keeps it alive until the delta commits or aborts.
//!
//! # Invariants
//!
//! - At most one association per [`PersistenceKey`]
//! - A reference id, once minted, is never minted again
//! - `next_id` is greater than every reference id in the table

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Weak};

use crate::object::{ManagedObject, ObjectHandle};
use crate::types::{LifecycleState, PersistenceKey, PersistenceReference};

/// Binding of one live object to its reference id and lifecycle state
#[derive(Debug)]
pub struct PersistenceAssociation {
    object: Weak<ManagedObject>,
    pin: Option<ObjectHandle>,
    reference: PersistenceReference,
    state: LifecycleState,
    marked: bool,
    persisted: bool,
}

impl PersistenceAssociation {
    fn new(object: &ObjectHandle, reference: PersistenceReference) -> Self {
        Self {
            object: Arc::downgrade(object),
            pin: None,
            reference,
            state: LifecycleState::New,
            marked: false,
            persisted: false,
        }
    }

    /// The object, or `None` if it has already vanished
    pub fn object(&self) -> Option<ObjectHandle> {
        self.object.upgrade()
    }

    pub fn reference(&self) -> PersistenceReference {
        self.reference
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    pub fn is_active(&self) -> bool {
        self.state.is_active()
    }

    /// Scheduled for the delta currently being written
    pub fn is_marked(&self) -> bool {
        self.marked
    }

    /// Part of a committed delta, or read back from one
    pub fn is_persisted(&self) -> bool {
        self.persisted
    }

    pub fn is_vanished(&self) -> bool {
        self.object.strong_count() == 0
    }

    pub(crate) fn set_state(&mut self, state: LifecycleState) {
        self.state = state;
    }

    pub(crate) fn set_persisted(&mut self) {
        self.persisted = true;
    }

    /// Schedule for the current delta. Returns `false` if already scheduled
    /// or if the object has vanished.
    pub(crate) fn mark(&mut self) -> bool {
        if self.marked {
            return false;
        }
        match self.object.upgrade() {
            Some(object) => {
                self.pin = Some(object);
                self.marked = true;
                true
            }
            None => false,
        }
    }

    pub(crate) fn unmark(&mut self) {
        self.marked = false;
        self.pin = None;
    }
}

/// All associations of one agent
#[derive(Debug)]
pub struct IdentityTable {
    slots: BTreeMap<PersistenceReference, PersistenceAssociation>,
    by_key: HashMap<PersistenceKey, PersistenceReference>,
    next_id: u32,
    /// Objects read during rehydration, in read order. Holds them strongly
    /// until the live set has been handed to the agent.
    rehydrated: Option<Vec<ObjectHandle>>,
}

impl Default for IdentityTable {
    fn default() -> Self {
        Self::new()
    }
}

impl IdentityTable {
    pub fn new() -> Self {
        Self {
            slots: BTreeMap::new(),
            by_key: HashMap::new(),
            next_id: 0,
            rehydrated: None,
        }
    }

    /// Identity lookup that registers the object as `New` if it is unknown
    pub fn find_or_create(&mut self, object: &ObjectHandle) -> &mut PersistenceAssociation {
        let reference = match self.by_key.get(&object.key()).copied() {
            Some(reference) if self.slots.contains_key(&reference) => reference,
            _ => {
                let reference = PersistenceReference::new(self.next_id);
                self.next_id += 1;
                self.by_key.insert(object.key(), reference);
                reference
            }
        };
        self.slots
            .entry(reference)
            .or_insert_with(|| PersistenceAssociation::new(object, reference))
    }

    pub fn find(&self, object: &ObjectHandle) -> Option<&PersistenceAssociation> {
        self.by_key
            .get(&object.key())
            .and_then(|reference| self.slots.get(reference))
    }

    /// Reverse lookup by reference id
    pub fn get(&self, reference: PersistenceReference) -> Option<&PersistenceAssociation> {
        self.slots.get(&reference)
    }

    pub fn get_mut(&mut self, reference: PersistenceReference) -> Option<&mut PersistenceAssociation> {
        self.slots.get_mut(&reference)
    }

    /// Live object registered under `reference`
    pub fn resolve(&self, reference: PersistenceReference) -> Option<ObjectHandle> {
        self.slots.get(&reference).and_then(|a| a.object())
    }

    /// Bind an id read off the wire to a freshly allocated object.
    ///
    /// Any previous binding of either the id or the object is replaced.
    pub fn create(
        &mut self,
        object: &ObjectHandle,
        reference: PersistenceReference,
    ) -> &mut PersistenceAssociation {
        if let Some(old) = self.slots.remove(&reference) {
            if let Some(old_object) = old.object() {
                self.by_key.remove(&old_object.key());
            }
        }
        if let Some(previous) = self.by_key.insert(object.key(), reference) {
            if previous != reference {
                self.slots.remove(&previous);
            }
        }
        if reference.id() >= self.next_id {
            self.next_id = reference.id() + 1;
        }
        self.slots
            .entry(reference)
            .or_insert_with(|| PersistenceAssociation::new(object, reference))
    }

    pub fn iter(&self) -> impl Iterator<Item = &PersistenceAssociation> {
        self.slots.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut PersistenceAssociation> {
        self.slots.values_mut()
    }

    /// References currently scheduled, ascending
    pub fn marked(&self) -> Vec<PersistenceReference> {
        self.slots
            .values()
            .filter(|a| a.is_marked())
            .map(|a| a.reference())
            .collect()
    }

    /// Unschedule everything and release pins
    pub fn clear_marks(&mut self) {
        for association in self.slots.values_mut() {
            association.unmark();
        }
    }

    pub fn next_id(&self) -> u32 {
        self.next_id
    }

    /// Raise the id counter. Never lowers it below an id already in use.
    pub fn set_next_id(&mut self, next_id: u32) {
        let floor = self
            .slots
            .keys()
            .next_back()
            .map(|r| r.id() + 1)
            .unwrap_or(0);
        self.next_id = next_id.max(floor).max(self.next_id);
    }

    /// Drop associations whose object has vanished and which are not
    /// scheduled. Returns how many were dropped.
    pub fn purge(&mut self) -> usize {
        let before = self.slots.len();
        let mut dropped = HashSet::new();
        self.slots.retain(|reference, association| {
            let keep = association.is_marked() || !association.is_vanished();
            if !keep {
                dropped.insert(*reference);
            }
            keep
        });
        if !dropped.is_empty() {
            self.by_key.retain(|_, reference| !dropped.contains(reference));
        }
        before - self.slots.len()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub(crate) fn begin_rehydration(&mut self) {
        self.rehydrated = Some(Vec::new());
    }

    pub(crate) fn record_read(&mut self, object: &ObjectHandle) {
        if let Some(read) = self.rehydrated.as_mut() {
            read.push(Arc::clone(object));
        }
    }

    pub(crate) fn end_rehydration(&mut self) -> Vec<ObjectHandle> {
        self.rehydrated.take().unwrap_or_default()
    }
}

//! Envelopes: batches of Add/Change/Remove/Bulk effects on live objects

use serde::{Deserialize, Serialize};
use std::slice;

use crate::object::ObjectHandle;
use crate::types::LifecycleState;

/// Kind of effect a tuple has on its objects
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvelopeAction {
    Add,
    Change,
    Remove,
    Bulk,
}

impl EnvelopeAction {
    /// Lifecycle state an object enters when this action is applied
    pub fn target_state(self) -> LifecycleState {
        match self {
            EnvelopeAction::Add | EnvelopeAction::Change | EnvelopeAction::Bulk => {
                LifecycleState::Active
            }
            EnvelopeAction::Remove => LifecycleState::Inactive,
        }
    }
}

/// One effect inside an envelope
#[derive(Debug, Clone)]
pub enum EnvelopeTuple {
    Add(ObjectHandle),
    Change(ObjectHandle),
    Remove(ObjectHandle),
    /// A collection added in one step
    Bulk(Vec<ObjectHandle>),
}

impl EnvelopeTuple {
    pub fn action(&self) -> EnvelopeAction {
        match self {
            EnvelopeTuple::Add(_) => EnvelopeAction::Add,
            EnvelopeTuple::Change(_) => EnvelopeAction::Change,
            EnvelopeTuple::Remove(_) => EnvelopeAction::Remove,
            EnvelopeTuple::Bulk(_) => EnvelopeAction::Bulk,
        }
    }

    /// Objects the tuple names
    pub fn objects(&self) -> &[ObjectHandle] {
        match self {
            EnvelopeTuple::Add(obj) | EnvelopeTuple::Change(obj) | EnvelopeTuple::Remove(obj) => {
                slice::from_ref(obj)
            }
            EnvelopeTuple::Bulk(objects) => objects,
        }
    }

    /// Rebuild a tuple from its decoded parts
    pub(crate) fn from_parts(action: EnvelopeAction, mut objects: Vec<ObjectHandle>) -> Option<Self> {
        match action {
            EnvelopeAction::Bulk => Some(EnvelopeTuple::Bulk(objects)),
            _ if objects.len() != 1 => None,
            EnvelopeAction::Add => objects.pop().map(EnvelopeTuple::Add),
            EnvelopeAction::Change => objects.pop().map(EnvelopeTuple::Change),
            EnvelopeAction::Remove => objects.pop().map(EnvelopeTuple::Remove),
        }
    }
}

/// A batch of effects published together
#[derive(Debug, Clone)]
pub struct Envelope {
    tuples: Vec<EnvelopeTuple>,
    persistable: bool,
}

impl Default for Envelope {
    fn default() -> Self {
        Self {
            tuples: Vec::new(),
            persistable: true,
        }
    }
}

impl Envelope {
    pub fn new() -> Self {
        Self::default()
    }

    /// An envelope whose effects must never reach storage
    pub fn transient() -> Self {
        Self {
            tuples: Vec::new(),
            persistable: false,
        }
    }

    pub fn with_add(mut self, obj: &ObjectHandle) -> Self {
        self.add(obj);
        self
    }

    pub fn with_change(mut self, obj: &ObjectHandle) -> Self {
        self.change(obj);
        self
    }

    pub fn with_remove(mut self, obj: &ObjectHandle) -> Self {
        self.remove(obj);
        self
    }

    pub fn add(&mut self, obj: &ObjectHandle) {
        self.tuples.push(EnvelopeTuple::Add(ObjectHandle::clone(obj)));
    }

    pub fn change(&mut self, obj: &ObjectHandle) {
        self.tuples.push(EnvelopeTuple::Change(ObjectHandle::clone(obj)));
    }

    pub fn remove(&mut self, obj: &ObjectHandle) {
        self.tuples.push(EnvelopeTuple::Remove(ObjectHandle::clone(obj)));
    }

    pub fn bulk(&mut self, objects: impl IntoIterator<Item = ObjectHandle>) {
        self.tuples.push(EnvelopeTuple::Bulk(objects.into_iter().collect()));
    }

    pub fn push(&mut self, tuple: EnvelopeTuple) {
        self.tuples.push(tuple);
    }

    pub fn tuples(&self) -> &[EnvelopeTuple] {
        &self.tuples
    }

    pub fn is_persistable(&self) -> bool {
        self.persistable
    }

    /// Every object named by any tuple, in order
    pub fn objects(&self) -> impl Iterator<Item = &ObjectHandle> {
        self.tuples.iter().flat_map(|t| t.objects().iter())
    }

    pub fn len(&self) -> usize {
        self.tuples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tuples.is_empty()
    }
}

/// Snapshot of one subscriber's envelope queues
#[derive(Debug, Clone, Default)]
pub struct SubscriberState {
    /// Subscriber name, unique within the agent
    pub subscriber: String,
    /// Envelopes delivered but not yet consumed
    pub pending: Vec<Envelope>,
    /// Envelopes of the subscriber's open transaction
    pub in_flight: Vec<Envelope>,
}

impl SubscriberState {
    pub fn new(subscriber: impl Into<String>) -> Self {
        Self {
            subscriber: subscriber.into(),
            ..Self::default()
        }
    }

    /// Every object reachable from either queue
    pub fn objects(&self) -> impl Iterator<Item = &ObjectHandle> {
        self.pending
            .iter()
            .chain(self.in_flight.iter())
            .flat_map(|e| e.objects())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::ManagedObject;

    #[test]
    fn test_target_states() {
        assert_eq!(EnvelopeAction::Add.target_state(), LifecycleState::Active);
        assert_eq!(EnvelopeAction::Change.target_state(), LifecycleState::Active);
        assert_eq!(EnvelopeAction::Bulk.target_state(), LifecycleState::Active);
        assert_eq!(EnvelopeAction::Remove.target_state(), LifecycleState::Inactive);
    }

    #[test]
    fn test_envelope_objects_flatten_bulk() {
        let a = ManagedObject::empty("a");
        let b = ManagedObject::empty("b");
        let c = ManagedObject::empty("c");

        let mut envelope = Envelope::new().with_add(&a);
        envelope.bulk(vec![b.clone(), c.clone()]);

        let keys: Vec<_> = envelope.objects().map(|o| o.key()).collect();
        assert_eq!(keys, vec![a.key(), b.key(), c.key()]);
        assert_eq!(envelope.len(), 2);
    }

    #[test]
    fn test_transient_envelope_is_not_persistable() {
        assert!(Envelope::new().is_persistable());
        assert!(!Envelope::transient().is_persistable());
    }

    #[test]
    fn test_from_parts_rejects_malformed_single_tuples() {
        let a = ManagedObject::empty("a");
        assert!(EnvelopeTuple::from_parts(EnvelopeAction::Add, vec![]).is_none());
        assert!(EnvelopeTuple::from_parts(EnvelopeAction::Remove, vec![a.clone(), a.clone()]).is_none());
        assert!(matches!(
            EnvelopeTuple::from_parts(EnvelopeAction::Change, vec![a]),
            Some(EnvelopeTuple::Change(_))
        ));
    }
}

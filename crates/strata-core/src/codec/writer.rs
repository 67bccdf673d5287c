//! Write path: object graph → wire form with reference substitution

use std::collections::{HashMap, HashSet};

use crate::codec::wire::{
    ReferencePlan, WireEnvelope, WireObject, WireRoot, WireSubscriber, WireTuple, WireValue,
};
use crate::envelope::{Envelope, SubscriberState};
use crate::error::PayloadError;
use crate::identity::IdentityTable;
use crate::object::{ObjectHandle, Value};
use crate::types::{LifecycleState, PersistenceKey, PersistenceReference};

/// Walks objects for one delta, consulting the identity table at every
/// nested object to decide between writing it in full and writing its id.
///
/// One writer covers one delta stream: untracked objects written in full are
/// remembered, and any later sighting in the same stream becomes a
/// [`WireValue::Shared`] back-reference.
#[derive(Debug)]
pub struct GraphWriter<'t> {
    table: &'t IdentityTable,
    handles: HashMap<PersistenceKey, u32>,
    handle_log: Vec<PersistenceKey>,
    skipped: HashSet<PersistenceReference>,
}

impl<'t> GraphWriter<'t> {
    pub fn new(table: &'t IdentityTable) -> Self {
        Self {
            table,
            handles: HashMap::new(),
            handle_log: Vec::new(),
            skipped: HashSet::new(),
        }
    }

    /// Treat a scheduled object as not written in this delta
    pub fn skip(&mut self, reference: PersistenceReference) {
        self.skipped.insert(reference);
    }

    /// Write one object of the write-set in full.
    ///
    /// On failure nothing about the stream changes, so the caller may simply
    /// leave the object out of the delta.
    pub fn write_root(
        &mut self,
        object: &ObjectHandle,
    ) -> Result<(WireRoot, ReferencePlan), PayloadError> {
        let (reference, state) = match self.table.find(object) {
            Some(association) => (Some(association.reference()), association.state()),
            None => (None, LifecycleState::New),
        };

        let checkpoint = self.handle_log.len();
        let mut plan = vec![reference];
        match self.encode_object(object, &mut plan) {
            Ok(encoded) => Ok((
                WireRoot {
                    state,
                    object: encoded,
                },
                plan,
            )),
            Err(err) => {
                self.rollback(checkpoint);
                Err(err)
            }
        }
    }

    /// Write an envelope. Its objects are expected to be scheduled or
    /// already persisted, so they normally come out as references.
    pub fn write_envelope(&mut self, envelope: &Envelope) -> Result<WireEnvelope, PayloadError> {
        let checkpoint = self.handle_log.len();
        let result = self.encode_envelope(envelope);
        if result.is_err() {
            self.rollback(checkpoint);
        }
        result
    }

    pub fn write_subscriber(
        &mut self,
        state: &SubscriberState,
    ) -> Result<WireSubscriber, PayloadError> {
        let checkpoint = self.handle_log.len();
        let result = self.encode_subscriber(state);
        if result.is_err() {
            self.rollback(checkpoint);
        }
        result
    }

    fn encode_envelope(&mut self, envelope: &Envelope) -> Result<WireEnvelope, PayloadError> {
        let mut scratch = ReferencePlan::new();
        let mut tuples = Vec::with_capacity(envelope.len());
        for tuple in envelope.tuples() {
            let mut objects = Vec::with_capacity(tuple.objects().len());
            for object in tuple.objects() {
                objects.push(self.substitute(object, &mut scratch)?);
            }
            tuples.push(WireTuple {
                action: tuple.action(),
                objects,
            });
        }
        Ok(WireEnvelope {
            persistable: envelope.is_persistable(),
            tuples,
        })
    }

    fn encode_subscriber(&mut self, state: &SubscriberState) -> Result<WireSubscriber, PayloadError> {
        let pending = state
            .pending
            .iter()
            .map(|e| self.encode_envelope(e))
            .collect::<Result<Vec<_>, _>>()?;
        let in_flight = state
            .in_flight
            .iter()
            .map(|e| self.encode_envelope(e))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(WireSubscriber {
            subscriber: state.subscriber.clone(),
            pending,
            in_flight,
        })
    }

    /// Forget stream handles assigned after `checkpoint`
    fn rollback(&mut self, checkpoint: usize) {
        for key in self.handle_log.drain(checkpoint..) {
            self.handles.remove(&key);
        }
    }

    fn assign_handle(&mut self, object: &ObjectHandle) -> u32 {
        let handle = self.handle_log.len() as u32;
        self.handles.insert(object.key(), handle);
        self.handle_log.push(object.key());
        handle
    }

    fn encode_object(
        &mut self,
        object: &ObjectHandle,
        plan: &mut ReferencePlan,
    ) -> Result<WireObject, PayloadError> {
        let handle = self.assign_handle(object);
        // Snapshot first: nested objects may point back at this one.
        let record = object.record();
        let mut fields = Vec::with_capacity(record.len());
        for (name, value) in &record {
            let encoded = self.encode_value(object, name, value, plan)?;
            fields.push((name.clone(), encoded));
        }
        Ok(WireObject {
            handle,
            kind: object.kind().to_string(),
            fields,
        })
    }

    fn encode_value(
        &mut self,
        owner: &ObjectHandle,
        field: &str,
        value: &Value,
        plan: &mut ReferencePlan,
    ) -> Result<WireValue, PayloadError> {
        Ok(match value {
            Value::Null => WireValue::Null,
            Value::Bool(v) => WireValue::Bool(*v),
            Value::Int(v) => WireValue::Int(*v),
            Value::Float(v) => WireValue::Float(*v),
            Value::Text(v) => WireValue::Text(v.clone()),
            Value::Bytes(v) => WireValue::Bytes(v.clone()),
            Value::List(items) => {
                let mut encoded = Vec::with_capacity(items.len());
                for item in items {
                    encoded.push(self.encode_value(owner, field, item, plan)?);
                }
                WireValue::List(encoded)
            }
            Value::Map(entries) => {
                let mut encoded = Vec::with_capacity(entries.len());
                for (key, item) in entries {
                    encoded.push((key.clone(), self.encode_value(owner, field, item, plan)?));
                }
                WireValue::Map(encoded)
            }
            Value::Ref(target) => self.substitute(target, plan)?,
            Value::Link(weak) => match weak.upgrade() {
                Some(target) => WireValue::Link(Box::new(self.substitute(&target, plan)?)),
                None => WireValue::Null,
            },
            Value::Transient(type_name) => {
                return Err(PayloadError::NotSerializable {
                    kind: owner.kind().to_string(),
                    field: field.to_string(),
                    type_name: type_name.clone(),
                })
            }
        })
    }

    /// Decide how a nested object appears in the stream
    fn substitute(
        &mut self,
        target: &ObjectHandle,
        plan: &mut ReferencePlan,
    ) -> Result<WireValue, PayloadError> {
        if let Some(association) = self.table.find(target) {
            let reference = association.reference();
            let written_here = association.is_marked() && !self.skipped.contains(&reference);
            if written_here || association.is_persisted() {
                plan.push(Some(reference));
                return Ok(WireValue::Reference(reference));
            }
            // Known but neither scheduled nor durable: not available yet.
            plan.push(None);
            return Ok(WireValue::Unresolved);
        }

        plan.push(None);
        if let Some(&handle) = self.handles.get(&target.key()) {
            return Ok(WireValue::Shared(handle));
        }
        Ok(WireValue::Object(self.encode_object(target, plan)?))
    }
}

/// Result of writing a whole write-set
#[derive(Debug)]
pub struct EncodedWriteSet<'t> {
    /// Writer positioned after the write-set, for the delta's trailing sections
    pub writer: GraphWriter<'t>,
    pub roots: Vec<WireRoot>,
    pub plans: Vec<ReferencePlan>,
    /// References of the objects actually written, in write order
    pub written: Vec<PersistenceReference>,
    pub skipped: Vec<(PersistenceReference, PayloadError)>,
}

/// Write every object of `write_set` in order.
///
/// Objects that fail to serialize are left out. Because earlier objects may
/// already refer to a failed one by id, the set is rewritten without it until
/// no further object fails; a skipped object that was never persisted then
/// appears as [`WireValue::Unresolved`] instead of a dangling reference.
pub fn encode_write_set<'t>(
    table: &'t IdentityTable,
    write_set: &[PersistenceReference],
) -> EncodedWriteSet<'t> {
    let mut skipped: Vec<(PersistenceReference, PayloadError)> = Vec::new();
    loop {
        let mut writer = GraphWriter::new(table);
        for (reference, _) in &skipped {
            writer.skip(*reference);
        }

        let mut roots = Vec::with_capacity(write_set.len());
        let mut plans = Vec::with_capacity(write_set.len());
        let mut written = Vec::with_capacity(write_set.len());
        let mut failed = Vec::new();

        for reference in write_set {
            if skipped.iter().any(|(r, _)| r == reference) {
                continue;
            }
            let Some(object) = table.resolve(*reference) else {
                continue;
            };
            match writer.write_root(&object) {
                Ok((root, plan)) => {
                    roots.push(root);
                    plans.push(plan);
                    written.push(*reference);
                }
                Err(err) => failed.push((*reference, err)),
            }
        }

        if failed.is_empty() {
            return EncodedWriteSet {
                writer,
                roots,
                plans,
                written,
                skipped,
            };
        }
        skipped.extend(failed);
    }
}

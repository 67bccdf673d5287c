//! Read path: wire form → live objects, consulting and populating the identity table

use std::collections::HashMap;
use std::slice;
use std::sync::Arc;

use crate::codec::wire::{
    ReferencePlan, WireEnvelope, WireObject, WireRoot, WireSubscriber, WireValue,
};
use crate::envelope::{Envelope, EnvelopeAction, EnvelopeTuple, SubscriberState};
use crate::error::StreamIntegrityError;
use crate::identity::IdentityTable;
use crate::object::{ManagedObject, ObjectHandle, Record, Value};
use crate::types::{LifecycleState, PersistenceReference};

type Result<T> = std::result::Result<T, StreamIntegrityError>;

/// Walks one delta's reference plans alongside its payload.
///
/// Reading happens in two passes. The plan pass binds every written object
/// to a live instance, reusing the one the identity table already holds for
/// that id, so a later delta overwrites in place. The resolve pass decodes
/// fields; by then every id written in this delta is bound, so a reference
/// to an object written further down the same delta resolves as well.
#[derive(Debug)]
pub struct GraphReader<'t> {
    table: &'t mut IdentityTable,
    stream: HashMap<u32, ObjectHandle>,
}

impl<'t> GraphReader<'t> {
    pub fn new(table: &'t mut IdentityTable) -> Self {
        Self {
            table,
            stream: HashMap::new(),
        }
    }

    /// Read a delta's write-set. Returns the written objects in write order.
    pub fn read_roots(
        &mut self,
        roots: Vec<WireRoot>,
        plans: &[ReferencePlan],
    ) -> Result<Vec<ObjectHandle>> {
        if roots.len() != plans.len() {
            return Err(StreamIntegrityError::ObjectCountMismatch {
                declared: plans.len(),
                actual: roots.len(),
            });
        }

        let handles = roots
            .iter()
            .zip(plans)
            .enumerate()
            .map(|(index, (root, plan))| self.plan_root(index, root, plan))
            .collect::<Result<Vec<_>>>()?;

        for (index, ((root, plan), handle)) in roots.into_iter().zip(plans).zip(&handles).enumerate() {
            let slots = plan.get(1..).unwrap_or(&[]);
            let mut cursor = PlanCursor::planned(index, slots);
            let record = self.decode_fields(root.object.fields, &mut cursor)?;
            cursor.finish()?;
            handle.replace_record(record);
        }

        Ok(handles)
    }

    /// Read an envelope from the delta's trailing sections
    pub fn read_envelope(&mut self, wire: WireEnvelope) -> Result<Envelope> {
        let mut envelope = if wire.persistable {
            Envelope::new()
        } else {
            Envelope::transient()
        };
        let mut cursor = PlanCursor::unplanned();

        for tuple in wire.tuples {
            let mut objects = Vec::with_capacity(tuple.objects.len());
            for value in tuple.objects {
                match self.decode_value(value, &mut cursor)? {
                    Value::Ref(object) => objects.push(object),
                    // The object was never made durable; the effect is lost with it.
                    Value::Null => {}
                    _ => {
                        return Err(StreamIntegrityError::MalformedEnvelope {
                            action: format!("{:?}", tuple.action),
                        })
                    }
                }
            }
            if objects.is_empty() && tuple.action != EnvelopeAction::Bulk {
                tracing::warn!(action = ?tuple.action, "Dropping envelope tuple whose object was not persisted");
                continue;
            }
            let rebuilt = EnvelopeTuple::from_parts(tuple.action, objects).ok_or_else(|| {
                StreamIntegrityError::MalformedEnvelope {
                    action: format!("{:?}", tuple.action),
                }
            })?;
            envelope.push(rebuilt);
        }

        Ok(envelope)
    }

    pub fn read_subscriber(&mut self, wire: WireSubscriber) -> Result<SubscriberState> {
        let pending = wire
            .pending
            .into_iter()
            .map(|e| self.read_envelope(e))
            .collect::<Result<Vec<_>>>()?;
        let in_flight = wire
            .in_flight
            .into_iter()
            .map(|e| self.read_envelope(e))
            .collect::<Result<Vec<_>>>()?;
        Ok(SubscriberState {
            subscriber: wire.subscriber,
            pending,
            in_flight,
        })
    }

    fn plan_root(&mut self, index: usize, root: &WireRoot, plan: &ReferencePlan) -> Result<ObjectHandle> {
        let Some(Some(reference)) = plan.first().copied() else {
            return Err(StreamIntegrityError::MissingRootReference { index });
        };
        let object = self.bind(reference, &root.object.kind, Some(root.state));
        self.stream.insert(root.object.handle, Arc::clone(&object));
        Ok(object)
    }

    /// Live instance for `reference`: the existing one, or a fresh one
    /// registered under that id.
    fn bind(
        &mut self,
        reference: PersistenceReference,
        kind: &str,
        state: Option<LifecycleState>,
    ) -> ObjectHandle {
        let object = match self.table.resolve(reference) {
            Some(existing) => existing,
            None => {
                let fresh = ManagedObject::empty(kind);
                self.table.create(&fresh, reference);
                fresh
            }
        };
        if let Some(association) = self.table.get_mut(reference) {
            if let Some(state) = state {
                association.set_state(state);
            }
            association.set_persisted();
        }
        self.table.record_read(&object);
        object
    }

    fn decode_fields(
        &mut self,
        fields: Vec<(String, WireValue)>,
        cursor: &mut PlanCursor<'_>,
    ) -> Result<Record> {
        let mut record = Record::new();
        for (name, value) in fields {
            let decoded = self.decode_value(value, cursor)?;
            record.insert(name, decoded);
        }
        Ok(record)
    }

    fn decode_value(&mut self, value: WireValue, cursor: &mut PlanCursor<'_>) -> Result<Value> {
        Ok(match value {
            WireValue::Null => Value::Null,
            WireValue::Bool(v) => Value::Bool(v),
            WireValue::Int(v) => Value::Int(v),
            WireValue::Float(v) => Value::Float(v),
            WireValue::Text(v) => Value::Text(v),
            WireValue::Bytes(v) => Value::Bytes(v),
            WireValue::List(items) => Value::List(
                items
                    .into_iter()
                    .map(|item| self.decode_value(item, cursor))
                    .collect::<Result<Vec<_>>>()?,
            ),
            WireValue::Map(entries) => {
                let mut map = std::collections::BTreeMap::new();
                for (key, item) in entries {
                    let decoded = self.decode_value(item, cursor)?;
                    map.insert(key, decoded);
                }
                Value::Map(map)
            }
            WireValue::Reference(reference) => {
                cursor.expect(Some(reference))?;
                let object = self
                    .table
                    .resolve(reference)
                    .ok_or(StreamIntegrityError::UnknownReference(reference))?;
                Value::Ref(object)
            }
            WireValue::Shared(handle) => {
                cursor.expect(None)?;
                let object = self
                    .stream
                    .get(&handle)
                    .cloned()
                    .ok_or(StreamIntegrityError::UnknownStreamHandle(handle))?;
                Value::Ref(object)
            }
            WireValue::Unresolved => {
                cursor.expect(None)?;
                Value::Null
            }
            WireValue::Object(object) => Value::Ref(self.decode_object(object, cursor)?),
            WireValue::Link(inner) => match self.decode_value(*inner, cursor)? {
                Value::Ref(object) => Value::link(&object),
                Value::Null => Value::Null,
                _ => return Err(StreamIntegrityError::MalformedLink),
            },
        })
    }

    fn decode_object(&mut self, wire: WireObject, cursor: &mut PlanCursor<'_>) -> Result<ObjectHandle> {
        let object = match cursor.next()? {
            None => ManagedObject::empty(&wire.kind),
            Some(reference) => self.bind(reference, &wire.kind, None),
        };
        // Registered before its fields so cycles back to it resolve.
        self.stream.insert(wire.handle, Arc::clone(&object));
        let record = self.decode_fields(wire.fields, cursor)?;
        object.replace_record(record);
        Ok(object)
    }
}

/// Position inside one root's reference plan.
///
/// Trailing sections carry no plan; there every slot reads as empty.
struct PlanCursor<'p> {
    index: usize,
    slots: Option<slice::Iter<'p, Option<PersistenceReference>>>,
}

impl<'p> PlanCursor<'p> {
    fn planned(index: usize, slots: &'p [Option<PersistenceReference>]) -> Self {
        Self {
            index,
            slots: Some(slots.iter()),
        }
    }

    fn unplanned() -> Self {
        Self {
            index: 0,
            slots: None,
        }
    }

    fn next(&mut self) -> Result<Option<PersistenceReference>> {
        match self.slots.as_mut() {
            None => Ok(None),
            Some(slots) => slots
                .next()
                .copied()
                .ok_or(StreamIntegrityError::PlanExhausted { index: self.index }),
        }
    }

    fn expect(&mut self, expected: Option<PersistenceReference>) -> Result<()> {
        if self.slots.is_none() {
            return Ok(());
        }
        let found = self.next()?;
        if found != expected {
            return Err(StreamIntegrityError::PlanMismatch { expected, found });
        }
        Ok(())
    }

    fn finish(self) -> Result<()> {
        match self.slots {
            Some(slots) if !slots.as_slice().is_empty() => {
                Err(StreamIntegrityError::PlanNotConsumed {
                    index: self.index,
                    remaining: slots.len(),
                })
            }
            _ => Ok(()),
        }
    }
}

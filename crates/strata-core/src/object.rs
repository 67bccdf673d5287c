//! Live objects managed by the persistence engine
//!
//! The engine treats the agent's domain model as opaque: every object is a
//! [`ManagedObject`] carrying a kind name and a record of named [`Value`]s.
//! Nested objects appear as [`Value::Ref`] and are what the serializer
//! intercepts. Objects are shared through [`ObjectHandle`]; identity is the
//! object's [`PersistenceKey`], never structural equality.
//!
//! A [`Value::Ref`] owns its target. Back-pointers of a pair that point at each
//! other use [`Value::Link`] instead, so the pair is freed once the agent drops
//! it and the identity table can reclaim both associations.

use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Weak};

use crate::types::PersistenceKey;

/// Field name → value, in deterministic order
pub type Record = BTreeMap<String, Value>;

/// Shared handle to a live object
pub type ObjectHandle = Arc<ManagedObject>;

/// A single field value
#[derive(Debug, Clone)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
    /// Reference to another live object
    Ref(ObjectHandle),
    /// Non-owning reference. Written like [`Value::Ref`] while the target is
    /// alive, as `Null` once it is gone.
    Link(Weak<ManagedObject>),
    /// Runtime-only state that has no serialized form (sockets, closures, ...).
    /// The string names the type for diagnostics.
    Transient(String),
}

impl Value {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&ObjectHandle> {
        match self {
            Value::Ref(handle) => Some(handle),
            _ => None,
        }
    }

    /// Target of a [`Value::Ref`] or of a [`Value::Link`] whose target is alive
    pub fn target(&self) -> Option<ObjectHandle> {
        match self {
            Value::Ref(handle) => Some(Arc::clone(handle)),
            Value::Link(weak) => weak.upgrade(),
            _ => None,
        }
    }

    /// Non-owning reference to `target`
    pub fn link(target: &ObjectHandle) -> Value {
        Value::Link(Arc::downgrade(target))
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Append every directly nested object reference, in walk order
    pub fn collect_refs(&self, out: &mut Vec<ObjectHandle>) {
        match self {
            Value::Ref(handle) => out.push(Arc::clone(handle)),
            Value::Link(weak) => out.extend(weak.upgrade()),
            Value::List(items) => items.iter().for_each(|v| v.collect_refs(out)),
            Value::Map(entries) => entries.values().for_each(|v| v.collect_refs(out)),
            _ => {}
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a.to_bits() == b.to_bits(),
            (Value::Text(a), Value::Text(b)) => a == b,
            (Value::Bytes(a), Value::Bytes(b)) => a == b,
            (Value::List(a), Value::List(b)) => a == b,
            (Value::Map(a), Value::Map(b)) => a == b,
            (Value::Ref(a), Value::Ref(b)) => a.key() == b.key(),
            (Value::Link(a), Value::Link(b)) => Weak::ptr_eq(a, b),
            (Value::Transient(a), Value::Transient(b)) => a == b,
            _ => false,
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v as i64)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Bytes(v)
    }
}

impl From<ObjectHandle> for Value {
    fn from(v: ObjectHandle) -> Self {
        Value::Ref(v)
    }
}

impl From<&ObjectHandle> for Value {
    fn from(v: &ObjectHandle) -> Self {
        Value::Ref(Arc::clone(v))
    }
}

/// A live object of the agent's state.
///
/// The kind is fixed at allocation; the record is mutable in place, which is
/// how rehydration overwrites an object that a later delta mentions again.
pub struct ManagedObject {
    key: PersistenceKey,
    kind: String,
    record: RwLock<Record>,
}

impl ManagedObject {
    /// Allocate a new object with a freshly minted identity
    pub fn new(kind: impl Into<String>, record: Record) -> ObjectHandle {
        Arc::new(Self {
            key: PersistenceKey::mint(),
            kind: kind.into(),
            record: RwLock::new(record),
        })
    }

    /// Allocate an object with no fields
    pub fn empty(kind: impl Into<String>) -> ObjectHandle {
        Self::new(kind, Record::new())
    }

    /// Start building an object field by field
    pub fn builder(kind: impl Into<String>) -> ObjectBuilder {
        ObjectBuilder {
            kind: kind.into(),
            record: Record::new(),
        }
    }

    pub fn key(&self) -> PersistenceKey {
        self.key
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// Clone of a single field
    pub fn get(&self, field: &str) -> Option<Value> {
        self.record.read().get(field).cloned()
    }

    /// Set a field, returning the previous value
    pub fn set(&self, field: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.record.write().insert(field.into(), value.into())
    }

    pub fn remove(&self, field: &str) -> Option<Value> {
        self.record.write().remove(field)
    }

    /// Snapshot of the whole record
    pub fn record(&self) -> Record {
        self.record.read().clone()
    }

    /// Overwrite the whole record in place
    pub fn replace_record(&self, record: Record) {
        *self.record.write() = record;
    }

    /// Objects this object references directly, in field order
    pub fn references(&self) -> Vec<ObjectHandle> {
        let mut out = Vec::new();
        for value in self.record.read().values() {
            value.collect_refs(&mut out);
        }
        out
    }

    /// Identity comparison
    pub fn same(a: &ObjectHandle, b: &ObjectHandle) -> bool {
        a.key == b.key
    }
}

impl fmt::Debug for ManagedObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // References may be cyclic; never descend into the record here.
        f.debug_struct("ManagedObject")
            .field("key", &self.key)
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

/// Builder for [`ManagedObject`]
#[derive(Debug)]
pub struct ObjectBuilder {
    kind: String,
    record: Record,
}

impl ObjectBuilder {
    pub fn field(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.record.insert(name.into(), value.into());
        self
    }

    pub fn build(self) -> ObjectHandle {
        ManagedObject::new(self.kind, self.record)
    }
}

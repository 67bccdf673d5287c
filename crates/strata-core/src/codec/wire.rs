//! Serialized shape of objects and envelopes inside a delta

use serde::{Deserialize, Serialize};

use crate::envelope::EnvelopeAction;
use crate::types::{LifecycleState, PersistenceReference};

/// Reference ids encountered while writing one object, in walk order.
///
/// The first slot is the written object itself; every later slot belongs to a
/// nested object. `None` means no existing reference id was substituted there.
pub type ReferencePlan = Vec<Option<PersistenceReference>>;

/// Encoded field value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WireValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
    List(Vec<WireValue>),
    Map(Vec<(String, WireValue)>),
    /// Object written in full at this position
    Object(WireObject),
    /// Object written in full elsewhere, in this delta or an earlier one
    Reference(PersistenceReference),
    /// Untracked object already written in full earlier in this delta
    Shared(u32),
    /// Known object that is not available yet
    Unresolved,
    /// Non-owning reference, wrapping how its target was written
    Link(Box<WireValue>),
}

/// An object written in full
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireObject {
    /// Position of the object in the delta's stream, for [`WireValue::Shared`]
    pub handle: u32,
    pub kind: String,
    pub fields: Vec<(String, WireValue)>,
}

/// One entry of a delta's write-set
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireRoot {
    pub state: LifecycleState,
    pub object: WireObject,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireTuple {
    pub action: EnvelopeAction,
    pub objects: Vec<WireValue>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireEnvelope {
    pub persistable: bool,
    pub tuples: Vec<WireTuple>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireSubscriber {
    pub subscriber: String,
    pub pending: Vec<WireEnvelope>,
    pub in_flight: Vec<WireEnvelope>,
}

impl WireObject {
    pub fn field(&self, name: &str) -> Option<&WireValue> {
        self.fields.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }
}

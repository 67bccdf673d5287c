//! Reference-substituting serializer/deserializer pair
//!
//! The writer turns objects into [`wire`] form. Wherever it meets a nested
//! object the identity table already knows, it writes that object's
//! [`PersistenceReference`](crate::types::PersistenceReference) instead of its
//! contents and notes the id in the object's [`ReferencePlan`]. The reader
//! consumes the plan in the same order to bind ids back to live instances.

pub mod reader;
pub mod wire;
pub mod writer;

pub use reader::GraphReader;
pub use wire::{
    ReferencePlan, WireEnvelope, WireObject, WireRoot, WireSubscriber, WireTuple, WireValue,
};
pub use writer::{encode_write_set, EncodedWriteSet, GraphWriter};

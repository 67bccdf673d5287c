//! Strata Core - Identity-preserving incremental persistence for agents
//!
//! Strata snapshots an agent's live object graph into an append-only sequence
//! of deltas, so the agent can resume exactly where it left off after a crash
//! or a controlled restart.
//!
//! # Architecture
//!
//! Strata is built on four layers:
//!
//! 1. **Identity Table** (`identity`): live object ↔ durable reference id, held weakly
//! 2. **Codec** (`codec`): serializer/deserializer pair that substitutes reference ids for known objects
//! 3. **Delta Controller** (`controller`): persist, rehydrate, consolidate, roll back
//! 4. **Storage** (`storage`): file, SQLite, in-memory and no-op backends
//!
//! # Quick Start
//!
//! ```
//! use strata_core::{DeltaController, Envelope, Epoch, ManagedObject, PersistenceConfig};
//! use strata_core::storage::MemoryStore;
//!
//! let store = MemoryStore::new();
//! let controller = DeltaController::new("agent-1", store.clone(), PersistenceConfig::default());
//!
//! // One epoch: a task is added
//! let task = ManagedObject::builder("task").field("verb", "transport").build();
//! controller
//!     .persist(Epoch::new().with_envelope(Envelope::new().with_add(&task)))
//!     .unwrap();
//!
//! // After a restart, the same state comes back
//! let restarted = DeltaController::new("agent-1", store, PersistenceConfig::default());
//! let mut live = Envelope::new();
//! let state = restarted.rehydrate(&mut live).unwrap().unwrap();
//! assert_eq!(state.active, 1);
//! assert_eq!(live.objects().next().unwrap().kind(), "task");
//! ```
//!
//! # Guarantees
//!
//! - **Identity**: each logical entity has exactly one in-memory instance, however many deltas mention it
//! - **Incrementality**: unchanged objects are written as reference ids, not rewritten
//! - **Atomicity**: a delta and its sequence numbers are committed together or not at all
//! - **Consolidation**: every `consolidation_period` deltas a full snapshot replaces the older ones

#![deny(unsafe_code)]
#![warn(rust_2018_idioms, missing_debug_implementations, clippy::all)]

pub mod codec;
pub mod config;
pub mod controller;
pub mod delta;
pub mod envelope;
pub mod error;
pub mod identity;
pub mod object;
pub mod registry;
pub mod repair;
pub mod storage;
pub mod types;

// Re-exports for convenience
pub use config::{BackendConfig, PersistenceConfig};
pub use controller::{
    DeltaController, Epoch, EpochPhase, PersistOutcome, RehydratedState, RuntimeParticipant,
};
pub use delta::{inspect_delta, DeltaSummary};
pub use envelope::{Envelope, EnvelopeAction, EnvelopeTuple, SubscriberState};
pub use error::{PayloadError, PersistenceError, Result, ResultExt, StreamIntegrityError};
pub use identity::{IdentityTable, PersistenceAssociation};
pub use object::{ManagedObject, ObjectHandle, Record, Value};
pub use registry::ControllerRegistry;
pub use repair::LinkRule;
pub use storage::DeltaStore;
pub use types::{LifecycleState, PersistenceKey, PersistenceReference, SequenceNumbers};

/// Version of Strata Core
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Name of the crate
pub const NAME: &str = env!("CARGO_PKG_NAME");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
        assert_eq!(NAME, "strata-core");
    }
}

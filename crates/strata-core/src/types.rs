//! Core types for Strata
//!
//! This module defines the fundamental identifiers used by the engine:
//! - Persistence references (durable object ids)
//! - Persistence keys (in-memory object identity)
//! - Sequence numbers (valid delta range)
//! - Lifecycle states

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Durable handle standing in for a persisted object.
///
/// Minted once by the identity table and never reused within one agent's
/// persistence history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PersistenceReference(u32);

impl PersistenceReference {
    pub fn new(id: u32) -> Self {
        Self(id)
    }

    pub fn id(self) -> u32 {
        self.0
    }
}

impl fmt::Display for PersistenceReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

static NEXT_KEY: AtomicU64 = AtomicU64::new(1);

/// In-memory identity of one live object.
///
/// Every [`ManagedObject`](crate::object::ManagedObject) receives a fresh key
/// when it is allocated; two handles denote the same entity exactly when
/// their keys are equal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PersistenceKey(u64);

impl PersistenceKey {
    /// Mint a key that no other object of this process carries
    pub fn mint() -> Self {
        Self(NEXT_KEY.fetch_add(1, Ordering::Relaxed))
    }

    pub fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for PersistenceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "key:{}", self.0)
    }
}

/// The half-open range `[first, current)` of readable deltas.
///
/// `first` is the oldest delta still required to rebuild state, `current`
/// the number the next delta will be written under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct SequenceNumbers {
    pub first: u32,
    pub current: u32,
}

impl SequenceNumbers {
    pub fn new(first: u32, current: u32) -> Self {
        debug_assert!(first <= current, "first {} > current {}", first, current);
        Self { first, current }
    }

    /// Number of deltas in the range
    pub fn len(&self) -> u32 {
        self.current.saturating_sub(self.first)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, delta: u32) -> bool {
        delta >= self.first && delta < self.current
    }

    pub fn iter(&self) -> std::ops::Range<u32> {
        self.first..self.current
    }

    /// The delta that carries undistributed envelopes and runtime state
    pub fn last(&self) -> Option<u32> {
        if self.is_empty() {
            None
        } else {
            Some(self.current - 1)
        }
    }
}

impl fmt::Display for SequenceNumbers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.first, self.current)
    }
}

/// Lifecycle of an object as reported by envelopes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleState {
    /// Known to the identity table but never added by an envelope
    New,
    /// Added or changed; part of the agent's live state
    Active,
    /// Removed; kept only so references keep resolving
    Inactive,
}

impl LifecycleState {
    pub fn is_active(self) -> bool {
        matches!(self, LifecycleState::Active)
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

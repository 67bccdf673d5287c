//! Error types for Strata Core
//!
//! This module defines all error types used throughout the persistence engine.
//! We use `thiserror` for ergonomic error definitions with automatic Display/Error implementations.
//!
//! The taxonomy follows how failures are recovered:
//!
//! - [`PayloadError`]: a single object cannot be serialized; the object is skipped.
//! - [`PersistenceError::TransactionAborted`]: a delta write failed and was rolled back.
//! - [`StreamIntegrityError`]: persisted bytes do not describe a consistent graph.
//! - [`PersistenceError::RehydrationFailed`]: replaying the delta chain failed; fatal.

use thiserror::Error;

use crate::types::{PersistenceReference, SequenceNumbers};

/// Result type alias for persistence operations
pub type Result<T> = std::result::Result<T, PersistenceError>;

/// Main error type for persistence operations
#[derive(Error, Debug)]
pub enum PersistenceError {
    /// Corrupted or truncated storage
    #[error("Stream integrity error: {0}")]
    StreamIntegrity(#[from] StreamIntegrityError),

    /// An object could not be serialized
    #[error("Payload error: {0}")]
    Payload(#[from] PayloadError),

    /// A delta write failed and was rolled back
    #[error("Delta {delta} aborted: {source}")]
    TransactionAborted {
        delta: u32,
        source: Box<PersistenceError>,
    },

    /// Replaying the delta chain failed; the agent must not continue
    #[error("Rehydration failed at delta {delta}: {source}")]
    RehydrationFailed {
        delta: u32,
        source: Box<PersistenceError>,
    },

    /// The controller refused to run because an earlier rehydration failed
    #[error("Controller for agent {0} is poisoned by a failed rehydration")]
    Poisoned(String),

    /// The backend already holds committed state that this controller has not read
    #[error("Agent {agent} has committed deltas {sequence}; rehydrate or clear before persisting")]
    NotRehydrated {
        agent: String,
        sequence: SequenceNumbers,
    },

    /// Requested delta is not present on the backend
    #[error("Delta {0} not found")]
    DeltaNotFound(u32),

    /// An agent may own only one controller per registry
    #[error("Agent {0} already has a registered controller")]
    AgentAlreadyRegistered(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Binary encoding errors
    #[error("Encoding error: {0}")]
    Encoding(#[from] bincode::Error),

    /// JSON errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML configuration errors
    #[error("Configuration parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    /// SQLite errors
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic error with context
    #[error("{context}: {source}")]
    WithContext {
        context: String,
        source: Box<PersistenceError>,
    },
}

/// Errors raised while decoding a delta whose bytes do not form a consistent graph
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StreamIntegrityError {
    #[error("Reference {0} does not resolve to any known object")]
    UnknownReference(PersistenceReference),

    #[error("Stream handle {0} does not name an object read earlier in this delta")]
    UnknownStreamHandle(u32),

    #[error("Reference plan for object {index} is exhausted")]
    PlanExhausted { index: usize },

    #[error("Reference plan mismatch: expected {expected:?}, found {found:?}")]
    PlanMismatch {
        expected: Option<PersistenceReference>,
        found: Option<PersistenceReference>,
    },

    #[error("Reference plan for object {index} has {remaining} unused entries")]
    PlanNotConsumed { index: usize, remaining: usize },

    #[error("Written object {index} carries no reference id")]
    MissingRootReference { index: usize },

    #[error("Delta declares {declared} objects but the payload holds {actual}")]
    ObjectCountMismatch { declared: usize, actual: usize },

    #[error("Link wraps something other than an object")]
    MalformedLink,

    #[error("Envelope tuple {action} names something other than an object")]
    MalformedEnvelope { action: String },

    #[error("Payload checksum mismatch in delta {0}")]
    ChecksumMismatch(u32),

    #[error("Unsupported delta format version {0}")]
    UnsupportedFormat(u16),
}

/// Errors related to serializing a single object
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PayloadError {
    #[error("Field {field} of {kind} holds non-serializable {type_name}")]
    NotSerializable {
        kind: String,
        field: String,
        type_name: String,
    },
}

impl PersistenceError {
    /// Add context to an error
    pub fn context(self, context: impl Into<String>) -> Self {
        Self::WithContext {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// True when the error reports corrupted or truncated storage
    pub fn is_stream_integrity(&self) -> bool {
        match self {
            Self::StreamIntegrity(_) => true,
            Self::TransactionAborted { source, .. }
            | Self::RehydrationFailed { source, .. }
            | Self::WithContext { source, .. } => source.is_stream_integrity(),
            _ => false,
        }
    }
}

/// Extension trait for adding context to Results
pub trait ResultExt<T> {
    /// Add context to a Result
    fn context(self, context: impl Into<String>) -> Result<T>;

    /// Add lazy context to a Result
    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String;
}

impl<T, E> ResultExt<T> for std::result::Result<T, E>
where
    E: Into<PersistenceError>,
{
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| Into::<PersistenceError>::into(e).context(context))
    }

    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| Into::<PersistenceError>::into(e).context(f()))
    }
}

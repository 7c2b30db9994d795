//! Error types shared across the data layer.
//!
//! Producer failures live in [`crate::api::ApiError`]; the types here cover
//! the storage substrate, construction-time misuse, and session renewal.

use thiserror::Error;

/// Failure reported by a [`crate::storage::SessionStorage`] backend.
///
/// These never escape the TTL store; they are logged and absorbed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    #[error("Storage quota exceeded: {needed} bytes needed, {available} available")]
    QuotaExceeded { needed: usize, available: usize },

    #[error("Storage unavailable: {0}")]
    Unavailable(String),

    #[error("Failed to encode value: {0}")]
    Encode(String),
}

/// Programmer error caught when a unit or pattern is built.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Producer has no label and no explicit cache key was given")]
    MissingKey,

    #[error("Invalidation pattern is empty")]
    EmptyPattern,

    #[error("Invalid key pattern {pattern:?}: {reason}")]
    InvalidPattern { pattern: String, reason: String },
}

/// Reason a session renewal was refused.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("No active session")]
    NoSession,

    #[error("Session is still within its window and does not need renewal")]
    NotDue,

    #[error("Maximum session extensions reached ({max})")]
    LimitReached { max: u32 },

    #[error("Failed to persist session: {0}")]
    Persist(#[from] StorageError),
}

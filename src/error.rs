//! Error types for the counter store, coordinator and fanout.

use crate::types::RequestId;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Backend failures raised by a [`CounterStore`](crate::store::CounterStore).
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Corruption detected: {0}")]
    Corruption(String),

    #[error("Checksum mismatch: expected {expected}, got {got}")]
    ChecksumMismatch { expected: u32, got: u32 },

    #[error("Invalid store format: {0}")]
    InvalidFormat(String),

    #[error("Store is locked by another process")]
    Locked,

    #[error("Store not initialized")]
    NotInitialized,

    #[error("Store already exists")]
    AlreadyExists,

    #[error("Store operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    /// Timeouts count as a failed attempt rather than a fatal error.
    pub fn is_timeout(&self) -> bool {
        matches!(self, StoreError::Timeout(_))
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::encode::Error> for StoreError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for StoreError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        StoreError::Deserialization(e.to_string())
    }
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Outcome of a failed `commit_mutation`.
///
/// The two conditional failures stay distinct here even though a coordinator
/// may choose to handle them the same way.
#[derive(Debug, Error)]
pub enum CommitError {
    #[error("Version conflict: expected {expected}, found {found}")]
    VersionConflict { expected: u64, found: u64 },

    #[error("Duplicate request: {0}")]
    DuplicateRequest(RequestId),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Why the last attempt of a mutation failed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConflictKind {
    VersionConflict,
    DuplicateRequest,
    Timeout,
}

impl fmt::Display for ConflictKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConflictKind::VersionConflict => "version conflict",
            ConflictKind::DuplicateRequest => "duplicate request",
            ConflictKind::Timeout => "timeout",
        };
        f.write_str(s)
    }
}

/// Caller-visible failures of a counter mutation.
#[derive(Debug, Error)]
pub enum CounterError {
    #[error("Value out of bounds: {attempted} (allowed 0..={max})")]
    OutOfBounds { attempted: i64, max: i64 },

    #[error("Max retries exceeded for counter update after {attempts} attempts (last: {last_conflict})")]
    RetriesExhausted {
        attempts: u32,
        last_conflict: ConflictKind,
    },

    #[error("Store unavailable: {0}")]
    StoreUnavailable(#[source] StoreError),

    #[error("Invalid delta: {0} (expected +1 or -1)")]
    InvalidDelta(i64),

    #[error("Invalid request: {0}")]
    Validation(String),
}

impl CounterError {
    /// Transport status code for the routing layer.
    pub fn status_code(&self) -> u16 {
        match self {
            CounterError::OutOfBounds { .. } => 400,
            CounterError::InvalidDelta(_) | CounterError::Validation(_) => 400,
            CounterError::RetriesExhausted { .. } => 409,
            CounterError::StoreUnavailable(_) => 500,
        }
    }

    /// Stable machine-readable error code.
    pub fn code(&self) -> &'static str {
        match self {
            CounterError::OutOfBounds { .. } => "VALUE_OUT_OF_BOUNDS",
            CounterError::InvalidDelta(_) | CounterError::Validation(_) => "VALIDATION_ERROR",
            CounterError::RetriesExhausted { .. } => "CONFLICT_ERROR",
            CounterError::StoreUnavailable(_) => "INTERNAL_ERROR",
        }
    }
}

/// Per-observer delivery failure. Never propagated past the broadcaster.
#[derive(Debug, Error)]
pub enum DeliveryError {
    /// The observer's channel no longer exists.
    #[error("Connection gone")]
    Gone,

    #[error("Delivery timed out after {0:?}")]
    Timeout(Duration),

    #[error("Delivery failed: {0}")]
    Failed(String),
}

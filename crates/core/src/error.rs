//! Error taxonomy shared by the store, stream, and codec contracts.

use thiserror::Error;

use crate::id::AggregateId;

/// Identifier parse/size failure.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdError {
    #[error("invalid identifier: {0}")]
    Invalid(String),
}

/// Failures of the append-only event store contract.
///
/// `Transient` covers the classified retriable set (serialization failures,
/// deadlocks); store implementations retry those internally before they ever
/// reach a caller. Everything unclassified is `Fatal` and surfaces as-is.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Another writer appended at or past the claimed version.
    #[error("version conflict on aggregate {id} at version {version}")]
    VersionConflict { id: AggregateId, version: u32 },

    /// The aggregate has been finalized; no further appends are accepted.
    #[error("aggregate {0} is finalized")]
    AggregateFinalized(AggregateId),

    /// Retriable persistence failure (serialization failure, deadlock).
    #[error("transient store failure: {0}")]
    Transient(String),

    /// Invalid request or unclassified persistence failure.
    #[error("store failure: {0}")]
    Fatal(String),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Transient(_))
    }

    pub fn is_version_conflict(&self) -> bool {
        matches!(self, StoreError::VersionConflict { .. })
    }
}

/// Failures of the publish/subscribe transport contract.
#[derive(Debug, Error)]
pub enum StreamError {
    /// Retriable transport failure (connection, timeout).
    #[error("transient transport failure: {0}")]
    Transient(String),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("transport failure: {0}")]
    Fatal(String),
}

impl StreamError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StreamError::Transient(_))
    }
}

/// Failures of the wire codec.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("unsupported frame version {0}")]
    UnsupportedVersion(u8),

    #[error("truncated frame")]
    Truncated,

    #[error("invalid frame: {0}")]
    Invalid(String),
}

/// Failures of the canonical value encoding and serializer registry.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValueError {
    /// A tagged value referenced a tag nobody registered.
    #[error("unregistered serializer tag: {0}")]
    UnknownTag(String),

    #[error("invalid value encoding: {0}")]
    Invalid(String),
}

impl From<ValueError> for CodecError {
    fn from(value: ValueError) -> Self {
        match value {
            ValueError::UnknownTag(tag) => CodecError::Invalid(format!("unregistered serializer tag: {tag}")),
            ValueError::Invalid(msg) => CodecError::Invalid(msg),
        }
    }
}

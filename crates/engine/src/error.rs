//! Engine error model.

use std::sync::Arc;

use thiserror::Error;

use arque_core::{StoreError, StreamError};

/// Failures surfaced by [`crate::Aggregate::process`] and the factory.
///
/// Domain errors are whatever a user handler returned; the engine never
/// retries them. Version conflicts are retried internally up to the
/// configured cap and only surface once the budget is spent.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("no command handler registered for type {0}")]
    CommandHandlerMissing(u32),

    /// Raised by a user handler; surfaced unchanged.
    #[error("domain error: {0}")]
    Domain(#[source] anyhow::Error),

    #[error(transparent)]
    Store(#[from] StoreError),

    /// Publication failed after a successful append (at-least-once; a retry
    /// may duplicate).
    #[error("publish failed: {0}")]
    Publish(#[from] StreamError),

    /// State snapshot (de)serialization failed.
    #[error("state serialization: {0}")]
    State(String),

    /// Shared failure of a memoized construction (other loaders of the same
    /// aggregate observe the same error).
    #[error("aggregate construction failed: {0}")]
    Construction(Arc<EngineError>),
}

use thiserror::Error;

use arque_core::{StoreError, StreamError};

/// Failures while starting or stopping long-running consumers.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Stream(#[from] StreamError),
}

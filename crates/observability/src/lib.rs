//! Observability: tracing/logging initialization for processes embedding
//! the runtime.

mod tracing;

pub use tracing::{init, init_with_default};

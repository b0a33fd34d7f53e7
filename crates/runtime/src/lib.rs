//! Long-running consumers: the fan-out broker and the projection runtime.

pub mod broker;
pub mod error;
pub mod projection;

#[cfg(test)]
mod integration_tests;

pub use broker::{Broker, BrokerHandle};
pub use error::RuntimeError;
pub use projection::{
    Projection, ProjectionContext, ProjectionEventHandler, ProjectionHandler, ProjectionOptions,
    projection_handler,
};

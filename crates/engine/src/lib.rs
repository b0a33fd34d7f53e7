//! The aggregate engine: command -> event transformation, replay with
//! snapshots, optimistic concurrency with bounded retry, and a bounded
//! cache of live aggregates.

pub mod aggregate;
pub mod error;
pub mod factory;

pub use aggregate::{
    Aggregate, AggregateOptions, Command, CommandContext, CommandHandler, EventApplier, EventDraft,
    ProcessOptions, command_handler, event_applier,
};
pub use error::EngineError;
pub use factory::{AggregateFactory, FactoryOptions, LoadOptions};

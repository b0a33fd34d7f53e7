pub mod in_memory;
pub mod postgres;
pub mod r#trait;

pub use in_memory::InMemoryEventStore;
pub use postgres::PostgresEventStore;
pub use r#trait::{AggregateQuery, EventBatch, EventQuery, EventStore, EventStream};

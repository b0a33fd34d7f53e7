//! Infrastructure layer: persistence, transport, and stream-registry
//! adapters behind the contracts the engine and runtime crates consume.

pub mod event_bus;
pub mod event_store;
pub mod stream_registry;

pub use event_bus::{
    DEFAULT_TOPIC_PREFIX, Delivery, DeliveryHandler, EventBus, InMemoryEventBus, MAIN_STREAM,
    PartitionKey, RawMessage, RawStreamBatch, RetryClassifier, StreamBatch, Subscriber,
    SubscribeOptions, topic_name,
};
pub use event_store::{
    AggregateQuery, EventBatch, EventQuery, EventStore, EventStream, InMemoryEventStore,
    PostgresEventStore,
};
pub use stream_registry::{
    CachedStreamRegistry, InMemoryStreamRegistry, PostgresStreamRegistry, StreamRegistry,
};

#[cfg(feature = "redis")]
pub use event_bus::RedisEventBus;

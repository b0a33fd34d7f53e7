//! Event publishing/subscription with per-key ordering.
//!
//! At-least-once delivery; consumers must be idempotent. Topics are named
//! `<prefix>.<stream>`, and every subscriber of a stream joins the consumer
//! group named after the topic, splitting partitions among themselves.
//! Events with equal `__ctx` metadata land on the same partition in arrival
//! order; events without it share a neutral partition.

pub mod in_memory;
#[cfg(feature = "redis")]
pub mod redis;

pub use in_memory::InMemoryEventBus;
#[cfg(feature = "redis")]
pub use redis::RedisEventBus;

use std::hash::{Hash, Hasher};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::BoxFuture;
use tokio::task::JoinHandle;

use arque_core::{Event, EventCodec, RetryPolicy, SerializerRegistry, StreamError, Value};

/// Default topic prefix.
pub const DEFAULT_TOPIC_PREFIX: &str = "arque";

/// The single ingress stream every aggregate publishes to.
pub const MAIN_STREAM: &str = "main";

/// Topic (and consumer group) name for a stream.
pub fn topic_name(prefix: &str, stream: &str) -> String {
    format!("{prefix}.{stream}")
}

/// Partition key derived from the `__ctx` metadata entry.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct PartitionKey(pub u64);

impl PartitionKey {
    /// Key shared by events without a `__ctx`.
    pub fn neutral() -> Self {
        Self(0)
    }

    pub fn for_event(event: &Event) -> Self {
        match event.ctx() {
            None => Self::neutral(),
            Some(ctx) => Self::for_ctx(ctx),
        }
    }

    pub fn for_ctx(ctx: &Value) -> Self {
        // Hash the canonical encoding so equal ctx values always agree.
        let canonical = SerializerRegistry::with_builtins()
            .encode(ctx)
            .map(|v| v.to_string())
            .unwrap_or_default();
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        canonical.hash(&mut hasher);
        Self(hasher.finish())
    }

    pub fn partition(&self, partitions: usize) -> usize {
        (self.0 % partitions.max(1) as u64) as usize
    }
}

/// A message as carried by the transport: partition key plus encoded frame.
#[derive(Debug, Clone)]
pub struct RawMessage {
    pub key: PartitionKey,
    pub frame: Bytes,
}

/// Decoded-mode publish batch.
#[derive(Debug, Clone)]
pub struct StreamBatch {
    pub stream: String,
    pub events: Vec<Event>,
}

/// Raw-mode publish batch: frames pass through verbatim, keeping their
/// original partition key (this is what preserves per-key order across the
/// broker fan-out).
#[derive(Debug, Clone)]
pub struct RawStreamBatch {
    pub stream: String,
    pub messages: Vec<RawMessage>,
}

/// What a subscriber's handler receives.
#[derive(Debug, Clone)]
pub enum Delivery {
    Raw(RawMessage),
    Event(Event),
}

impl Delivery {
    pub fn into_event(self) -> Option<Event> {
        match self {
            Delivery::Event(event) => Some(event),
            Delivery::Raw(_) => None,
        }
    }
}

/// Message handler invoked by the subscriber loop. Errors trigger the
/// retry/backoff policy of the subscription.
pub type DeliveryHandler =
    Arc<dyn Fn(Delivery) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Restricts which handler errors are retried; everything else is fatal for
/// the partition.
pub type RetryClassifier = Arc<dyn Fn(&anyhow::Error) -> bool + Send + Sync>;

#[derive(Clone)]
pub struct SubscribeOptions {
    /// Deliver frames without decoding.
    pub raw: bool,
    /// Retry only matching errors; `None` retries everything.
    pub retry: Option<RetryClassifier>,
    pub policy: RetryPolicy,
}

impl Default for SubscribeOptions {
    fn default() -> Self {
        Self {
            raw: false,
            retry: None,
            policy: RetryPolicy::subscriber(),
        }
    }
}

impl SubscribeOptions {
    pub fn raw() -> Self {
        Self { raw: true, ..Self::default() }
    }
}

/// Handle to a running subscription.
///
/// Dropping it abandons the worker tasks; call [`stop`](Self::stop) for a
/// graceful disconnect that lets any in-flight handler finish first.
pub struct Subscriber {
    shutdown: tokio::sync::watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl Subscriber {
    pub(crate) fn new(shutdown: tokio::sync::watch::Sender<bool>, tasks: Vec<JoinHandle<()>>) -> Self {
        Self { shutdown, tasks }
    }

    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        for task in self.tasks {
            let _ = task.await;
        }
    }
}

/// Ordered per-key event transport.
#[async_trait]
pub trait EventBus: Send + Sync {
    /// Publish decoded events; the bus encodes frames and derives partition
    /// keys from `__ctx`.
    async fn send_events(&self, batches: Vec<StreamBatch>) -> Result<(), StreamError>;

    /// Publish already-encoded frames verbatim with their carried keys.
    async fn send_raw(&self, batches: Vec<RawStreamBatch>) -> Result<(), StreamError>;

    /// Join the stream's consumer group and process messages with `handler`.
    async fn subscribe(
        &self,
        stream: &str,
        handler: DeliveryHandler,
        opts: SubscribeOptions,
    ) -> Result<Subscriber, StreamError>;

    /// The codec used for decoded-mode subscriptions.
    fn codec(&self) -> &EventCodec;
}

#[async_trait]
impl<B> EventBus for Arc<B>
where
    B: EventBus + ?Sized,
{
    async fn send_events(&self, batches: Vec<StreamBatch>) -> Result<(), StreamError> {
        (**self).send_events(batches).await
    }

    async fn send_raw(&self, batches: Vec<RawStreamBatch>) -> Result<(), StreamError> {
        (**self).send_raw(batches).await
    }

    async fn subscribe(
        &self,
        stream: &str,
        handler: DeliveryHandler,
        opts: SubscribeOptions,
    ) -> Result<Subscriber, StreamError> {
        (**self).subscribe(stream, handler, opts).await
    }

    fn codec(&self) -> &EventCodec {
        (**self).codec()
    }
}

//! The projection runtime: a supervised consumer applying event handlers
//! under an exactly-once-effect guarantee per (projection, aggregate).
//!
//! The transport is at-least-once; the checkpoint makes the effects
//! idempotent. For each decoded event: consult the checkpoint, skip
//! duplicates, invoke the handler, then advance the checkpoint. A handler
//! error propagates into the subscriber's retry loop and the event is
//! redelivered.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::FutureExt;
use futures::future::BoxFuture;
use tracing::{debug, warn};

use arque_core::{Event, ProjectionCheckpoint, StreamRegistration};
use arque_infra::{Delivery, DeliveryHandler, EventBus, EventStore, StreamRegistry, Subscriber, SubscribeOptions};

use crate::error::RuntimeError;

/// How often `wait_until_settled` re-checks the last-event clock.
const SETTLE_POLL: Duration = Duration::from_millis(500);

/// Shared state handed to every handler invocation (usually a handle to a
/// read-model store).
#[derive(Debug, Clone)]
pub struct ProjectionContext<S> {
    pub state: S,
}

pub type ProjectionHandler<S> =
    Arc<dyn Fn(ProjectionContext<S>, Event) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// A handler advertising the event type it consumes.
pub struct ProjectionEventHandler<S> {
    pub event_type: u32,
    pub handler: ProjectionHandler<S>,
}

/// Wrap an async closure as a typed projection handler.
pub fn projection_handler<S, F, Fut>(event_type: u32, f: F) -> ProjectionEventHandler<S>
where
    F: Fn(ProjectionContext<S>, Event) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    ProjectionEventHandler {
        event_type,
        handler: Arc::new(move |ctx, event| Box::pin(f(ctx, event))),
    }
}

#[derive(Debug, Copy, Clone, Default)]
pub struct ProjectionOptions {
    /// Skip registering with the stream registry on start (the registration
    /// is managed elsewhere).
    pub disable_save_stream: bool,
}

pub struct Projection<S> {
    store: Arc<dyn EventStore>,
    bus: Arc<dyn EventBus>,
    registry: Arc<dyn StreamRegistry>,
    handlers: Arc<HashMap<u32, ProjectionHandler<S>>>,
    projection_id: String,
    state: S,
    opts: ProjectionOptions,
    last_event_at: Arc<std::sync::Mutex<Instant>>,
    subscriber: tokio::sync::Mutex<Option<Subscriber>>,
}

impl<S> Projection<S>
where
    S: Clone + Send + Sync + 'static,
{
    pub fn new(
        store: Arc<dyn EventStore>,
        bus: Arc<dyn EventBus>,
        registry: Arc<dyn StreamRegistry>,
        handlers: Vec<ProjectionEventHandler<S>>,
        projection_id: impl Into<String>,
        state: S,
    ) -> Self {
        Self::with_options(store, bus, registry, handlers, projection_id, state, ProjectionOptions::default())
    }

    pub fn with_options(
        store: Arc<dyn EventStore>,
        bus: Arc<dyn EventBus>,
        registry: Arc<dyn StreamRegistry>,
        handlers: Vec<ProjectionEventHandler<S>>,
        projection_id: impl Into<String>,
        state: S,
        opts: ProjectionOptions,
    ) -> Self {
        let handlers = handlers.into_iter().map(|h| (h.event_type, h.handler)).collect();
        Self {
            store,
            bus,
            registry,
            handlers: Arc::new(handlers),
            projection_id: projection_id.into(),
            state,
            opts,
            last_event_at: Arc::new(std::sync::Mutex::new(Instant::now())),
            subscriber: tokio::sync::Mutex::new(None),
        }
    }

    pub fn projection_id(&self) -> &str {
        &self.projection_id
    }

    /// Register interest with the stream registry (this is what makes the
    /// broker route matching events here) and subscribe to our own stream.
    pub async fn start(&self) -> Result<(), RuntimeError> {
        if !self.opts.disable_save_stream {
            self.registry
                .save_stream(StreamRegistration {
                    id: self.projection_id.clone(),
                    events: self.handlers.keys().copied().collect(),
                    timestamp: Utc::now(),
                })
                .await?;
        }

        if let Ok(mut at) = self.last_event_at.lock() {
            *at = Instant::now();
        }

        let store = self.store.clone();
        let handlers = self.handlers.clone();
        let projection_id = self.projection_id.clone();
        let state = self.state.clone();
        let last_event_at = self.last_event_at.clone();

        let handler: DeliveryHandler = Arc::new(move |delivery| {
            let store = store.clone();
            let handlers = handlers.clone();
            let projection_id = projection_id.clone();
            let state = state.clone();
            let last_event_at = last_event_at.clone();

            async move {
                let Delivery::Event(event) = delivery else {
                    return Ok(());
                };

                if let Ok(mut at) = last_event_at.lock() {
                    *at = Instant::now();
                }

                let Some(handler) = handlers.get(&event.event_type) else {
                    warn!(projection = %projection_id, event_type = event.event_type, "no handler, dropping event");
                    return Ok(());
                };

                let should_process = store
                    .check_projection_checkpoint(&projection_id, event.aggregate)
                    .await?;
                if !should_process {
                    debug!(
                        projection = %projection_id,
                        aggregate_id = %event.aggregate.id,
                        version = event.aggregate.version,
                        "duplicate delivery, skipping"
                    );
                    return Ok(());
                }

                handler(ProjectionContext { state }, event.clone()).await?;

                store
                    .save_projection_checkpoint(ProjectionCheckpoint {
                        projection: projection_id,
                        aggregate: event.aggregate,
                        timestamp: Utc::now(),
                    })
                    .await?;
                Ok(())
            }
            .boxed()
        });

        let subscriber = self
            .bus
            .subscribe(&self.projection_id, handler, SubscribeOptions::default())
            .await?;
        *self.subscriber.lock().await = Some(subscriber);
        Ok(())
    }

    /// Block until no event has arrived for `duration`. Used by tests and
    /// batch jobs to drain.
    pub async fn wait_until_settled(&self, duration: Duration) {
        let poll = SETTLE_POLL.min(duration).max(Duration::from_millis(10));
        loop {
            let idle = self.last_event_at.lock().map(|at| at.elapsed()).unwrap_or(duration);
            if idle >= duration {
                return;
            }
            tokio::time::sleep(poll).await;
        }
    }

    /// Unsubscribe gracefully: any in-flight handler completes and saves
    /// its checkpoint before the consumer disconnects.
    pub async fn stop(&self) {
        if let Some(subscriber) = self.subscriber.lock().await.take() {
            subscriber.stop().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    use arque_core::{AGGREGATE_ID_LEN, AggregateId, AggregateRef, CTX_META_KEY, EventId, Value};
    use arque_infra::{InMemoryEventBus, InMemoryEventStore, InMemoryStreamRegistry, StreamBatch};

    use super::*;

    const T_APPLIED: u32 = 40;

    fn event(version: u32, event_type: u32, amount: i64) -> Event {
        let mut meta = BTreeMap::new();
        meta.insert(CTX_META_KEY.to_string(), Value::from("ctx"));
        Event {
            id: EventId::generate(),
            event_type,
            aggregate: AggregateRef::new(AggregateId::from_bytes([4; AGGREGATE_ID_LEN]), version),
            body: Some(Value::Map(BTreeMap::from([("amount".to_string(), Value::Int(amount))]))),
            meta,
            timestamp: Utc::now(),
        }
    }

    type Ledger = Arc<Mutex<Vec<i64>>>;

    fn ledger_projection(
        store: Arc<InMemoryEventStore>,
        bus: Arc<InMemoryEventBus>,
        registry: Arc<InMemoryStreamRegistry>,
        ledger: Ledger,
    ) -> Projection<Ledger> {
        Projection::new(
            store,
            bus,
            registry,
            vec![projection_handler(T_APPLIED, |ctx: ProjectionContext<Ledger>, event: Event| async move {
                let amount = event
                    .body
                    .as_ref()
                    .and_then(|b| b.get("amount"))
                    .and_then(Value::as_i64)
                    .unwrap_or_default();
                ctx.state.lock().unwrap().push(amount);
                Ok(())
            })],
            "ledger",
            ledger,
        )
    }

    async fn wait_until(mut cond: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !cond() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    #[tokio::test]
    async fn registers_interest_and_applies_events() {
        let store = Arc::new(InMemoryEventStore::new());
        let bus = Arc::new(InMemoryEventBus::new());
        let registry = Arc::new(InMemoryStreamRegistry::new());
        let ledger: Ledger = Arc::new(Mutex::new(Vec::new()));

        let projection = ledger_projection(store, bus.clone(), registry.clone(), ledger.clone());
        projection.start().await.unwrap();

        assert_eq!(registry.find_streams(T_APPLIED).await.unwrap(), vec!["ledger"]);

        bus.send_events(vec![StreamBatch {
            stream: "ledger".to_string(),
            events: vec![event(1, T_APPLIED, 10), event(2, T_APPLIED, 5)],
        }])
        .await
        .unwrap();

        wait_until(|| ledger.lock().unwrap().len() == 2).await;
        assert_eq!(*ledger.lock().unwrap(), vec![10, 5]);

        projection.stop().await;
    }

    #[tokio::test]
    async fn duplicate_deliveries_have_no_effect() {
        let store = Arc::new(InMemoryEventStore::new());
        let bus = Arc::new(InMemoryEventBus::new());
        let registry = Arc::new(InMemoryStreamRegistry::new());
        let ledger: Ledger = Arc::new(Mutex::new(Vec::new()));

        let projection = ledger_projection(store, bus.clone(), registry, ledger.clone());
        projection.start().await.unwrap();

        let original = event(1, T_APPLIED, 10);
        for _ in 0..3 {
            bus.send_events(vec![StreamBatch {
                stream: "ledger".to_string(),
                events: vec![original.clone()],
            }])
            .await
            .unwrap();
        }
        bus.send_events(vec![StreamBatch {
            stream: "ledger".to_string(),
            events: vec![event(2, T_APPLIED, 5)],
        }])
        .await
        .unwrap();

        projection.wait_until_settled(Duration::from_millis(100)).await;

        // The duplicate-free sequence: one 10, one 5.
        assert_eq!(*ledger.lock().unwrap(), vec![10, 5]);

        projection.stop().await;
    }

    #[tokio::test]
    async fn events_without_a_handler_are_dropped() {
        let store = Arc::new(InMemoryEventStore::new());
        let bus = Arc::new(InMemoryEventBus::new());
        let registry = Arc::new(InMemoryStreamRegistry::new());
        let ledger: Ledger = Arc::new(Mutex::new(Vec::new()));

        let projection = ledger_projection(store, bus.clone(), registry, ledger.clone());
        projection.start().await.unwrap();

        bus.send_events(vec![StreamBatch {
            stream: "ledger".to_string(),
            events: vec![event(1, 999, 1), event(2, T_APPLIED, 3)],
        }])
        .await
        .unwrap();

        wait_until(|| ledger.lock().unwrap().len() == 1).await;
        assert_eq!(*ledger.lock().unwrap(), vec![3]);

        projection.stop().await;
    }

    #[tokio::test]
    async fn handler_errors_cause_redelivery_until_success() {
        let store = Arc::new(InMemoryEventStore::new());
        let bus = Arc::new(InMemoryEventBus::new());
        let registry = Arc::new(InMemoryStreamRegistry::new());
        let attempts = Arc::new(AtomicU32::new(0));
        let applied = Arc::new(AtomicU32::new(0));

        let attempts_clone = attempts.clone();
        let applied_clone = applied.clone();
        let projection = Projection::new(
            store,
            bus.clone(),
            registry,
            vec![projection_handler(T_APPLIED, move |_ctx: ProjectionContext<()>, _event| {
                let attempts = attempts_clone.clone();
                let applied = applied_clone.clone();
                async move {
                    if attempts.fetch_add(1, Ordering::SeqCst) < 2 {
                        anyhow::bail!("transient read-model failure");
                    }
                    applied.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            })],
            "flaky",
            (),
        );
        projection.start().await.unwrap();

        bus.send_events(vec![StreamBatch {
            stream: "flaky".to_string(),
            events: vec![event(1, T_APPLIED, 1)],
        }])
        .await
        .unwrap();

        wait_until(|| applied.load(Ordering::SeqCst) == 1).await;
        assert_eq!(attempts.load(Ordering::SeqCst), 3);

        projection.stop().await;
    }

    #[tokio::test]
    async fn wait_until_settled_blocks_for_the_quiet_period() {
        let store = Arc::new(InMemoryEventStore::new());
        let bus = Arc::new(InMemoryEventBus::new());
        let registry = Arc::new(InMemoryStreamRegistry::new());
        let ledger: Ledger = Arc::new(Mutex::new(Vec::new()));

        let projection = ledger_projection(store, bus, registry, ledger);
        projection.start().await.unwrap();

        let started = Instant::now();
        projection.wait_until_settled(Duration::from_millis(50)).await;
        assert!(started.elapsed() >= Duration::from_millis(50));

        projection.stop().await;
    }
}

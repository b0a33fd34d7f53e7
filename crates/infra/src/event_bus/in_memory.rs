//! In-memory partitioned event bus for tests/dev.
//!
//! Mirrors the semantics of the durable transports: topics split into a
//! fixed number of partitions, one consumer group per topic, per-partition
//! in-order delivery, and handler retry with backoff. Messages published
//! before anyone subscribes are buffered until a subscriber claims the
//! partition.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tracing::error;

use arque_core::{EventCodec, StreamError, retry};

use super::{
    DEFAULT_TOPIC_PREFIX, Delivery, DeliveryHandler, EventBus, PartitionKey, RawMessage,
    RawStreamBatch, StreamBatch, Subscriber, SubscribeOptions, topic_name,
};

const DEFAULT_PARTITIONS: usize = 16;

pub struct InMemoryEventBus {
    codec: EventCodec,
    prefix: String,
    partition_count: usize,
    topics: std::sync::Mutex<HashMap<String, Arc<Topic>>>,
}

struct Topic {
    partitions: Vec<Arc<Partition>>,
}

#[derive(Default)]
struct Partition {
    queue: std::sync::Mutex<VecDeque<RawMessage>>,
    notify: tokio::sync::Notify,
    claimed: AtomicBool,
}

impl InMemoryEventBus {
    pub fn new() -> Self {
        Self {
            codec: EventCodec::new(),
            prefix: DEFAULT_TOPIC_PREFIX.to_string(),
            partition_count: DEFAULT_PARTITIONS,
            topics: std::sync::Mutex::new(HashMap::new()),
        }
    }

    pub fn with_codec(mut self, codec: EventCodec) -> Self {
        self.codec = codec;
        self
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    pub fn with_partitions(mut self, partitions: usize) -> Self {
        self.partition_count = partitions.max(1);
        self
    }

    fn topic(&self, stream: &str) -> Result<Arc<Topic>, StreamError> {
        let name = topic_name(&self.prefix, stream);
        let mut topics = self
            .topics
            .lock()
            .map_err(|_| StreamError::Fatal("topic registry lock poisoned".to_string()))?;

        Ok(topics
            .entry(name)
            .or_insert_with(|| {
                Arc::new(Topic {
                    partitions: (0..self.partition_count).map(|_| Arc::new(Partition::default())).collect(),
                })
            })
            .clone())
    }

    fn publish(&self, topic: &Topic, messages: Vec<RawMessage>) -> Result<(), StreamError> {
        for message in messages {
            let partition = &topic.partitions[message.key.partition(topic.partitions.len())];
            partition
                .queue
                .lock()
                .map_err(|_| StreamError::Fatal("partition lock poisoned".to_string()))?
                .push_back(message);
            partition.notify.notify_one();
        }
        Ok(())
    }
}

impl Default for InMemoryEventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventBus for InMemoryEventBus {
    async fn send_events(&self, batches: Vec<StreamBatch>) -> Result<(), StreamError> {
        for batch in batches {
            let topic = self.topic(&batch.stream)?;
            let mut messages = Vec::with_capacity(batch.events.len());
            for event in &batch.events {
                messages.push(RawMessage {
                    key: PartitionKey::for_event(event),
                    frame: self.codec.encode(event)?,
                });
            }
            self.publish(&topic, messages)?;
        }
        Ok(())
    }

    async fn send_raw(&self, batches: Vec<RawStreamBatch>) -> Result<(), StreamError> {
        for batch in batches {
            let topic = self.topic(&batch.stream)?;
            self.publish(&topic, batch.messages)?;
        }
        Ok(())
    }

    async fn subscribe(
        &self,
        stream: &str,
        handler: DeliveryHandler,
        opts: SubscribeOptions,
    ) -> Result<Subscriber, StreamError> {
        let topic = self.topic(stream)?;
        let topic_label = topic_name(&self.prefix, stream);
        let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

        let mut tasks = Vec::new();
        for (index, partition) in topic.partitions.iter().enumerate() {
            // One consumer per partition per group; latecomers stay idle
            // until a claim is released.
            if partition
                .claimed
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                continue;
            }

            tasks.push(tokio::spawn(partition_worker(
                partition.clone(),
                self.codec.clone(),
                handler.clone(),
                opts.clone(),
                shutdown_rx.clone(),
                topic_label.clone(),
                index,
            )));
        }

        Ok(Subscriber::new(shutdown_tx, tasks))
    }

    fn codec(&self) -> &EventCodec {
        &self.codec
    }
}

async fn partition_worker(
    partition: Arc<Partition>,
    codec: EventCodec,
    handler: DeliveryHandler,
    opts: SubscribeOptions,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
    topic: String,
    index: usize,
) {
    loop {
        loop {
            let message = match partition.queue.lock() {
                Ok(mut queue) => queue.pop_front(),
                Err(_) => {
                    error!(%topic, partition = index, "partition lock poisoned, stopping consumer");
                    partition.claimed.store(false, Ordering::Release);
                    return;
                }
            };
            let Some(message) = message else { break };

            let delivery = if opts.raw {
                Delivery::Raw(message.clone())
            } else {
                match codec.decode(&message.frame) {
                    Ok(event) => Delivery::Event(event),
                    Err(err) => {
                        // Undecodable frames can never succeed; drop them
                        // rather than wedging the partition.
                        error!(%topic, partition = index, %err, "dropping undecodable frame");
                        continue;
                    }
                }
            };

            let classifier = opts.retry.clone();
            let outcome = retry(
                opts.policy,
                move |err: &anyhow::Error| classifier.as_ref().map_or(true, |c| c(err)),
                || handler(delivery.clone()),
            )
            .await;

            if let Err(err) = outcome {
                // Intentional backpressure: the message stays at the head
                // and this partition makes no further progress.
                error!(%topic, partition = index, error = %err, "handler failed, blocking partition");
                if let Ok(mut queue) = partition.queue.lock() {
                    queue.push_front(message);
                }
                partition.claimed.store(false, Ordering::Release);
                return;
            }

            if *shutdown.borrow() {
                partition.claimed.store(false, Ordering::Release);
                return;
            }
        }

        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            _ = partition.notify.notified() => {}
        }
    }

    partition.claimed.store(false, Ordering::Release);
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::Mutex;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    use chrono::DateTime;
    use futures::FutureExt;

    use arque_core::{
        AGGREGATE_ID_LEN, AggregateId, AggregateRef, CTX_META_KEY, Event, EventId, RetryPolicy, Value,
        peek_event_type,
    };

    use super::super::RetryClassifier;
    use super::*;

    fn event(ctx: &str, version: u32, event_type: u32) -> Event {
        let mut meta = BTreeMap::new();
        meta.insert(CTX_META_KEY.to_string(), Value::from(ctx));
        Event {
            id: EventId::generate(),
            event_type,
            aggregate: AggregateRef::new(AggregateId::from_bytes([1; AGGREGATE_ID_LEN]), version),
            body: None,
            meta,
            timestamp: DateTime::from_timestamp(1_700_000_000, 0).unwrap(),
        }
    }

    fn recording_handler(seen: Arc<Mutex<Vec<Event>>>) -> DeliveryHandler {
        Arc::new(move |delivery| {
            let seen = seen.clone();
            async move {
                if let Delivery::Event(event) = delivery {
                    seen.lock().unwrap().push(event);
                }
                Ok(())
            }
            .boxed()
        })
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

    fn fast_retry(attempts: u32) -> RetryPolicy {
        RetryPolicy {
            starting_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
            multiplier: 2,
            attempts,
            jitter: false,
        }
    }

    #[tokio::test]
    async fn delivers_equal_ctx_events_in_order() {
        let bus = Arc::new(InMemoryEventBus::new());
        let seen = Arc::new(Mutex::new(Vec::new()));

        let sub = bus
            .subscribe("orders", recording_handler(seen.clone()), SubscribeOptions::default())
            .await
            .unwrap();

        for version in 1..=20 {
            bus.send_events(vec![StreamBatch {
                stream: "orders".to_string(),
                events: vec![event("ctx-a", version, 7)],
            }])
            .await
            .unwrap();
        }

        wait_until(|| seen.lock().unwrap().len() == 20).await;
        let versions: Vec<u32> = seen.lock().unwrap().iter().map(|e| e.aggregate.version).collect();
        assert_eq!(versions, (1..=20).collect::<Vec<_>>());

        sub.stop().await;
    }

    #[tokio::test]
    async fn buffers_messages_published_before_subscribe() {
        let bus = Arc::new(InMemoryEventBus::new());

        bus.send_events(vec![StreamBatch {
            stream: "early".to_string(),
            events: vec![event("ctx", 1, 1)],
        }])
        .await
        .unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sub = bus
            .subscribe("early", recording_handler(seen.clone()), SubscribeOptions::default())
            .await
            .unwrap();

        wait_until(|| seen.lock().unwrap().len() == 1).await;
        sub.stop().await;
    }

    #[tokio::test]
    async fn raw_subscription_passes_frames_through() {
        let bus = Arc::new(InMemoryEventBus::new());
        let frames = Arc::new(Mutex::new(Vec::new()));

        let frames_clone = frames.clone();
        let handler: DeliveryHandler = Arc::new(move |delivery| {
            let frames = frames_clone.clone();
            async move {
                if let Delivery::Raw(message) = delivery {
                    frames.lock().unwrap().push(message);
                }
                Ok(())
            }
            .boxed()
        });

        let sub = bus.subscribe("raw", handler, SubscribeOptions::raw()).await.unwrap();

        bus.send_events(vec![StreamBatch {
            stream: "raw".to_string(),
            events: vec![event("ctx", 1, 4242)],
        }])
        .await
        .unwrap();

        wait_until(|| frames.lock().unwrap().len() == 1).await;
        let message = frames.lock().unwrap()[0].clone();
        assert_eq!(peek_event_type(&message.frame).unwrap(), 4242);
        assert_eq!(message.key, PartitionKey::for_ctx(&Value::from("ctx")));

        sub.stop().await;
    }

    #[tokio::test]
    async fn retries_failing_handlers_until_success() {
        let bus = Arc::new(InMemoryEventBus::new());
        let attempts = Arc::new(AtomicU32::new(0));

        let attempts_clone = attempts.clone();
        let handler: DeliveryHandler = Arc::new(move |_| {
            let attempts = attempts_clone.clone();
            async move {
                if attempts.fetch_add(1, Ordering::SeqCst) < 2 {
                    anyhow::bail!("flaky");
                }
                Ok(())
            }
            .boxed()
        });

        let sub = bus
            .subscribe(
                "flaky",
                handler,
                SubscribeOptions { policy: fast_retry(10), ..SubscribeOptions::default() },
            )
            .await
            .unwrap();

        bus.send_events(vec![StreamBatch {
            stream: "flaky".to_string(),
            events: vec![event("ctx", 1, 1)],
        }])
        .await
        .unwrap();

        wait_until(|| attempts.load(Ordering::SeqCst) == 3).await;
        sub.stop().await;
    }

    #[tokio::test]
    async fn fatal_errors_block_the_partition() {
        let bus = Arc::new(InMemoryEventBus::new().with_partitions(1));
        let attempts = Arc::new(AtomicU32::new(0));

        let attempts_clone = attempts.clone();
        let handler: DeliveryHandler = Arc::new(move |_| {
            let attempts = attempts_clone.clone();
            async move {
                attempts.fetch_add(1, Ordering::SeqCst);
                anyhow::bail!("poison")
            }
            .boxed()
        });

        let classifier: RetryClassifier = Arc::new(|_| false);
        let sub = bus
            .subscribe(
                "poison",
                handler,
                SubscribeOptions {
                    retry: Some(classifier),
                    policy: fast_retry(10),
                    ..SubscribeOptions::default()
                },
            )
            .await
            .unwrap();

        bus.send_events(vec![StreamBatch {
            stream: "poison".to_string(),
            events: vec![event("a", 1, 1), event("a", 2, 1)],
        }])
        .await
        .unwrap();

        wait_until(|| attempts.load(Ordering::SeqCst) == 1).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        // Not retried, and the next message never ran.
        assert_eq!(attempts.load(Ordering::SeqCst), 1);

        sub.stop().await;
    }

    #[tokio::test]
    async fn consumer_group_processes_each_message_once() {
        let bus = Arc::new(InMemoryEventBus::new().with_partitions(4));
        let seen = Arc::new(Mutex::new(Vec::new()));

        // Two group members splitting the four partitions.
        let sub_a = bus
            .subscribe("group", recording_handler(seen.clone()), SubscribeOptions::default())
            .await
            .unwrap();
        let sub_b = bus
            .subscribe("group", recording_handler(seen.clone()), SubscribeOptions::default())
            .await
            .unwrap();

        let events: Vec<Event> = (0..16).map(|i| event(&format!("ctx-{i}"), 1, i)).collect();
        bus.send_events(vec![StreamBatch { stream: "group".to_string(), events }])
            .await
            .unwrap();

        wait_until(|| seen.lock().unwrap().len() == 16).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(seen.lock().unwrap().len(), 16);

        sub_a.stop().await;
        sub_b.stop().await;
    }
}

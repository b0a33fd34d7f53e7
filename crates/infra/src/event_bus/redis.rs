//! Redis Streams-backed event bus (durable, at-least-once delivery).
//!
//! One Redis stream key per topic (`<prefix>.<stream>`), with a consumer
//! group named after the topic so all subscribers of a stream share
//! partitions of the log. Messages persist until acknowledged (XACK) and
//! are redelivered on crash.
//!
//! A Redis stream is a single ordered log, so per-key ordering holds
//! trivially for a single group consumer. Running several consumers in one
//! group preserves at-least-once delivery but may interleave keys; prefer
//! one consumer per topic when strict per-key order matters.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::{error, instrument, warn};

use arque_core::{EventCodec, StreamError, retry};

use super::{
    DEFAULT_TOPIC_PREFIX, Delivery, DeliveryHandler, EventBus, PartitionKey, RawMessage,
    RawStreamBatch, StreamBatch, Subscriber, SubscribeOptions, topic_name,
};

const READ_COUNT: usize = 16;
const BLOCK_MS: u64 = 100;

#[derive(Clone)]
pub struct RedisEventBus {
    client: Arc<redis::Client>,
    codec: EventCodec,
    prefix: String,
}

impl RedisEventBus {
    pub fn new(redis_url: impl AsRef<str>) -> Result<Self, StreamError> {
        let client = redis::Client::open(redis_url.as_ref())
            .map_err(|e| StreamError::Fatal(format!("redis client: {e}")))?;

        Ok(Self {
            client: Arc::new(client),
            codec: EventCodec::new(),
            prefix: DEFAULT_TOPIC_PREFIX.to_string(),
        })
    }

    pub fn with_codec(mut self, codec: EventCodec) -> Self {
        self.codec = codec;
        self
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    /// Idempotently create the consumer group for a topic.
    fn ensure_consumer_group(conn: &mut redis::Connection, topic: &str) {
        // Group already existing is fine; MKSTREAM creates the key.
        let _: Result<String, _> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(topic)
            .arg(topic)
            .arg("0")
            .arg("MKSTREAM")
            .query(conn);
    }

    #[instrument(skip(self, messages), fields(count = messages.len()), err)]
    async fn publish(&self, topic: String, messages: Vec<RawMessage>) -> Result<(), StreamError> {
        let client = self.client.clone();

        tokio::task::spawn_blocking(move || {
            let mut conn = client
                .get_connection()
                .map_err(|e| StreamError::Transient(format!("redis connect: {e}")))?;

            for message in messages {
                let _: String = redis::cmd("XADD")
                    .arg(&topic)
                    .arg("*")
                    .arg("pkey")
                    .arg(message.key.0.to_string())
                    .arg("frame")
                    .arg(&message.frame[..])
                    .query(&mut conn)
                    .map_err(|e| StreamError::Transient(format!("XADD: {e}")))?;
            }
            Ok(())
        })
        .await
        .map_err(|e| StreamError::Fatal(format!("publish task: {e}")))?
    }
}

#[async_trait]
impl EventBus for RedisEventBus {
    async fn send_events(&self, batches: Vec<StreamBatch>) -> Result<(), StreamError> {
        for batch in batches {
            let mut messages = Vec::with_capacity(batch.events.len());
            for event in &batch.events {
                messages.push(RawMessage {
                    key: PartitionKey::for_event(event),
                    frame: self.codec.encode(event)?,
                });
            }
            self.publish(topic_name(&self.prefix, &batch.stream), messages).await?;
        }
        Ok(())
    }

    async fn send_raw(&self, batches: Vec<RawStreamBatch>) -> Result<(), StreamError> {
        for batch in batches {
            self.publish(topic_name(&self.prefix, &batch.stream), batch.messages).await?;
        }
        Ok(())
    }

    async fn subscribe(
        &self,
        stream: &str,
        handler: DeliveryHandler,
        opts: SubscribeOptions,
    ) -> Result<Subscriber, StreamError> {
        let topic = topic_name(&self.prefix, stream);
        let consumer = format!("consumer-{}", uuid::Uuid::now_v7());
        let client = self.client.clone();
        let codec = self.codec.clone();

        let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

        let task = tokio::spawn(consume_loop(client, codec, topic, consumer, handler, opts, shutdown_rx));

        Ok(Subscriber::new(shutdown_tx, vec![task]))
    }

    fn codec(&self) -> &EventCodec {
        &self.codec
    }
}

struct StreamEntry {
    entry_id: String,
    message: RawMessage,
}

async fn consume_loop(
    client: Arc<redis::Client>,
    codec: EventCodec,
    topic: String,
    consumer: String,
    handler: DeliveryHandler,
    opts: SubscribeOptions,
    shutdown: tokio::sync::watch::Receiver<bool>,
) {
    let conn = match client.get_connection() {
        Ok(mut conn) => {
            RedisEventBus::ensure_consumer_group(&mut conn, &topic);
            Arc::new(std::sync::Mutex::new(conn))
        }
        Err(e) => {
            error!(%topic, error = %e, "redis subscriber failed to connect");
            return;
        }
    };

    while !*shutdown.borrow() {
        let entries = {
            let conn = conn.clone();
            let topic = topic.clone();
            let consumer = consumer.clone();
            tokio::task::spawn_blocking(move || read_group(&conn, &topic, &consumer)).await
        };

        let entries = match entries {
            Ok(Ok(entries)) => entries,
            Ok(Err(e)) => {
                warn!(%topic, error = %e, "redis read failed, backing off");
                tokio::time::sleep(std::time::Duration::from_millis(BLOCK_MS)).await;
                continue;
            }
            Err(e) => {
                error!(%topic, error = %e, "redis read task failed");
                return;
            }
        };

        for entry in entries {
            let delivery = if opts.raw {
                Delivery::Raw(entry.message.clone())
            } else {
                match codec.decode(&entry.message.frame) {
                    Ok(event) => Delivery::Event(event),
                    Err(err) => {
                        error!(%topic, entry_id = %entry.entry_id, %err, "dropping undecodable frame");
                        acknowledge(&conn, &topic, &entry.entry_id).await;
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

            match outcome {
                Ok(()) => acknowledge(&conn, &topic, &entry.entry_id).await,
                Err(err) => {
                    // Left pending: the entry stays unacked and will be
                    // redelivered, blocking progress behind it.
                    error!(%topic, entry_id = %entry.entry_id, error = %err, "handler failed, leaving entry pending");
                    return;
                }
            }
        }
    }
}

fn read_group(
    conn: &std::sync::Mutex<redis::Connection>,
    topic: &str,
    consumer: &str,
) -> Result<Vec<StreamEntry>, String> {
    let mut conn = conn.lock().map_err(|_| "connection lock poisoned".to_string())?;

    let reply: redis::Value = redis::cmd("XREADGROUP")
        .arg("GROUP")
        .arg(topic)
        .arg(consumer)
        .arg("COUNT")
        .arg(READ_COUNT)
        .arg("BLOCK")
        .arg(BLOCK_MS)
        .arg("STREAMS")
        .arg(topic)
        .arg(">")
        .query(&mut *conn)
        .map_err(|e| format!("XREADGROUP: {e}"))?;

    parse_read_reply(reply)
}

/// Reply shape: `[[stream_key, [[entry_id, [field, value, ...]], ...]]]`,
/// or nil when the blocking read times out.
fn parse_read_reply(reply: redis::Value) -> Result<Vec<StreamEntry>, String> {
    let streams = match reply {
        redis::Value::Nil => return Ok(vec![]),
        redis::Value::Bulk(streams) => streams,
        other => return Err(format!("unexpected XREADGROUP reply: {other:?}")),
    };

    let mut out = Vec::new();
    for stream in streams {
        let redis::Value::Bulk(parts) = stream else { continue };
        let Some(redis::Value::Bulk(entries)) = parts.into_iter().nth(1) else { continue };

        for entry in entries {
            let redis::Value::Bulk(entry_parts) = entry else { continue };
            let mut iter = entry_parts.into_iter();

            let entry_id = match iter.next() {
                Some(redis::Value::Data(id)) => String::from_utf8_lossy(&id).to_string(),
                _ => continue,
            };
            let Some(redis::Value::Bulk(fields)) = iter.next() else { continue };

            let mut key = PartitionKey::neutral();
            let mut frame: Option<Bytes> = None;
            for pair in fields.chunks(2) {
                let [redis::Value::Data(name), redis::Value::Data(value)] = pair else { continue };
                match name.as_slice() {
                    b"pkey" => {
                        if let Ok(parsed) = String::from_utf8_lossy(value).parse::<u64>() {
                            key = PartitionKey(parsed);
                        }
                    }
                    b"frame" => frame = Some(Bytes::copy_from_slice(value)),
                    _ => {}
                }
            }

            match frame {
                Some(frame) => out.push(StreamEntry { entry_id, message: RawMessage { key, frame } }),
                None => warn!(%entry_id, "stream entry missing frame field"),
            }
        }
    }

    Ok(out)
}

async fn acknowledge(conn: &Arc<std::sync::Mutex<redis::Connection>>, topic: &str, entry_id: &str) {
    let conn = conn.clone();
    let topic = topic.to_string();
    let entry_id = entry_id.to_string();

    let result = tokio::task::spawn_blocking(move || {
        let mut conn = conn.lock().map_err(|_| "connection lock poisoned".to_string())?;
        let _: u64 = redis::cmd("XACK")
            .arg(&topic)
            .arg(&topic)
            .arg(&entry_id)
            .query(&mut *conn)
            .map_err(|e| format!("XACK: {e}"))?;
        Ok::<(), String>(())
    })
    .await;

    match result {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(error = %e, "failed to acknowledge entry"),
        Err(e) => warn!(error = %e, "acknowledge task failed"),
    }
}

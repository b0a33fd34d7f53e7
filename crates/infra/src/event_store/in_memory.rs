use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::Utc;

use arque_core::{AggregateId, AggregateRecord, AggregateRef, Event, ProjectionCheckpoint, Snapshot, StoreError};

use super::r#trait::{EventBatch, EventQuery, EventStore, EventStream, prepare_batch};

/// In-memory append-only event store.
///
/// Intended for tests/dev. Not optimized for performance.
#[derive(Debug, Default)]
pub struct InMemoryEventStore {
    inner: RwLock<Inner>,
    snapshot_gate: tokio::sync::Mutex<()>,
}

#[derive(Debug, Default)]
struct Inner {
    // BTreeMap keeps list_events in (aggregate_id asc, version asc) order.
    streams: BTreeMap<AggregateId, Vec<Event>>,
    aggregates: BTreeMap<AggregateId, AggregateRecord>,
    snapshots: BTreeMap<(AggregateId, u32), Snapshot>,
    checkpoints: HashMap<(String, AggregateId), ProjectionCheckpoint>,
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn poisoned() -> StoreError {
    StoreError::Fatal("lock poisoned".to_string())
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    async fn save_events(&self, batch: EventBatch) -> Result<Vec<Event>, StoreError> {
        let timestamp = batch.timestamp;
        let (aggregate, events) = prepare_batch(batch)?;

        let mut inner = self.inner.write().map_err(|_| poisoned())?;

        if let Some(record) = inner.aggregates.get(&aggregate.id) {
            if record.is_final {
                return Err(StoreError::AggregateFinalized(aggregate.id));
            }
        }

        let current = inner.aggregates.get(&aggregate.id).map_or(0, |r| r.version);
        if current >= aggregate.version {
            return Err(StoreError::VersionConflict {
                id: aggregate.id,
                version: aggregate.version,
            });
        }
        if current + 1 != aggregate.version {
            return Err(StoreError::Fatal(format!(
                "append leaves a gap: log ends at {current}, batch claims {}",
                aggregate.version
            )));
        }

        let head = events.last().expect("batch validated non-empty").aggregate.version;
        inner.streams.entry(aggregate.id).or_default().extend(events.iter().cloned());
        inner.aggregates.insert(
            aggregate.id,
            AggregateRecord {
                id: aggregate.id,
                version: head,
                timestamp,
                is_final: false,
            },
        );

        Ok(events)
    }

    fn list_events(&self, query: EventQuery) -> EventStream {
        // Restartable by construction: each call captures a fresh copy of
        // the matching events.
        let matching: Vec<Result<Event, StoreError>> = match self.inner.read() {
            Err(_) => vec![Err(poisoned())],
            Ok(inner) => {
                let mut out = Vec::new();
                for (id, events) in &inner.streams {
                    if let Some(agg) = &query.aggregate {
                        if *id != agg.id {
                            continue;
                        }
                    }
                    let after = query.aggregate.as_ref().and_then(|a| a.version).unwrap_or(0);
                    for event in events {
                        if event.aggregate.version <= after {
                            continue;
                        }
                        if let Some(t) = query.event_type {
                            if event.event_type != t {
                                continue;
                            }
                        }
                        out.push(Ok(event.clone()));
                    }
                }
                out
            }
        };

        Box::pin(futures::stream::iter(matching))
    }

    async fn find_latest_snapshot(&self, aggregate: AggregateRef) -> Result<Option<Snapshot>, StoreError> {
        let inner = self.inner.read().map_err(|_| poisoned())?;

        let found = inner
            .snapshots
            .range((aggregate.id, aggregate.version + 1)..=(aggregate.id, u32::MAX))
            .next_back()
            .map(|(_, snapshot)| snapshot.clone());

        Ok(found)
    }

    async fn save_snapshot(&self, snapshot: Snapshot) -> Result<(), StoreError> {
        let _gate = self.snapshot_gate.lock().await;

        let mut inner = self.inner.write().map_err(|_| poisoned())?;
        inner
            .snapshots
            .insert((snapshot.aggregate.id, snapshot.aggregate.version), snapshot);
        Ok(())
    }

    async fn save_projection_checkpoint(&self, checkpoint: ProjectionCheckpoint) -> Result<(), StoreError> {
        let mut inner = self.inner.write().map_err(|_| poisoned())?;
        inner
            .checkpoints
            .insert((checkpoint.projection.clone(), checkpoint.aggregate.id), checkpoint);
        Ok(())
    }

    async fn check_projection_checkpoint(
        &self,
        projection: &str,
        aggregate: AggregateRef,
    ) -> Result<bool, StoreError> {
        let inner = self.inner.read().map_err(|_| poisoned())?;

        let process = match inner.checkpoints.get(&(projection.to_string(), aggregate.id)) {
            None => true,
            Some(checkpoint) => checkpoint.aggregate.version < aggregate.version,
        };
        Ok(process)
    }

    async fn finalize_aggregate(&self, id: AggregateId) -> Result<(), StoreError> {
        let mut inner = self.inner.write().map_err(|_| poisoned())?;

        let version = inner.aggregates.get(&id).map_or(0, |r| r.version);
        inner.aggregates.insert(
            id,
            AggregateRecord {
                id,
                version,
                timestamp: Utc::now(),
                is_final: true,
            },
        );
        Ok(())
    }
}

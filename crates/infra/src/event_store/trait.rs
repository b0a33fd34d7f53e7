use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;

use arque_core::{AggregateId, AggregateRef, Event, ProjectionCheckpoint, Snapshot, StoreError, Value};

/// A lazy, restartable sequence of events.
///
/// Calling [`EventStore::list_events`] again with the same query yields the
/// same events (plus anything appended since); the stream is not a cursor
/// tied to adapter state.
pub type EventStream = BoxStream<'static, Result<Event, StoreError>>;

/// Filter for [`EventStore::list_events`].
#[derive(Debug, Clone, Default)]
pub struct EventQuery {
    pub aggregate: Option<AggregateQuery>,
    pub event_type: Option<u32>,
}

impl EventQuery {
    /// Events of one aggregate strictly after `version`.
    pub fn aggregate_after(id: AggregateId, version: u32) -> Self {
        Self {
            aggregate: Some(AggregateQuery { id, version: Some(version) }),
            event_type: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AggregateQuery {
    pub id: AggregateId,
    /// Exclusive lower bound on the version; `None` reads from the start.
    pub version: Option<u32>,
}

/// An atomic batch append.
///
/// `aggregate.version` is the version the first event of the batch will
/// occupy; the caller asserts the log currently ends at `version - 1`.
/// `meta` is merged into each event's own metadata (event keys win).
#[derive(Debug, Clone)]
pub struct EventBatch {
    pub aggregate: AggregateRef,
    pub timestamp: DateTime<Utc>,
    pub events: Vec<Event>,
    pub meta: Option<BTreeMap<String, Value>>,
}

/// Append-only event log with snapshots, projection checkpoints, and
/// aggregate finalization.
///
/// Implementations must:
/// - keep `(aggregate_id, aggregate_version)` unique and reject races with
///   [`StoreError::VersionConflict`]
/// - reject appends to finalized aggregates with
///   [`StoreError::AggregateFinalized`]
/// - retry the classified transient set (serialization failure, deadlock)
///   internally before surfacing anything
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Durably append a batch; all of it lands or none of it does.
    async fn save_events(&self, batch: EventBatch) -> Result<Vec<Event>, StoreError>;

    /// Events matching `query`, ordered `(aggregate_id asc, version asc)`.
    fn list_events(&self, query: EventQuery) -> EventStream;

    /// The snapshot with the greatest version strictly greater than
    /// `aggregate.version`, if any. Callers pass the highest version they
    /// already hold (0 on a cold load).
    async fn find_latest_snapshot(&self, aggregate: AggregateRef) -> Result<Option<Snapshot>, StoreError>;

    /// Upsert keyed by `(aggregate.id, aggregate.version)`. At most one
    /// snapshot write is in flight per adapter instance.
    async fn save_snapshot(&self, snapshot: Snapshot) -> Result<(), StoreError>;

    /// Upsert at `(projection, aggregate.id)`, overwriting the version
    /// unconditionally (the projection is the sole writer of its rows).
    async fn save_projection_checkpoint(&self, checkpoint: ProjectionCheckpoint) -> Result<(), StoreError>;

    /// `true` when the event at `aggregate.version` should be processed,
    /// i.e. no checkpoint already covers that version.
    async fn check_projection_checkpoint(
        &self,
        projection: &str,
        aggregate: AggregateRef,
    ) -> Result<bool, StoreError>;

    /// Idempotently freeze the aggregate; subsequent appends fail with
    /// [`StoreError::AggregateFinalized`].
    async fn finalize_aggregate(&self, id: AggregateId) -> Result<(), StoreError>;
}

#[async_trait]
impl<S> EventStore for Arc<S>
where
    S: EventStore + ?Sized,
{
    async fn save_events(&self, batch: EventBatch) -> Result<Vec<Event>, StoreError> {
        (**self).save_events(batch).await
    }

    fn list_events(&self, query: EventQuery) -> EventStream {
        (**self).list_events(query)
    }

    async fn find_latest_snapshot(&self, aggregate: AggregateRef) -> Result<Option<Snapshot>, StoreError> {
        (**self).find_latest_snapshot(aggregate).await
    }

    async fn save_snapshot(&self, snapshot: Snapshot) -> Result<(), StoreError> {
        (**self).save_snapshot(snapshot).await
    }

    async fn save_projection_checkpoint(&self, checkpoint: ProjectionCheckpoint) -> Result<(), StoreError> {
        (**self).save_projection_checkpoint(checkpoint).await
    }

    async fn check_projection_checkpoint(
        &self,
        projection: &str,
        aggregate: AggregateRef,
    ) -> Result<bool, StoreError> {
        (**self).check_projection_checkpoint(projection, aggregate).await
    }

    async fn finalize_aggregate(&self, id: AggregateId) -> Result<(), StoreError> {
        (**self).finalize_aggregate(id).await
    }
}

/// Validate batch shape and fold the batch metadata into each event.
///
/// Shared by store implementations so they agree on what a well-formed
/// append looks like: a non-empty batch, `version >= 1`, one aggregate per
/// batch, and contiguous versions starting at the claimed one.
pub(crate) fn prepare_batch(batch: EventBatch) -> Result<(AggregateRef, Vec<Event>), StoreError> {
    if batch.events.is_empty() {
        return Err(StoreError::Fatal("empty event batch".to_string()));
    }
    if batch.aggregate.version == 0 {
        return Err(StoreError::Fatal("aggregate versions start at 1".to_string()));
    }

    for (idx, event) in batch.events.iter().enumerate() {
        if event.aggregate.id != batch.aggregate.id {
            return Err(StoreError::Fatal(format!(
                "batch contains multiple aggregate ids (index {idx})"
            )));
        }
        let expected = batch.aggregate.version + idx as u32;
        if event.aggregate.version != expected {
            return Err(StoreError::Fatal(format!(
                "non-contiguous batch version at index {idx}: expected {expected}, got {}",
                event.aggregate.version
            )));
        }
    }

    let mut events = batch.events;
    if let Some(batch_meta) = batch.meta {
        for event in &mut events {
            for (key, value) in &batch_meta {
                event.meta.entry(key.clone()).or_insert_with(|| value.clone());
            }
        }
    }

    Ok((batch.aggregate, events))
}

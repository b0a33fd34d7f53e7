//! Postgres-backed event store implementation.
//!
//! Schema lives in `crates/infra/schema.sql`. The store enforces append-only
//! semantics and optimistic concurrency at the database level.
//!
//! ## Error mapping
//!
//! | PostgreSQL error code | `StoreError` | Scenario |
//! |-----------------------|--------------|----------|
//! | `23505` (unique violation) | `VersionConflict` | Concurrent append hit `unique(aggregate_id, aggregate_version)` |
//! | `40001` (serialization failure) | `Transient` | Retried internally |
//! | `40P01` (deadlock detected) | `Transient` | Retried internally |
//! | anything else | `Fatal` | Surfaced to the caller |
//!
//! ## Concurrency
//!
//! `save_events` takes a `FOR UPDATE` row lock on the aggregate record, so
//! writers on the same aggregate serialize; first-ever appends race on the
//! unique constraint instead (no row to lock yet). `list_events` paginates
//! with a keyset cursor and never materializes the full result set.

use std::sync::Arc;

use async_stream::try_stream;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::instrument;

use arque_core::{
    AggregateId, AggregateRef, Event, EventId, ProjectionCheckpoint, RetryPolicy, SerializerRegistry, Snapshot,
    StoreError, Value, retry,
};

use super::r#trait::{EventBatch, EventQuery, EventStore, EventStream, prepare_batch};

const LIST_PAGE_SIZE: i64 = 256;

/// Postgres-backed append-only event store.
#[derive(Clone)]
pub struct PostgresEventStore {
    pool: Arc<PgPool>,
    registry: Arc<SerializerRegistry>,
    snapshot_gate: Arc<tokio::sync::Mutex<()>>,
    retry_policy: RetryPolicy,
}

impl PostgresEventStore {
    pub fn new(pool: PgPool) -> Self {
        Self::with_registry(pool, Arc::new(SerializerRegistry::with_builtins()))
    }

    /// Use a registry carrying custom serializer tags for bodies/metadata.
    pub fn with_registry(pool: PgPool, registry: Arc<SerializerRegistry>) -> Self {
        Self {
            pool: Arc::new(pool),
            registry,
            snapshot_gate: Arc::new(tokio::sync::Mutex::new(())),
            retry_policy: RetryPolicy::store_write(),
        }
    }

    async fn try_save_events(&self, batch: EventBatch) -> Result<Vec<Event>, StoreError> {
        let timestamp = batch.timestamp;
        let (aggregate, events) = prepare_batch(batch)?;

        let mut tx = self.pool.begin().await.map_err(map_sqlx_error)?;

        let record = sqlx::query(
            "SELECT version, final FROM aggregates WHERE id = $1 FOR UPDATE",
        )
        .bind(aggregate.id.as_bytes().as_slice())
        .fetch_optional(&mut *tx)
        .await
        .map_err(map_sqlx_error)?;

        let (current, is_final) = match record {
            None => (0u32, false),
            Some(row) => {
                let version: i64 = row.try_get("version").map_err(map_sqlx_error)?;
                let is_final: bool = row.try_get("final").map_err(map_sqlx_error)?;
                (version as u32, is_final)
            }
        };

        if is_final {
            return Err(StoreError::AggregateFinalized(aggregate.id));
        }
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

        for event in &events {
            let body = match &event.body {
                None => None,
                Some(value) => Some(self.encode_value(value)?),
            };
            let meta = self.encode_value(&Value::Map(event.meta.clone()))?;

            sqlx::query(
                r#"
                INSERT INTO events (id, type, aggregate_id, aggregate_version, body, meta, timestamp, final)
                VALUES ($1, $2, $3, $4, $5, $6, $7, FALSE)
                "#,
            )
            .bind(event.id.as_bytes().as_slice())
            .bind(i64::from(event.event_type))
            .bind(event.aggregate.id.as_bytes().as_slice())
            .bind(i64::from(event.aggregate.version))
            .bind(body)
            .bind(meta)
            .bind(event.timestamp)
            .execute(&mut *tx)
            .await
            .map_err(|e| {
                if is_unique_violation(&e) {
                    StoreError::VersionConflict {
                        id: aggregate.id,
                        version: aggregate.version,
                    }
                } else {
                    map_sqlx_error(e)
                }
            })?;
        }

        let head = events.last().expect("batch validated non-empty").aggregate.version;
        sqlx::query(
            r#"
            INSERT INTO aggregates (id, version, timestamp, final)
            VALUES ($1, $2, $3, FALSE)
            ON CONFLICT (id)
            DO UPDATE SET version = EXCLUDED.version, timestamp = EXCLUDED.timestamp
            "#,
        )
        .bind(aggregate.id.as_bytes().as_slice())
        .bind(i64::from(head))
        .bind(timestamp)
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx_error)?;

        tx.commit().await.map_err(map_sqlx_error)?;

        Ok(events)
    }

    fn encode_value(&self, value: &Value) -> Result<serde_json::Value, StoreError> {
        self.registry
            .encode(value)
            .map_err(|e| StoreError::Fatal(format!("payload encoding: {e}")))
    }

    fn decode_row(&self, row: &PgRow) -> Result<Event, StoreError> {
        let id: Vec<u8> = row.try_get("id").map_err(map_sqlx_error)?;
        let event_type: i64 = row.try_get("type").map_err(map_sqlx_error)?;
        let aggregate_id: Vec<u8> = row.try_get("aggregate_id").map_err(map_sqlx_error)?;
        let aggregate_version: i64 = row.try_get("aggregate_version").map_err(map_sqlx_error)?;
        let body: Option<serde_json::Value> = row.try_get("body").map_err(map_sqlx_error)?;
        let meta: serde_json::Value = row.try_get("meta").map_err(map_sqlx_error)?;
        let timestamp: DateTime<Utc> = row.try_get("timestamp").map_err(map_sqlx_error)?;

        let body = match body {
            None => None,
            Some(raw) => Some(
                self.registry
                    .decode(&raw)
                    .map_err(|e| StoreError::Fatal(format!("stored body: {e}")))?,
            ),
        };
        let meta = match self
            .registry
            .decode(&meta)
            .map_err(|e| StoreError::Fatal(format!("stored meta: {e}")))?
        {
            Value::Map(map) => map,
            other => return Err(StoreError::Fatal(format!("stored meta is not a map: {other:?}"))),
        };

        Ok(Event {
            id: EventId::from_slice(&id).map_err(|e| StoreError::Fatal(e.to_string()))?,
            event_type: event_type as u32,
            aggregate: AggregateRef::new(
                AggregateId::from_slice(&aggregate_id).map_err(|e| StoreError::Fatal(e.to_string()))?,
                aggregate_version as u32,
            ),
            body,
            meta,
            timestamp,
        })
    }
}

#[async_trait]
impl EventStore for PostgresEventStore {
    #[instrument(
        skip(self, batch),
        fields(aggregate_id = %batch.aggregate.id, version = batch.aggregate.version, event_count = batch.events.len()),
        err
    )]
    async fn save_events(&self, batch: EventBatch) -> Result<Vec<Event>, StoreError> {
        retry(self.retry_policy, StoreError::is_transient, || {
            self.try_save_events(batch.clone())
        })
        .await
    }

    fn list_events(&self, query: EventQuery) -> EventStream {
        let store = self.clone();

        Box::pin(try_stream! {
            let aggregate_filter: Option<Vec<u8>> =
                query.aggregate.as_ref().map(|a| a.id.as_bytes().to_vec());
            let type_filter: Option<i64> = query.event_type.map(i64::from);

            // Keyset cursor: strictly after (cursor_id, cursor_version).
            let mut cursor_id: Vec<u8> = aggregate_filter.clone().unwrap_or_default();
            let mut cursor_version: i64 = query
                .aggregate
                .as_ref()
                .and_then(|a| a.version)
                .map_or(0, i64::from);

            loop {
                let rows = sqlx::query(
                    r#"
                    SELECT id, type, aggregate_id, aggregate_version, body, meta, timestamp
                    FROM events
                    WHERE ($1::bytea IS NULL OR aggregate_id = $1)
                      AND ($2::bigint IS NULL OR type = $2)
                      AND (aggregate_id > $3 OR (aggregate_id = $3 AND aggregate_version > $4))
                    ORDER BY aggregate_id ASC, aggregate_version ASC
                    LIMIT $5
                    "#,
                )
                .bind(aggregate_filter.as_deref())
                .bind(type_filter)
                .bind(cursor_id.as_slice())
                .bind(cursor_version)
                .bind(LIST_PAGE_SIZE)
                .fetch_all(&*store.pool)
                .await
                .map_err(map_sqlx_error)?;

                let page_len = rows.len();
                for row in rows {
                    let event = store.decode_row(&row)?;
                    cursor_id = event.aggregate.id.as_bytes().to_vec();
                    cursor_version = i64::from(event.aggregate.version);
                    yield event;
                }

                if (page_len as i64) < LIST_PAGE_SIZE {
                    break;
                }
            }
        })
    }

    #[instrument(skip(self), fields(aggregate_id = %aggregate.id, after_version = aggregate.version), err)]
    async fn find_latest_snapshot(&self, aggregate: AggregateRef) -> Result<Option<Snapshot>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT aggregate_version, state, timestamp
            FROM snapshots
            WHERE aggregate_id = $1 AND aggregate_version > $2
            ORDER BY aggregate_version DESC
            LIMIT 1
            "#,
        )
        .bind(aggregate.id.as_bytes().as_slice())
        .bind(i64::from(aggregate.version))
        .fetch_optional(&*self.pool)
        .await
        .map_err(map_sqlx_error)?;

        match row {
            None => Ok(None),
            Some(row) => {
                let version: i64 = row.try_get("aggregate_version").map_err(map_sqlx_error)?;
                let state: Vec<u8> = row.try_get("state").map_err(map_sqlx_error)?;
                let timestamp: DateTime<Utc> = row.try_get("timestamp").map_err(map_sqlx_error)?;
                Ok(Some(Snapshot {
                    aggregate: AggregateRef::new(aggregate.id, version as u32),
                    state,
                    timestamp,
                }))
            }
        }
    }

    #[instrument(
        skip(self, snapshot),
        fields(aggregate_id = %snapshot.aggregate.id, version = snapshot.aggregate.version),
        err
    )]
    async fn save_snapshot(&self, snapshot: Snapshot) -> Result<(), StoreError> {
        let _gate = self.snapshot_gate.lock().await;

        sqlx::query(
            r#"
            INSERT INTO snapshots (aggregate_id, aggregate_version, state, timestamp)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (aggregate_id, aggregate_version)
            DO UPDATE SET state = EXCLUDED.state, timestamp = EXCLUDED.timestamp
            "#,
        )
        .bind(snapshot.aggregate.id.as_bytes().as_slice())
        .bind(i64::from(snapshot.aggregate.version))
        .bind(&snapshot.state)
        .bind(snapshot.timestamp)
        .execute(&*self.pool)
        .await
        .map_err(map_sqlx_error)?;

        Ok(())
    }

    async fn save_projection_checkpoint(&self, checkpoint: ProjectionCheckpoint) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO projection_checkpoints (projection, aggregate_id, aggregate_version, timestamp)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (projection, aggregate_id)
            DO UPDATE SET aggregate_version = EXCLUDED.aggregate_version, timestamp = EXCLUDED.timestamp
            "#,
        )
        .bind(&checkpoint.projection)
        .bind(checkpoint.aggregate.id.as_bytes().as_slice())
        .bind(i64::from(checkpoint.aggregate.version))
        .bind(checkpoint.timestamp)
        .execute(&*self.pool)
        .await
        .map_err(map_sqlx_error)?;

        Ok(())
    }

    async fn check_projection_checkpoint(
        &self,
        projection: &str,
        aggregate: AggregateRef,
    ) -> Result<bool, StoreError> {
        let row = sqlx::query(
            "SELECT aggregate_version FROM projection_checkpoints WHERE projection = $1 AND aggregate_id = $2",
        )
        .bind(projection)
        .bind(aggregate.id.as_bytes().as_slice())
        .fetch_optional(&*self.pool)
        .await
        .map_err(map_sqlx_error)?;

        match row {
            None => Ok(true),
            Some(row) => {
                let version: i64 = row.try_get("aggregate_version").map_err(map_sqlx_error)?;
                Ok((version as u32) < aggregate.version)
            }
        }
    }

    #[instrument(skip(self), fields(aggregate_id = %id), err)]
    async fn finalize_aggregate(&self, id: AggregateId) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(map_sqlx_error)?;

        sqlx::query(
            r#"
            INSERT INTO aggregates (id, version, timestamp, final)
            VALUES ($1, 0, $2, TRUE)
            ON CONFLICT (id)
            DO UPDATE SET final = TRUE
            "#,
        )
        .bind(id.as_bytes().as_slice())
        .bind(Utc::now())
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx_error)?;

        sqlx::query("UPDATE events SET final = TRUE WHERE aggregate_id = $1")
            .bind(id.as_bytes().as_slice())
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx_error)?;

        tx.commit().await.map_err(map_sqlx_error)
    }
}

fn map_sqlx_error(err: sqlx::Error) -> StoreError {
    match &err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error: {}", db_err.message());
            match db_err.code().as_deref() {
                // Serialization failure / deadlock: the classified
                // retriable set.
                Some("40001") | Some("40P01") => StoreError::Transient(msg),
                _ => StoreError::Fatal(msg),
            }
        }
        sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) => StoreError::Transient(format!("sqlx: {err}")),
        _ => StoreError::Fatal(format!("sqlx: {err}")),
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_err) = err {
        return db_err.code().as_deref() == Some("23505");
    }
    false
}

use std::sync::Arc;

use async_trait::async_trait;
use sqlx::{PgPool, Row};
use tracing::instrument;

use arque_core::{StoreError, StreamRegistration};

use super::StreamRegistry;

/// Postgres-backed stream registry (`streams` table, GIN index on `events`).
#[derive(Debug, Clone)]
pub struct PostgresStreamRegistry {
    pool: Arc<PgPool>,
}

impl PostgresStreamRegistry {
    pub fn new(pool: PgPool) -> Self {
        Self { pool: Arc::new(pool) }
    }
}

#[async_trait]
impl StreamRegistry for PostgresStreamRegistry {
    #[instrument(skip(self, registration), fields(stream = %registration.id), err)]
    async fn save_stream(&self, registration: StreamRegistration) -> Result<(), StoreError> {
        let events: Vec<i64> = registration.events.iter().map(|t| i64::from(*t)).collect();

        sqlx::query(
            r#"
            INSERT INTO streams (id, events, timestamp)
            VALUES ($1, $2, $3)
            ON CONFLICT (id)
            DO UPDATE SET events = EXCLUDED.events, timestamp = EXCLUDED.timestamp
            "#,
        )
        .bind(&registration.id)
        .bind(&events)
        .bind(registration.timestamp)
        .execute(&*self.pool)
        .await
        .map_err(|e| StoreError::Fatal(format!("save_stream: {e}")))?;

        Ok(())
    }

    async fn find_streams(&self, event_type: u32) -> Result<Vec<String>, StoreError> {
        let rows = sqlx::query("SELECT id FROM streams WHERE $1 = ANY(events) ORDER BY id")
            .bind(i64::from(event_type))
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| StoreError::Fatal(format!("find_streams: {e}")))?;

        rows.into_iter()
            .map(|row| row.try_get("id").map_err(|e| StoreError::Fatal(format!("find_streams: {e}"))))
            .collect()
    }
}

//! Mapping from event types to the subscriber streams interested in them.
//!
//! Projections register their stream and event-type set on startup; the
//! broker resolves each ingress event's type back to the streams it should
//! fan out to.

pub mod cached;
pub mod in_memory;
pub mod postgres;

pub use cached::CachedStreamRegistry;
pub use in_memory::InMemoryStreamRegistry;
pub use postgres::PostgresStreamRegistry;

use std::sync::Arc;

use async_trait::async_trait;

use arque_core::{StoreError, StreamRegistration};

#[async_trait]
pub trait StreamRegistry: Send + Sync {
    /// Upsert a registration keyed by its stream id.
    async fn save_stream(&self, registration: StreamRegistration) -> Result<(), StoreError>;

    /// All stream ids whose registration contains `event_type`.
    async fn find_streams(&self, event_type: u32) -> Result<Vec<String>, StoreError>;
}

#[async_trait]
impl<R> StreamRegistry for Arc<R>
where
    R: StreamRegistry + ?Sized,
{
    async fn save_stream(&self, registration: StreamRegistration) -> Result<(), StoreError> {
        (**self).save_stream(registration).await
    }

    async fn find_streams(&self, event_type: u32) -> Result<Vec<String>, StoreError> {
        (**self).find_streams(event_type).await
    }
}

//! Bounded cache of live aggregates.
//!
//! Keyed by base64 aggregate id. The cache memoizes the *in-flight
//! construction* so simultaneous loads of one id share a single
//! construction; a failed construction is not cached, so the next caller
//! retries.

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use moka::future::Cache;

use arque_core::AggregateId;

use crate::aggregate::Aggregate;
use crate::error::EngineError;

#[derive(Debug, Copy, Clone)]
pub struct FactoryOptions {
    pub cache_max: u64,
    pub cache_ttl: Duration,
}

impl Default for FactoryOptions {
    fn default() -> Self {
        Self {
            cache_max: 2046,
            cache_ttl: Duration::from_secs(48 * 60 * 60),
        }
    }
}

#[derive(Debug, Copy, Clone, Default)]
pub struct LoadOptions {
    /// Return the instance as cached, without reloading it first.
    pub no_reload: bool,
}

type Constructor<S> =
    Arc<dyn Fn(AggregateId) -> BoxFuture<'static, Result<Aggregate<S>, EngineError>> + Send + Sync>;

pub struct AggregateFactory<S> {
    cache: Cache<String, Arc<Aggregate<S>>>,
    constructor: Constructor<S>,
}

impl<S> AggregateFactory<S>
where
    S: Clone + Send + Sync + 'static,
{
    /// `constructor` builds an aggregate (handlers registered, state at
    /// zero) for an id; the factory owns reloading.
    pub fn new<F, Fut>(constructor: F, opts: FactoryOptions) -> Self
    where
        F: Fn(AggregateId) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Aggregate<S>, EngineError>> + Send + 'static,
    {
        let cache = Cache::builder()
            .max_capacity(opts.cache_max)
            .time_to_live(opts.cache_ttl)
            .build();

        Self {
            cache,
            constructor: Arc::new(move |id| Box::pin(constructor(id))),
        }
    }

    /// The cached instance for `id`, constructing and memoizing it on a
    /// miss. Reloads before returning unless suppressed.
    pub async fn load(&self, id: AggregateId, opts: LoadOptions) -> Result<Arc<Aggregate<S>>, EngineError> {
        let constructor = self.constructor.clone();
        let aggregate = self
            .cache
            .try_get_with(id.to_base64(), async move { constructor(id).await.map(Arc::new) })
            .await
            .map_err(EngineError::Construction)?;

        if !opts.no_reload {
            aggregate.reload().await?;
        }
        Ok(aggregate)
    }

    /// Drop the cached instance for `id`, if any.
    pub async fn evict(&self, id: AggregateId) {
        self.cache.invalidate(&id.to_base64()).await;
    }
}

use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use lru::LruCache;

use arque_core::{StoreError, StreamRegistration};

use super::StreamRegistry;

/// Bounded read-through cache over a [`StreamRegistry`].
///
/// No negative caching: empty lookups always go to the backing registry.
/// `save_stream` writes through and drops the local cache eagerly, so a
/// process sees its own registrations immediately; registrations written by
/// other processes become visible within `cache_ttl` of when they were
/// cached here.
pub struct CachedStreamRegistry<R> {
    inner: R,
    cache: Mutex<LruCache<u32, CacheEntry>>,
    ttl: Duration,
}

struct CacheEntry {
    streams: Vec<String>,
    cached_at: Instant,
}

/// Defaults match the aggregate factory cache: 2046 entries, 48 h TTL.
pub const DEFAULT_CACHE_MAX: usize = 2046;
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(48 * 60 * 60);

impl<R> CachedStreamRegistry<R> {
    pub fn new(inner: R) -> Self {
        Self::with_limits(inner, DEFAULT_CACHE_MAX, DEFAULT_CACHE_TTL)
    }

    pub fn with_limits(inner: R, cache_max: usize, cache_ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(cache_max.max(1)).expect("max(1) is non-zero");
        Self {
            inner,
            cache: Mutex::new(LruCache::new(capacity)),
            ttl: cache_ttl,
        }
    }

    fn cached(&self, event_type: u32) -> Option<Vec<String>> {
        let mut cache = self.cache.lock().ok()?;
        match cache.get(&event_type) {
            Some(entry) if entry.cached_at.elapsed() < self.ttl => Some(entry.streams.clone()),
            Some(_) => {
                cache.pop(&event_type);
                None
            }
            None => None,
        }
    }
}

#[async_trait]
impl<R> StreamRegistry for CachedStreamRegistry<R>
where
    R: StreamRegistry,
{
    async fn save_stream(&self, registration: StreamRegistration) -> Result<(), StoreError> {
        self.inner.save_stream(registration).await?;

        // A registration can add or remove interest for any type; drop the
        // whole local cache rather than diffing.
        if let Ok(mut cache) = self.cache.lock() {
            cache.clear();
        }
        Ok(())
    }

    async fn find_streams(&self, event_type: u32) -> Result<Vec<String>, StoreError> {
        if let Some(streams) = self.cached(event_type) {
            return Ok(streams);
        }

        let streams = self.inner.find_streams(event_type).await?;

        if !streams.is_empty() {
            if let Ok(mut cache) = self.cache.lock() {
                cache.put(event_type, CacheEntry { streams: streams.clone(), cached_at: Instant::now() });
            }
        }
        Ok(streams)
    }
}

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;

use arque_core::{StoreError, StreamRegistration};

use super::StreamRegistry;

/// In-memory stream registry for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryStreamRegistry {
    registrations: RwLock<HashMap<String, StreamRegistration>>,
}

impl InMemoryStreamRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StreamRegistry for InMemoryStreamRegistry {
    async fn save_stream(&self, registration: StreamRegistration) -> Result<(), StoreError> {
        let mut registrations = self
            .registrations
            .write()
            .map_err(|_| StoreError::Fatal("lock poisoned".to_string()))?;
        registrations.insert(registration.id.clone(), registration);
        Ok(())
    }

    async fn find_streams(&self, event_type: u32) -> Result<Vec<String>, StoreError> {
        let registrations = self
            .registrations
            .read()
            .map_err(|_| StoreError::Fatal("lock poisoned".to_string()))?;

        let mut streams: Vec<String> = registrations
            .values()
            .filter(|r| r.events.contains(&event_type))
            .map(|r| r.id.clone())
            .collect();
        streams.sort();
        Ok(streams)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use chrono::Utc;

    use super::*;

    fn registration(id: &str, events: &[u32]) -> StreamRegistration {
        StreamRegistration {
            id: id.to_string(),
            events: BTreeSet::from_iter(events.iter().copied()),
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn reverse_lookup_finds_all_interested_streams() {
        let registry = InMemoryStreamRegistry::new();
        registry.save_stream(registration("a", &[1, 2])).await.unwrap();
        registry.save_stream(registration("b", &[2, 3])).await.unwrap();

        assert_eq!(registry.find_streams(1).await.unwrap(), vec!["a"]);
        assert_eq!(registry.find_streams(2).await.unwrap(), vec!["a", "b"]);
        assert_eq!(registry.find_streams(4).await.unwrap(), Vec::<String>::new());
    }

    #[tokio::test]
    async fn save_stream_overwrites_by_id() {
        let registry = InMemoryStreamRegistry::new();
        registry.save_stream(registration("a", &[1])).await.unwrap();
        registry.save_stream(registration("a", &[2])).await.unwrap();

        assert_eq!(registry.find_streams(1).await.unwrap(), Vec::<String>::new());
        assert_eq!(registry.find_streams(2).await.unwrap(), vec!["a"]);
    }
}

use async_trait::async_trait;
use moka::{Expiry, future::Cache};
use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
    time::{Duration, Instant},
};

use super::{CacheStore, CachedResponse};
use crate::error::CacheError;
use crate::lock::{rw_read, rw_write};

#[derive(Clone)]
struct StoredEntry {
    response: Arc<CachedResponse>,
    ttl: Duration,
}

/// Gives every entry the TTL it was stored with.
struct PerEntryTtl;

impl Expiry<String, StoredEntry> for PerEntryTtl {
    fn expire_after_create(
        &self,
        _key: &String,
        value: &StoredEntry,
        _created_at: Instant,
    ) -> Option<Duration> {
        Some(value.ttl)
    }

    fn expire_after_update(
        &self,
        _key: &String,
        value: &StoredEntry,
        _updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        Some(value.ttl)
    }
}

/// In-process store backed by a moka cache.
///
/// Tagged stores fold a per-tag generation number into every storage key. Flushing a
/// tag bumps its generation, so everything stored under the old generation stops being
/// addressable immediately and is reclaimed by capacity or TTL eviction later. A render
/// that started before a flush is stored under the new generation when it finishes.
#[derive(Clone)]
pub struct MemoryStore {
    cache: Cache<String, StoredEntry>,
    generations: Option<Arc<RwLock<HashMap<String, u64>>>>,
}

impl MemoryStore {
    /// Tag-capable store holding at most `max_capacity` entries.
    pub fn new(max_capacity: u64) -> Self {
        Self {
            cache: Self::build_cache(max_capacity),
            generations: Some(Arc::new(RwLock::new(HashMap::new()))),
        }
    }

    /// Store without tag support; `flush` does nothing.
    pub fn flat(max_capacity: u64) -> Self {
        Self {
            cache: Self::build_cache(max_capacity),
            generations: None,
        }
    }

    fn build_cache(max_capacity: u64) -> Cache<String, StoredEntry> {
        Cache::builder()
            .max_capacity(max_capacity)
            .expire_after(PerEntryTtl)
            .build()
    }

    fn generation(&self, tag: &str) -> u64 {
        match &self.generations {
            Some(generations) => rw_read(generations, "generation")
                .get(tag)
                .copied()
                .unwrap_or(1),
            None => 1,
        }
    }

    fn storage_key(&self, tag: Option<&str>, key: &str) -> String {
        match tag {
            Some(tag) if self.generations.is_some() => {
                let curr_gen = self.generation(tag);
                format!("{tag}:v{curr_gen}:{key}")
            }
            _ => key.to_string(),
        }
    }
}

#[async_trait]
impl CacheStore for MemoryStore {
    fn supports_tags(&self) -> bool {
        self.generations.is_some()
    }

    async fn get(&self, tag: Option<&str>, key: &str) -> Result<Option<CachedResponse>, CacheError> {
        let storage_key = self.storage_key(tag, key);
        Ok(self
            .cache
            .get(&storage_key)
            .await
            .map(|stored| stored.response.as_ref().clone()))
    }

    async fn put(
        &self,
        tag: Option<&str>,
        key: &str,
        entry: CachedResponse,
        ttl: Duration,
    ) -> Result<(), CacheError> {
        let storage_key = self.storage_key(tag, key);
        let stored = StoredEntry {
            response: Arc::new(entry),
            ttl,
        };
        self.cache.insert(storage_key, stored).await;
        Ok(())
    }

    async fn forget(&self, tag: Option<&str>, key: &str) -> Result<bool, CacheError> {
        let storage_key = self.storage_key(tag, key);
        Ok(self.cache.remove(&storage_key).await.is_some())
    }

    async fn flush(&self, tag: &str) -> Result<(), CacheError> {
        if let Some(generations) = &self.generations {
            let mut generations = rw_write(generations, "flush");
            let generation = generations.entry(tag.to_string()).or_insert(1);
            *generation += 1;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use pretty_assertions::assert_eq;

    const TAG: &str = "pagecache";

    fn entry(body: &str) -> CachedResponse {
        CachedResponse {
            status: 200,
            headers: vec![("content-type".to_string(), vec!["text/plain".to_string()])],
            content: body.as_bytes().to_vec(),
            expires_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn put_then_get_returns_entry() {
        let store = MemoryStore::new(100);
        store
            .put(Some(TAG), "k", entry("hello"), Duration::from_secs(60))
            .await
            .unwrap();

        let stored = store.get(Some(TAG), "k").await.unwrap().unwrap();
        assert_eq!(stored.status, 200);
        assert_eq!(stored.content, b"hello".to_vec());
        assert_eq!(
            stored.headers,
            vec![("content-type".to_string(), vec!["text/plain".to_string()])]
        );
    }

    #[tokio::test]
    async fn tags_are_separate_namespaces() {
        let store = MemoryStore::new(100);
        store
            .put(Some(TAG), "k", entry("tagged"), Duration::from_secs(60))
            .await
            .unwrap();

        assert!(store.get(None, "k").await.unwrap().is_none());
        assert!(store.get(Some("other"), "k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn flush_drops_only_the_flushed_tag() {
        let store = MemoryStore::new(100);
        let ttl = Duration::from_secs(60);
        store.put(Some(TAG), "a", entry("a"), ttl).await.unwrap();
        store.put(Some(TAG), "b", entry("b"), ttl).await.unwrap();
        store.put(Some("other"), "a", entry("other"), ttl).await.unwrap();

        store.flush(TAG).await.unwrap();

        assert!(store.get(Some(TAG), "a").await.unwrap().is_none());
        assert!(store.get(Some(TAG), "b").await.unwrap().is_none());
        assert!(store.get(Some("other"), "a").await.unwrap().is_some());

        store.put(Some(TAG), "a", entry("fresh"), ttl).await.unwrap();
        let fresh = store.get(Some(TAG), "a").await.unwrap().unwrap();
        assert_eq!(fresh.content, b"fresh".to_vec());
    }

    #[tokio::test]
    async fn forget_reports_whether_entry_existed() {
        let store = MemoryStore::new(100);
        store
            .put(Some(TAG), "k", entry("x"), Duration::from_secs(60))
            .await
            .unwrap();

        assert!(store.forget(Some(TAG), "k").await.unwrap());
        assert!(!store.forget(Some(TAG), "k").await.unwrap());
        assert!(store.get(Some(TAG), "k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn flat_store_ignores_flush() {
        let store = MemoryStore::flat(100);
        assert!(!store.supports_tags());

        store
            .put(None, "k", entry("x"), Duration::from_secs(60))
            .await
            .unwrap();
        store.flush(TAG).await.unwrap();

        assert!(store.get(None, "k").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn entries_expire_after_their_ttl() {
        let store = MemoryStore::new(100);
        store
            .put(Some(TAG), "short", entry("x"), Duration::from_millis(50))
            .await
            .unwrap();
        store
            .put(Some(TAG), "long", entry("y"), Duration::from_secs(60))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;

        assert!(store.get(Some(TAG), "short").await.unwrap().is_none());
        assert!(store.get(Some(TAG), "long").await.unwrap().is_some());
    }
}

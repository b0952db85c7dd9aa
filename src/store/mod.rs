//! Storage engines for cached page responses.
//!
//! The middleware only talks to [`CacheStore`]. Stores that can group entries under a
//! tag report it through [`CacheStore::supports_tags`]; the middleware then scopes every
//! operation to its tag so a single flush can drop all cached pages at once.

pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::CacheError;

pub use memory::MemoryStore;

/// Snapshot of a downstream response, as stored and replayed by the cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedResponse {
    pub status: u16,
    /// Header name with all of its values, in the order the response produced them
    pub headers: Vec<(String, Vec<String>)>,
    pub content: Vec<u8>,
    pub expires_at: DateTime<Utc>,
}

/// Key-value store backing the page cache.
///
/// `tag` is `Some` only when [`supports_tags`](CacheStore::supports_tags) returned true.
#[async_trait]
pub trait CacheStore: Send + Sync {
    fn supports_tags(&self) -> bool;

    async fn get(&self, tag: Option<&str>, key: &str) -> Result<Option<CachedResponse>, CacheError>;

    async fn put(
        &self,
        tag: Option<&str>,
        key: &str,
        entry: CachedResponse,
        ttl: Duration,
    ) -> Result<(), CacheError>;

    /// Remove a single entry. Returns whether an entry was present.
    async fn forget(&self, tag: Option<&str>, key: &str) -> Result<bool, CacheError>;

    /// Remove every entry stored under `tag`.
    async fn flush(&self, tag: &str) -> Result<(), CacheError>;
}

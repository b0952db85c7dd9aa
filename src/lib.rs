pub mod config;
pub mod error;
pub mod middleware;
pub mod store;

mod lock;

pub use config::{Config, PageCacheConfig};
pub use error::CacheError;
pub use middleware::PageCache;
pub use store::{CacheStore, CachedResponse, MemoryStore};

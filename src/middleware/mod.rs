pub mod cache;
pub mod flight;


pub use cache::{CACHE_TAG, PageCache, PageCacheService, resolve_key, resolve_minutes};
pub use flight::KeyLocks;

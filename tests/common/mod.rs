#![allow(dead_code)]

use actix_web::{HttpRequest, HttpResponse, http::header, web};
use async_trait::async_trait;
use std::{
    sync::atomic::{AtomicUsize, Ordering},
    time::Duration,
};

use pagecache::{CacheError, CacheStore, CachedResponse, PageCacheConfig};

/// Counts how many times a handler actually rendered.
pub type Renders = web::Data<AtomicUsize>;

pub fn renders() -> Renders {
    web::Data::new(AtomicUsize::new(0))
}

pub fn render_count(renders: &Renders) -> usize {
    renders.load(Ordering::SeqCst)
}

/// Config with every per-request control enabled.
pub fn permissive_config() -> PageCacheConfig {
    PageCacheConfig {
        allow_skip: true,
        allow_flush: true,
        allow_clear: true,
        ..PageCacheConfig::default()
    }
}

/// Renders a body naming the path and the render number, and sets a session cookie.
pub async fn counted_page(renders: Renders, req: HttpRequest) -> HttpResponse {
    let n = renders.fetch_add(1, Ordering::SeqCst) + 1;
    HttpResponse::Ok()
        .content_type("text/plain")
        .insert_header((header::SET_COOKIE, "session=abc123"))
        .insert_header(("x-render", n.to_string()))
        .body(format!("render {} of {}", n, req.path()))
}

pub async fn slow_page(renders: Renders) -> HttpResponse {
    actix_rt::time::sleep(Duration::from_millis(50)).await;
    let n = renders.fetch_add(1, Ordering::SeqCst) + 1;
    HttpResponse::Ok().body(format!("slow render {}", n))
}

pub async fn missing_page(renders: Renders) -> HttpResponse {
    renders.fetch_add(1, Ordering::SeqCst);
    HttpResponse::NotFound().body("no such page")
}

/// Store whose backend is always unreachable.
pub struct FailingStore;

#[async_trait]
impl CacheStore for FailingStore {
    fn supports_tags(&self) -> bool {
        true
    }

    async fn get(&self, _tag: Option<&str>, _key: &str) -> Result<Option<CachedResponse>, CacheError> {
        Err(CacheError::store("connection refused"))
    }

    async fn put(
        &self,
        _tag: Option<&str>,
        _key: &str,
        _entry: CachedResponse,
        _ttl: Duration,
    ) -> Result<(), CacheError> {
        Err(CacheError::store("connection refused"))
    }

    async fn forget(&self, _tag: Option<&str>, _key: &str) -> Result<bool, CacheError> {
        Err(CacheError::store("connection refused"))
    }

    async fn flush(&self, _tag: &str) -> Result<(), CacheError> {
        Err(CacheError::store("connection refused"))
    }
}

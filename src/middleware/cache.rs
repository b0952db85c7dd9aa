//! Page Cache Middleware
//!
//! Caches whole GET responses in a [`CacheStore`]:
//! - Derives the cache key from the URL, the non-control query parameters and the
//!   `X-Requested-With` header, so AJAX and full-page loads of one URL never share an entry
//! - Runs the downstream handler at most once per key while an entry is being computed
//! - Supports per-request bypass (`skipcache=1`), single-entry eviction (`clearcache=1`)
//!   and whole-tag flushing (`flushcache=1`), each gated by configuration
//! - Annotates every cached response with `X-Cache`, `X-Cache-Key` and `X-Cache-Expires`

use actix_web::{
    Error, HttpRequest, HttpResponse, ResponseError,
    body::{BoxBody, MessageBody, to_bytes},
    dev::{Service, ServiceRequest, ServiceResponse, Transform},
    http::{
        Method, StatusCode,
        header::{self, HeaderMap, HeaderName, HeaderValue},
    },
    web,
};
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use futures::future::{LocalBoxFuture, Ready, ok};
use sha2::{Digest, Sha256};
use std::{
    collections::BTreeMap,
    rc::Rc,
    sync::Arc,
    task::{Context, Poll},
    time::Duration,
};

use super::flight::KeyLocks;
use crate::config::PageCacheConfig;
use crate::store::{CacheStore, CachedResponse};

/// Tag grouping every page cache entry in tag-capable stores.
pub const CACHE_TAG: &str = "pagecache";

pub const SKIP_PARAM: &str = "skipcache";
pub const FLUSH_PARAM: &str = "flushcache";
pub const CLEAR_PARAM: &str = "clearcache";
const CONTROL_PARAMS: [&str; 3] = [SKIP_PARAM, FLUSH_PARAM, CLEAR_PARAM];

pub const X_CACHE: &str = "x-cache";
pub const X_CACHE_KEY: &str = "x-cache-key";
pub const X_CACHE_EXPIRES: &str = "x-cache-expires";
pub const REQUESTED_WITH: &str = "x-requested-with";

pub const HIT: &str = "Hit from cache";
pub const MISSED: &str = "Missed";

const EXPIRES_FORMAT: &str = "%Y-%m-%d %H:%M:%S %Z";

type QueryPairs = Vec<(String, String)>;

//============================================================================
// Key & TTL Resolution
//============================================================================

/// Derive the cache key for a request.
///
/// `url` must not contain the query string; `query` is filtered of control parameters
/// and serialized with sorted names before hashing. `requested_with` is the raw header
/// value, hashed byte for byte.
pub fn resolve_key(
    url: &str,
    query: &[(String, String)],
    requested_with: Option<&[u8]>,
) -> String {
    let mut params: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
    for (name, value) in query {
        if CONTROL_PARAMS.contains(&name.as_str()) {
            continue;
        }
        params.entry(name.as_str()).or_default().push(value.as_str());
    }
    let serialized = serde_json::to_string(&params).unwrap_or_default();

    let mut hasher = Sha256::new();
    hasher.update(url.as_bytes());
    hasher.update(serialized.as_bytes());
    hasher.update(requested_with.unwrap_or_default());
    hex::encode(hasher.finalize())
}

/// Effective TTL in minutes. An override can raise the TTL but never go below the default.
pub fn resolve_minutes(default_minutes: u32, minutes: Option<u32>) -> u32 {
    match minutes {
        Some(minutes) => default_minutes.max(minutes),
        None => default_minutes,
    }
}

fn parse_query(query_string: &str) -> QueryPairs {
    web::Query::<QueryPairs>::from_query(query_string)
        .map(|query| query.into_inner())
        .unwrap_or_default()
}

/// The last occurrence of a repeated flag decides.
pub(crate) fn flag_set(query: &[(String, String)], name: &str) -> bool {
    query
        .iter()
        .rev()
        .find(|(k, _)| k == name)
        .is_some_and(|(_, v)| v == "1")
}

fn request_url(req: &ServiceRequest) -> String {
    let info = req.connection_info();
    format!("{}://{}{}", info.scheme(), info.host(), req.path())
}

//============================================================================
// Snapshot & Response Assembly
//============================================================================

/// Per-request state: resolved key, TTL and whether the entry already existed.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct RequestContext {
    pub key: String,
    pub minutes: u32,
    pub hit: bool,
}

impl RequestContext {
    fn ttl(&self) -> Duration {
        Duration::from_secs(u64::from(self.minutes) * 60)
    }
}

/// Headers worth replaying. Cookies are per-client, and framing headers are recomputed
/// by the server for the rebuilt body.
fn is_storable(name: &HeaderName) -> bool {
    ![
        header::SET_COOKIE,
        header::CONTENT_LENGTH,
        header::TRANSFER_ENCODING,
        header::CONNECTION,
    ]
    .contains(name)
}

pub(crate) fn snapshot_headers(headers: &HeaderMap) -> Vec<(String, Vec<String>)> {
    let mut snapshot: Vec<(String, Vec<String>)> = Vec::new();

    for (name, value) in headers.iter() {
        if !is_storable(name) {
            continue;
        }
        let value = String::from_utf8_lossy(value.as_bytes()).into_owned();
        match snapshot.iter_mut().find(|(k, _)| k == name.as_str()) {
            Some((_, values)) => values.push(value),
            None => snapshot.push((name.as_str().to_string(), vec![value])),
        }
    }

    snapshot
}

pub(crate) fn build_response(entry: &CachedResponse) -> HttpResponse {
    let mut builder =
        HttpResponse::build(StatusCode::from_u16(entry.status).unwrap_or(StatusCode::OK));

    for (name, values) in &entry.headers {
        let Ok(header_name) = HeaderName::try_from(name.as_str()) else {
            log::warn!("Skipping cached header with invalid name: {}", name);
            continue;
        };
        for value in values {
            match HeaderValue::from_bytes(value.as_bytes()) {
                Ok(value) => {
                    builder.append_header((header_name.clone(), value));
                }
                Err(_) => log::warn!("Skipping invalid cached value for header {}", name),
            }
        }
    }

    builder.body(entry.content.clone())
}

pub(crate) fn format_expiry(expires_at: DateTime<Utc>, timezone: Tz) -> String {
    expires_at
        .with_timezone(&timezone)
        .format(EXPIRES_FORMAT)
        .to_string()
}

/// Add the diagnostic headers, leaving any same-named header from the snapshot intact.
pub(crate) fn annotate(headers: &mut HeaderMap, ctx: &RequestContext, expires: &str) {
    let status = if ctx.hit { HIT } else { MISSED };

    for (name, value) in [
        (HeaderName::from_static(X_CACHE), status),
        (HeaderName::from_static(X_CACHE_KEY), ctx.key.as_str()),
        (HeaderName::from_static(X_CACHE_EXPIRES), expires),
    ] {
        if headers.contains_key(&name) {
            continue;
        }
        match HeaderValue::from_str(value) {
            Ok(value) => {
                headers.insert(name, value);
            }
            Err(_) => log::warn!("Could not encode {} header value {:?}", name, value),
        }
    }
}

//============================================================================
// Fetch-or-compute
//============================================================================

/// Return the live entry for `ctx.key`, or run the downstream service and store its
/// response. `ctx.hit` is cleared when this call computed the entry.
async fn remember<S, B>(
    store: &dyn CacheStore,
    tag: Option<&str>,
    locks: &KeyLocks,
    ctx: &mut RequestContext,
    req: ServiceRequest,
    service: &S,
) -> Result<(HttpRequest, CachedResponse), Error>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error>,
    B: MessageBody + 'static,
    <B as MessageBody>::Error: ResponseError,
{
    if let Some(entry) = store.get(tag, &ctx.key).await? {
        log::debug!("Page cache hit for key {}", ctx.key);
        return Ok((req.into_parts().0, entry));
    }

    let _guard = locks.acquire(&ctx.key).await;

    // Another request may have stored the entry while we waited for the lock
    if let Some(entry) = store.get(tag, &ctx.key).await? {
        log::debug!("Page cache hit for key {} after waiting", ctx.key);
        return Ok((req.into_parts().0, entry));
    }

    ctx.hit = false;
    log::debug!("Page cache miss for key {}", ctx.key);

    let res = service.call(req).await?;
    let (req, res) = res.into_parts();
    let status = res.status();
    let headers = snapshot_headers(res.headers());
    let content = to_bytes(res.into_body()).await?;

    let entry = CachedResponse {
        status: status.as_u16(),
        headers,
        content: content.to_vec(),
        expires_at: Utc::now() + chrono::Duration::minutes(i64::from(ctx.minutes)),
    };
    store.put(tag, &ctx.key, entry.clone(), ctx.ttl()).await?;
    log::debug!(
        "Stored page cache entry {} for {} minutes",
        ctx.key,
        ctx.minutes
    );

    Ok((req, entry))
}

//============================================================================
// Actix-Web Middleware Implementation
//============================================================================

/// Page cache middleware factory.
///
/// Clones share the store and the lock registry, so wrapping several scopes with
/// clones of one `PageCache` still computes each key once.
#[derive(Clone)]
pub struct PageCache {
    store: Arc<dyn CacheStore>,
    config: Arc<PageCacheConfig>,
    minutes: Option<u32>,
    locks: KeyLocks,
}

impl PageCache {
    pub fn new(store: Arc<dyn CacheStore>, config: PageCacheConfig) -> Self {
        Self {
            store,
            config: Arc::new(config),
            minutes: None,
            locks: KeyLocks::new(),
        }
    }

    /// Cache for `minutes` instead of the configured default (never less than it).
    pub fn minutes(mut self, minutes: u32) -> Self {
        self.minutes = Some(minutes);
        self
    }
}

impl<S, B> Transform<S, ServiceRequest> for PageCache
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    B: MessageBody + 'static,
    <B as MessageBody>::Error: ResponseError,
{
    type Response = ServiceResponse<BoxBody>;
    type Error = Error;
    type InitError = ();
    type Transform = PageCacheService<S>;
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ok(PageCacheService {
            service: Rc::new(service),
            cache: self.clone(),
        })
    }
}

pub struct PageCacheService<S> {
    service: Rc<S>,
    cache: PageCache,
}

impl<S> PageCacheService<S> {
    fn should_bypass(&self, method: &Method, query: &[(String, String)]) -> bool {
        let config = &self.cache.config;
        config.skip
            || (config.allow_skip && flag_set(query, SKIP_PARAM))
            || method != Method::GET
    }
}

impl<S, B> Service<ServiceRequest> for PageCacheService<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    B: MessageBody + 'static,
    <B as MessageBody>::Error: ResponseError,
{
    type Response = ServiceResponse<BoxBody>;
    type Error = Error;
    type Future = LocalBoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.service.poll_ready(cx)
    }

    fn call(&self, req: ServiceRequest) -> Self::Future {
        let svc = self.service.clone();
        let query = parse_query(req.query_string());

        if self.should_bypass(req.method(), &query) {
            log::debug!("Page cache bypassed for {} {}", req.method(), req.path());
            return Box::pin(async move { Ok(svc.call(req).await?.map_into_boxed_body()) });
        }

        let config = self.cache.config.clone();
        let flush = config.allow_flush && flag_set(&query, FLUSH_PARAM);
        let clear = config.allow_clear && flag_set(&query, CLEAR_PARAM);

        let requested_with = req
            .headers()
            .get(REQUESTED_WITH)
            .map(HeaderValue::as_bytes);
        let mut ctx = RequestContext {
            key: resolve_key(&request_url(&req), &query, requested_with),
            minutes: resolve_minutes(config.default_minutes, self.cache.minutes),
            hit: true,
        };

        let store = self.cache.store.clone();
        let locks = self.cache.locks.clone();

        Box::pin(async move {
            let tag = store.supports_tags().then_some(CACHE_TAG);

            if flush {
                if tag.is_some() {
                    store.flush(CACHE_TAG).await?;
                    log::info!("Flushed all page cache entries under tag {}", CACHE_TAG);
                } else {
                    log::debug!("Ignoring page cache flush: store has no tag support");
                }
            }

            if clear {
                let removed = store.forget(tag, &ctx.key).await?;
                log::info!("Cleared page cache key {} (present: {})", ctx.key, removed);
            }

            let (req, entry) =
                remember(store.as_ref(), tag, &locks, &mut ctx, req, svc.as_ref()).await?;

            let mut res = build_response(&entry);
            annotate(
                res.headers_mut(),
                &ctx,
                &format_expiry(entry.expires_at, config.timezone),
            );

            Ok(ServiceResponse::new(req, res))
        })
    }
}

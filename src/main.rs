use actix_web::{App, HttpResponse, HttpServer, Responder, get, middleware::Logger, web};
use anyhow::Result;
use std::sync::Arc;

use pagecache::{CacheStore, Config, MemoryStore, PageCache};

#[get("/")]
async fn hello() -> impl Responder {
    HttpResponse::Ok().body("pagecache demo server")
}

#[get("/health")]
async fn health() -> impl Responder {
    HttpResponse::Ok().json(serde_json::json!({
        "status": "ok",
        "timestamp": chrono::Utc::now()
    }))
}

/// Renders a page with the time it was generated, making cache hits easy to spot.
async fn page(path: web::Path<String>) -> impl Responder {
    let name = path.into_inner();
    HttpResponse::Ok()
        .content_type("text/html; charset=utf-8")
        .body(format!(
            "<h1>{}</h1><p>Rendered at {}</p>",
            name,
            chrono::Utc::now().to_rfc3339()
        ))
}

async fn report() -> impl Responder {
    HttpResponse::Ok().json(serde_json::json!({
        "generated_at": chrono::Utc::now(),
    }))
}

#[actix_web::main]
async fn main() -> Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    // Initialize logger
    env_logger::init();

    let config = Config::from_env()?;
    log::info!(
        "Configuration loaded (environment: {}, default ttl: {} minutes)",
        config.environment,
        config.page_cache.default_minutes
    );

    let controls = &config.page_cache;
    if config.is_production() && (controls.allow_skip || controls.allow_flush || controls.allow_clear)
    {
        log::warn!(
            "Page cache query controls are enabled in production (skip: {}, flush: {}, clear: {})",
            controls.allow_skip,
            controls.allow_flush,
            controls.allow_clear
        );
    }

    let store: Arc<dyn CacheStore> = Arc::new(MemoryStore::new(config.page_cache.max_capacity));
    let page_cache = PageCache::new(store, config.page_cache.clone());

    let server_address = config.server_address();
    log::info!("Server starting on http://{}", server_address);

    HttpServer::new(move || {
        App::new()
            .wrap(Logger::new(
                r#"%a "%r" %s %b "%{Referer}i" "%{User-Agent}i" %T cache=%{x-cache}o"#,
            ))
            .service(hello)
            .service(health)
            .service(
                web::scope("/pages")
                    .wrap(page_cache.clone())
                    .route("/{name}", web::get().to(page)),
            )
            .service(
                web::scope("/reports")
                    .wrap(page_cache.clone().minutes(60))
                    .route("", web::get().to(report)),
            )
    })
    .bind(&server_address)?
    .run()
    .await
    .map_err(|e| anyhow::anyhow!("Server error: {}", e))
}

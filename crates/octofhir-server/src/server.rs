use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    Router, middleware,
    routing::{delete, get},
};
use octofhir_cache::ConnectionManager;
use octofhir_storage::InMemoryStore;
use tower_http::{compression::CompressionLayer, cors::CorsLayer, trace::TraceLayer};

use crate::{admin, config::AppConfig, fhir, handlers, middleware as app_middleware, state::AppState};

pub struct OctofhirServer {
    addr: SocketAddr,
    app: Router,
}

pub fn build_app(state: AppState) -> Router {
    let body_limit = state.config.server.body_limit_bytes;
    Router::new()
        // Health and info endpoints
        .route("/", get(handlers::root))
        .route("/healthz", get(handlers::healthz))
        .route("/readyz", get(handlers::readyz))
        .route("/metrics", get(handlers::metrics))
        // Streaming FHIR endpoints
        .route("/fhir/{resource_type}", get(fhir::search))
        .route("/fhir/{resource_type}/{id}", get(fhir::read))
        .route("/fhir/{resource_type}/{id}/$everything", get(fhir::everything))
        .route("/fhir/{resource_type}/{id}/$summary", get(fhir::summary))
        // Cache administration
        .route("/admin/cache", delete(admin::invalidate_keys))
        .route("/admin/cache/keys", get(admin::list_keys))
        .route("/admin/cache/metadata", get(admin::metadata))
        .route(
            "/admin/cache/{resource_type}/{id}",
            delete(admin::invalidate_resource),
        )
        .with_state(state)
        // Middleware stack, innermost first; request id wraps the trace span so the span sees it
        .layer(middleware::from_fn(app_middleware::http_metrics))
        .layer(CorsLayer::permissive())
        .layer(CompressionLayer::new())
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|req: &axum::http::Request<_>| {
                    use tracing::field::Empty;
                    let req_id = req
                        .extensions()
                        .get::<axum::http::HeaderValue>()
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or("")
                        .to_string();
                    tracing::info_span!(
                        "http.request",
                        http.method = %req.method(),
                        http.target = %req.uri(),
                        http.status_code = Empty,
                        request_id = %req_id
                    )
                })
                .on_response(
                    |res: &axum::http::Response<_>, latency: std::time::Duration, span: &tracing::Span| {
                        span.record("http.status_code", tracing::field::display(res.status().as_u16()));
                        tracing::info!(
                            http.status = %res.status().as_u16(),
                            elapsed_ms = %latency.as_millis(),
                            "request handled"
                        );
                    },
                ),
        )
        .layer(middleware::from_fn(app_middleware::request_id))
        .layer(axum::extract::DefaultBodyLimit::max(body_limit))
}

/// Builds the shared state from configuration: the cache connection (Redis
/// or local) and the in-memory store, seeded when `storage.seed_path` is set.
pub async fn build_state(cfg: AppConfig) -> anyhow::Result<AppState> {
    let connection = if cfg.redis.enabled {
        let manager = ConnectionManager::new(cfg.redis.clone())?;
        if let Err(e) = manager.connect().await {
            // Commands retry the connection lazily; streaming works without a cache.
            tracing::warn!(error = %e, "Redis unavailable at startup, cache operations will degrade");
        }
        manager
    } else {
        tracing::info!("Redis disabled, using local cache only");
        ConnectionManager::local()
    };

    let store = InMemoryStore::new();
    if let Some(path) = &cfg.storage.seed_path {
        let loaded = store.load_ndjson_file(path).await?;
        tracing::info!(path = %path, loaded, "Seeded in-memory store");
    }

    Ok(AppState::new(cfg, Arc::new(store), Arc::new(connection)))
}

pub struct ServerBuilder {
    addr: SocketAddr,
    config: AppConfig,
}

impl Default for ServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerBuilder {
    pub fn new() -> Self {
        let cfg = AppConfig::default();
        Self {
            addr: cfg.addr(),
            config: cfg,
        }
    }

    pub fn with_addr(mut self, addr: SocketAddr) -> Self {
        self.addr = addr;
        self
    }

    pub fn with_config(mut self, cfg: AppConfig) -> Self {
        self.addr = cfg.addr();
        self.config = cfg;
        self
    }

    pub async fn build(self) -> anyhow::Result<OctofhirServer> {
        let state = build_state(self.config).await?;
        Ok(OctofhirServer {
            addr: self.addr,
            app: build_app(state),
        })
    }
}

impl OctofhirServer {
    pub async fn run(self) -> anyhow::Result<()> {
        let listener = tokio::net::TcpListener::bind(self.addr).await?;
        tracing::info!("listening on {}", self.addr);
        axum::serve(listener, self.app)
            .with_graceful_shutdown(shutdown_signal())
            .await?;
        Ok(())
    }
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("shutdown signal received");
}

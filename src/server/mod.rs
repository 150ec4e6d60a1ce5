use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use axum::extract::{FromRef, Path, Query, State};
use axum::routing::{get, put};
use axum::{Json, Router, middleware};
use reqwest::Client;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{info, warn};

use crate::auth::{self, LoginLimiter};
use crate::config::AppConfig;
use crate::error::ApiError;
use crate::proxy::{self, ProxyService};
use crate::settings::{self, CredentialResolver};
use crate::store::{self, DEFAULT_CACHE_TTL, Store};


/// Shared handles for every route. Handlers pull the piece they need through `State<T>`.
#[derive(Clone, FromRef)]
pub struct AppState {
    pub store: Store,
    pub resolver: CredentialResolver,
    pub proxy: ProxyService,
    pub login_limiter: Arc<LoginLimiter>,
    pub http: Client,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(store: Store, http: Client, config: &AppConfig) -> Self {
        let resolver = CredentialResolver::new(store.clone());
        let proxy = ProxyService::new(http.clone(), resolver.clone(), config.upstream_timeout());
        let login_limiter = Arc::new(LoginLimiter::new(
            config.login_attempts,
            config.login_window(),
        ));
        Self {
            store,
            resolver,
            proxy,
            login_limiter,
            http,
            started_at: Instant::now(),
        }
    }
}

async fn health(State(started_at): State<Instant>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "uptimeSecs": started_at.elapsed().as_secs(),
    }))
}

async fn version() -> Json<Value> {
    Json(json!({
        "name": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn list_cache(State(store): State<Store>) -> Result<Json<Value>, ApiError> {
    store.cleanup_expired_cache().await?;
    let keys = store.cache_keys().await?;
    Ok(Json(json!({ "keys": keys })))
}

async fn get_cache_entry(
    State(store): State<Store>,
    Path(key): Path<String>,
) -> Result<Json<Value>, ApiError> {
    match store.get_cache(&key).await? {
        Some(value) => Ok(Json(json!({ "key": key, "value": value }))),
        None => Err(ApiError::NotFound(format!("cache entry '{key}' not found"))),
    }
}

#[derive(Debug, Deserialize)]
struct TtlQuery {
    ttl: Option<u64>,
}

async fn put_cache_entry(
    State(store): State<Store>,
    Path(key): Path<String>,
    Query(q): Query<TtlQuery>,
    Json(value): Json<Value>,
) -> Result<Json<Value>, ApiError> {
    let ttl = q.ttl.map(Duration::from_secs).unwrap_or(DEFAULT_CACHE_TTL);
    if ttl.is_zero() {
        return Err(ApiError::BadRequest("ttl must be positive".to_string()));
    }
    store.set_cache(&key, &value, ttl).await?;
    Ok(Json(json!({ "success": true, "key": key, "ttlSecs": ttl.as_secs() })))
}

async fn clear_cache(State(store): State<Store>) -> Result<Json<Value>, ApiError> {
    let removed = store.clear_cache().await?;
    info!("cache cleared ({removed} entries)");
    Ok(Json(json!({ "success": true, "removed": removed })))
}

/// Full HTTP surface. Settings, cache and proxy routes sit behind [`auth::require_auth`].
pub fn build_router(state: AppState) -> Router {
    let protected = Router::new()
        .route(
            "/api/settings",
            get(settings::get_settings).put(settings::put_settings_bulk),
        )
        .route(
            "/api/settings/{key}",
            put(settings::put_setting).delete(settings::delete_setting),
        )
        .route("/api/cache", get(list_cache).delete(clear_cache))
        .route("/api/cache/{key}", get(get_cache_entry).put(put_cache_entry))
        .merge(proxy::router())
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_auth,
        ));

    Router::new()
        .route("/api/health", get(health))
        .route("/api/version", get(version))
        .merge(auth::router(&state))
        .merge(protected)
        .with_state(state)
}

pub async fn serve(config: AppConfig) -> Result<()> {
    let data_dir = config.data_dir();
    let store = Store::open(&data_dir)
        .with_context(|| format!("failed to open store in {}", data_dir.display()))?;
    if let Some(path) = store.path() {
        info!("store opened at {}", path.display());
    }

    let sweeper = config
        .cache_sweep_interval()
        .map(|every| store::spawn_cache_sweeper(store.clone(), every));

    let http = Client::builder()
        .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
        .build()?;
    let app = build_router(AppState::new(store, http, &config));

    let listener = tokio::net::TcpListener::bind(config.listen)
        .await
        .with_context(|| format!("failed to bind {}", config.listen))?;
    info!("mediahub listening on http://{}", config.listen);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    if let Some(handle) = sweeper {
        handle.abort();
    }
    info!("mediahub stopped");
    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        match (
            signal(SignalKind::interrupt()),
            signal(SignalKind::terminate()),
        ) {
            (Ok(mut sigint), Ok(mut sigterm)) => {
                tokio::select! {
                    _ = sigint.recv() => {},
                    _ = sigterm.recv() => {},
                }
            }
            _ => {
                warn!("failed to install signal handlers; falling back to ctrl-c");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
    info!("shutdown signal received");
}

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use axum::body::Bytes;
use axum::extract::{ConnectInfo, Request, State};
use axum::http::{HeaderValue, StatusCode, header};
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tracing::{info, warn};

use crate::error::ApiError;
use crate::proxy::scheme::media_browser_authorization;
use crate::server::AppState;
use crate::settings::{CredentialResolver, MEDIA_SERVER};
use crate::store::{Store, StoreError};

/// The logged-in dashboard user, derived from the stored Jellyfin session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    pub id: String,
    pub name: String,
    pub server_id: String,
}

async fn current_identity(resolver: &CredentialResolver) -> Result<Option<Identity>, ApiError> {
    let cfg = match resolver.resolve(MEDIA_SERVER).await {
        Ok(Some(cfg)) => cfg,
        Ok(None) => return Ok(None),
        Err(err @ StoreError::Decode { .. }) => {
            warn!("treating unreadable media server settings as logged out: {err}");
            return Ok(None);
        }
        Err(err) => return Err(err.into()),
    };
    if !cfg.has_session() {
        return Ok(None);
    }
    Ok(Some(Identity {
        id: cfg.user_id().unwrap_or_default().to_string(),
        name: cfg.user_name.clone().unwrap_or_default(),
        server_id: cfg.server_id.clone().unwrap_or_default(),
    }))
}

/// Reject unless a Jellyfin session is stored; otherwise attach [`Identity`] to the request.
pub async fn require_auth(
    State(resolver): State<CredentialResolver>,
    mut req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let identity = current_identity(&resolver)
        .await?
        .ok_or(ApiError::Unauthenticated)?;
    req.extensions_mut().insert(identity);
    Ok(next.run(req).await)
}

/// Like [`require_auth`] but never rejects; [`Identity`] is attached only when present.
pub async fn optional_auth(
    State(resolver): State<CredentialResolver>,
    mut req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    if let Some(identity) = current_identity(&resolver).await? {
        req.extensions_mut().insert(identity);
    }
    Ok(next.run(req).await)
}

#[derive(Debug)]
struct Window {
    started: Instant,
    attempts: u32,
}

/// Fixed-window attempt counter keyed by client address.
#[derive(Debug)]
pub struct LoginLimiter {
    max_attempts: u32,
    window: Duration,
    windows: Mutex<HashMap<String, Window>>,
}

impl LoginLimiter {
    pub fn new(max_attempts: u32, window: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            window,
            windows: Mutex::new(HashMap::new()),
        }
    }

    /// Count one attempt for `key`; `Err(retry_after_secs)` once the window is exhausted.
    pub fn check(&self, key: &str) -> Result<(), u64> {
        let now = Instant::now();
        let mut map = match self.windows.lock() {
            Ok(g) => g,
            Err(e) => e.into_inner(),
        };
        map.retain(|_, w| now.duration_since(w.started) < self.window);
        let entry = map.entry(key.to_string()).or_insert(Window {
            started: now,
            attempts: 0,
        });
        if entry.attempts >= self.max_attempts {
            let left = self.window.saturating_sub(now.duration_since(entry.started));
            return Err(left.as_secs().max(1));
        }
        entry.attempts += 1;
        Ok(())
    }

    pub fn reset(&self, key: &str) {
        let mut map = match self.windows.lock() {
            Ok(g) => g,
            Err(e) => e.into_inner(),
        };
        map.remove(key);
    }
}

fn client_key(req: &Request) -> String {
    req.extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Wraps only the login route.
pub async fn login_rate_limit(
    State(limiter): State<Arc<LoginLimiter>>,
    req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let key = client_key(&req);
    if let Err(retry_after_secs) = limiter.check(&key) {
        warn!("login rate limit hit for {key}");
        return Err(ApiError::TooManyRequests { retry_after_secs });
    }
    let resp = next.run(req).await;
    if resp.status().is_success() {
        limiter.reset(&key);
    }
    Ok(resp)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LoginRequest {
    #[serde(default)]
    server_url: String,
    #[serde(default)]
    username: String,
    #[serde(default)]
    password: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct JellyfinUser {
    id: String,
    name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct JellyfinAuthResult {
    access_token: String,
    user: JellyfinUser,
    #[serde(default)]
    server_id: String,
}

/// `POST {server}/Users/AuthenticateByName`.
async fn authenticate_by_name(
    client: &Client,
    server_url: &str,
    username: &str,
    password: &str,
) -> Result<JellyfinAuthResult, ApiError> {
    let url = format!("{server_url}/Users/AuthenticateByName");
    let mut auth = HeaderValue::from_str(&media_browser_authorization(None))
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;
    auth.set_sensitive(true);

    let resp = client
        .post(&url)
        .header("x-emby-authorization", auth)
        .header(header::ACCEPT, "application/json")
        .json(&json!({ "Username": username, "Pw": password }))
        .send()
        .await
        .map_err(|e| {
            ApiError::BadRequest(format!(
                "could not reach Jellyfin at {server_url}: {}",
                crate::proxy::describe_transport_error(e)
            ))
        })?;

    let status = resp.status();
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        return Err(ApiError::InvalidCredentials);
    }
    if !status.is_success() {
        return Err(ApiError::BadRequest(format!(
            "Jellyfin rejected the login with status {status}"
        )));
    }
    resp.json::<JellyfinAuthResult>()
        .await
        .map_err(|e| ApiError::BadRequest(format!("unexpected Jellyfin login response: {e}")))
}

fn object_or_empty(value: Option<Value>) -> Map<String, Value> {
    match value {
        Some(Value::Object(map)) => map,
        _ => Map::new(),
    }
}

async fn login(
    State(store): State<Store>,
    State(client): State<Client>,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    let req: LoginRequest = serde_json::from_slice(&body)
        .map_err(|e| ApiError::BadRequest(format!("invalid login body: {e}")))?;
    let server_url = req.server_url.trim().trim_end_matches('/').to_string();
    if server_url.is_empty() || req.username.trim().is_empty() {
        return Err(ApiError::BadRequest(
            "serverUrl and username are required".to_string(),
        ));
    }

    let result = authenticate_by_name(&client, &server_url, req.username.trim(), &req.password).await?;
    if result.access_token.trim().is_empty() || result.user.id.trim().is_empty() {
        return Err(ApiError::InvalidCredentials);
    }

    // keep any extra fields (apiKey etc.) already stored for the media server
    let mut stored = object_or_empty(store.get_setting(MEDIA_SERVER).await?);
    stored.insert("url".to_string(), json!(server_url));
    stored.insert("token".to_string(), json!(result.access_token));
    stored.insert("userId".to_string(), json!(result.user.id));
    stored.insert("userName".to_string(), json!(result.user.name));
    stored.insert("serverId".to_string(), json!(result.server_id));
    stored
        .entry("apiKey".to_string())
        .or_insert_with(|| json!(""));
    store
        .set_setting(MEDIA_SERVER, &Value::Object(stored))
        .await?;

    info!("user '{}' logged in via {}", result.user.name, server_url);
    let user = Identity {
        id: result.user.id,
        name: result.user.name,
        server_id: result.server_id,
    };
    Ok(Json(json!({ "success": true, "user": user })))
}

async fn status(identity: Option<Extension<Identity>>) -> Json<Value> {
    match identity {
        Some(Extension(user)) => Json(json!({ "authenticated": true, "user": user })),
        None => Json(json!({ "authenticated": false })),
    }
}

/// Blank the session fields; the server URL stays so the login form is prefilled.
async fn logout(State(store): State<Store>) -> Result<Json<Value>, ApiError> {
    if let Some(value) = store.get_setting(MEDIA_SERVER).await? {
        let mut stored = object_or_empty(Some(value));
        for field in ["token", "userId", "userName"] {
            stored.insert(field.to_string(), json!(""));
        }
        store
            .set_setting(MEDIA_SERVER, &Value::Object(stored))
            .await?;
        info!("logged out");
    }
    Ok(Json(json!({ "success": true })))
}

pub fn router(state: &AppState) -> Router<AppState> {
    Router::new()
        .route(
            "/api/auth/login",
            post(login).route_layer(middleware::from_fn_with_state(
                state.clone(),
                login_rate_limit,
            )),
        )
        .route(
            "/api/auth/status",
            get(status).route_layer(middleware::from_fn_with_state(
                state.clone(),
                optional_auth,
            )),
        )
        .route("/api/auth/logout", post(logout))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::spawn_axum_server;

    async fn gated_get(store: Store) -> reqwest::Response {
        let resolver = CredentialResolver::new(store);
        let app = Router::new()
            .route(
                "/protected",
                get(|Extension(id): Extension<Identity>| async move { id.name }),
            )
            .route_layer(middleware::from_fn_with_state(resolver, require_auth));
        let (addr, handle) = spawn_axum_server(app);
        let resp = Client::new()
            .get(format!("http://{addr}/protected"))
            .send()
            .await
            .expect("send");
        handle.abort();
        resp
    }

    #[tokio::test]
    async fn require_auth_fails_closed_without_config() {
        let store = Store::open_in_memory().expect("open");
        let resp = gated_get(store).await;
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        let body: Value = resp.json().await.expect("json");
        assert_eq!(body["error"], "unauthenticated");
    }

    #[tokio::test]
    async fn require_auth_treats_empty_token_as_missing() {
        let store = Store::open_in_memory().expect("open");
        store
            .set_setting(
                MEDIA_SERVER,
                &json!({ "url": "http://jf:8096", "token": "", "userId": "u1" }),
            )
            .await
            .expect("set");
        assert_eq!(gated_get(store).await.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn require_auth_attaches_identity() {
        let store = Store::open_in_memory().expect("open");
        store
            .set_setting(
                MEDIA_SERVER,
                &json!({
                    "url": "http://jf:8096",
                    "token": "t",
                    "userId": "u1",
                    "userName": "alice",
                    "serverId": "s1",
                }),
            )
            .await
            .expect("set");
        let resp = gated_get(store).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.text().await.expect("text"), "alice");
    }

    #[tokio::test]
    async fn optional_auth_passes_anonymous_requests() {
        let store = Store::open_in_memory().expect("open");
        let app = Router::new()
            .route(
                "/maybe",
                get(|id: Option<Extension<Identity>>| async move {
                    if id.is_some() { "user" } else { "anon" }
                }),
            )
            .route_layer(middleware::from_fn_with_state(
                CredentialResolver::new(store),
                optional_auth,
            ));
        let (addr, handle) = spawn_axum_server(app);
        let resp = Client::new()
            .get(format!("http://{addr}/maybe"))
            .send()
            .await
            .expect("send");
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.text().await.expect("text"), "anon");
        handle.abort();
    }

    #[test]
    fn limiter_blocks_after_max_attempts_and_resets() {
        let limiter = LoginLimiter::new(2, Duration::from_secs(60));
        assert!(limiter.check("1.2.3.4").is_ok());
        assert!(limiter.check("1.2.3.4").is_ok());
        let retry = limiter.check("1.2.3.4").expect_err("third attempt blocked");
        assert!(retry > 0 && retry <= 60);
        assert!(limiter.check("5.6.7.8").is_ok());

        limiter.reset("1.2.3.4");
        assert!(limiter.check("1.2.3.4").is_ok());
    }

    #[test]
    fn limiter_window_expires() {
        let limiter = LoginLimiter::new(1, Duration::from_millis(20));
        assert!(limiter.check("k").is_ok());
        assert!(limiter.check("k").is_err());
        std::thread::sleep(Duration::from_millis(30));
        assert!(limiter.check("k").is_ok());
    }
}

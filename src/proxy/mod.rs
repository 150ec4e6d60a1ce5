use std::time::{Duration, Instant};

use axum::body::{Body, Bytes};
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, HeaderValue, Method, Response, header};
use axum::routing::any;
use axum::{Extension, Router};
use reqwest::{Client, Url};
use serde_json::Value;
use tracing::{Span, debug, field, instrument, warn};
use uuid::Uuid;

mod relay;
pub mod scheme;

use crate::auth::Identity;
use crate::error::ApiError;
use crate::logging::{RequestLog, log_request, redact_url, timestamp_ms};
use crate::server::AppState;
use crate::settings::{CredentialResolver, ServiceConfig};

use self::relay::{RelayMeta, relay_response};
use self::scheme::AuthScheme;

/// One call to forward, as received from the dashboard.
#[derive(Debug, Clone)]
pub struct ForwardRequest {
    pub service: String,
    pub sub_path: String,
    pub method: Method,
    pub query: Vec<(String, String)>,
    pub body: Bytes,
    pub user: Option<String>,
}

/// `{base}/{sub_path}` plus `query`, appended with `&` when the target already has a query
/// string. An empty `query` leaves the target untouched.
pub fn build_target(
    base_url: &str,
    sub_path: &str,
    query: &[(String, String)],
) -> Result<Url, ApiError> {
    let base = base_url.trim_end_matches('/');
    let sub_path = sub_path.trim_start_matches('/');
    let full = if sub_path.is_empty() {
        base.to_string()
    } else {
        format!("{base}/{sub_path}")
    };
    let mut url = Url::parse(&full)
        .map_err(|e| ApiError::BadRequest(format!("invalid upstream url {full}: {e}")))?;
    if !query.is_empty() {
        url.query_pairs_mut().extend_pairs(query);
    }
    Ok(url)
}

fn carries_body(method: &Method) -> bool {
    matches!(*method, Method::POST | Method::PUT | Method::PATCH)
}

/// Flatten a reqwest error and its causes into one line, with any URL stripped so credentials
/// carried in the query string never reach the caller.
pub(crate) fn describe_transport_error(err: reqwest::Error) -> String {
    let timed_out = err.is_timeout();
    let err = err.without_url();
    let mut out = err.to_string();
    let mut source = std::error::Error::source(&err);
    while let Some(cause) = source {
        out.push_str(": ");
        out.push_str(&cause.to_string());
        source = cause.source();
    }
    if timed_out && !out.contains("timed out") {
        out.push_str(" (timed out)");
    }
    out
}

/// Forwards dashboard calls to the configured upstream with that service's credential scheme.
#[derive(Clone)]
pub struct ProxyService {
    client: Client,
    resolver: CredentialResolver,
    timeout: Duration,
}

impl ProxyService {
    pub fn new(client: Client, resolver: CredentialResolver, timeout: Duration) -> Self {
        Self {
            client,
            resolver,
            timeout,
        }
    }

    async fn configured(&self, service: &str) -> Result<ServiceConfig, ApiError> {
        self.resolver
            .resolve(service)
            .await?
            .filter(ServiceConfig::is_configured)
            .ok_or_else(|| ApiError::NotConfigured(service.to_string()))
    }

    #[instrument(skip_all, fields(service = %req.service, method = %req.method, request_id = field::Empty))]
    pub async fn forward(&self, req: ForwardRequest) -> Result<Response<Body>, ApiError> {
        let start = Instant::now();
        let request_id = Uuid::new_v4().to_string();
        Span::current().record("request_id", request_id.as_str());
        let cfg = self.configured(&req.service).await?;

        let injection = AuthScheme::for_service(&req.service).inject(&cfg);
        let mut query = req.query;
        query.extend(injection.query);
        let target = build_target(cfg.base_url(), &req.sub_path, &query)?;

        let mut headers = HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
        headers.insert(header::ACCEPT, HeaderValue::from_static("application/json"));
        headers.extend(injection.headers);

        let mut builder = self
            .client
            .request(req.method.clone(), target.clone())
            .headers(headers)
            .timeout(self.timeout);
        if carries_body(&req.method) && !req.body.is_empty() {
            let payload: Value = serde_json::from_slice(&req.body).map_err(|e| {
                ApiError::BadRequest(format!("request body must be valid JSON: {e}"))
            })?;
            builder = builder.json(&payload);
        }

        let target_log = redact_url(target.as_str());
        let path = format!("/{}", req.sub_path.trim_start_matches('/'));
        debug!(
            "forwarding {} {} to {} (user: {})",
            req.method,
            path,
            target_log,
            req.user.as_deref().unwrap_or("-")
        );

        let resp = match builder.send().await {
            Ok(resp) => resp,
            Err(e) => {
                let message = describe_transport_error(e);
                warn!("{} unreachable: {}", req.service, message);
                log_request(&RequestLog {
                    timestamp_ms: timestamp_ms(),
                    request_id: &request_id,
                    service: &req.service,
                    method: req.method.as_str(),
                    path: &path,
                    status_code: 500,
                    duration_ms: start.elapsed().as_millis() as u64,
                    target_url: &target_log,
                    content_type: None,
                    bytes_streamed: None,
                    user: req.user.as_deref(),
                    error: Some(&message),
                });
                return Err(ApiError::UpstreamUnreachable {
                    service: req.service,
                    message,
                });
            }
        };

        let meta = RelayMeta {
            request_id,
            service: req.service,
            method: req.method.to_string(),
            path,
            target_url: target_log,
            user: req.user,
            start,
        };
        relay_response(meta, resp).await
    }
}

async fn proxy_service_root(
    State(proxy): State<ProxyService>,
    identity: Option<Extension<Identity>>,
    Path(service): Path<String>,
    method: Method,
    Query(query): Query<Vec<(String, String)>>,
    body: Bytes,
) -> Result<Response<Body>, ApiError> {
    proxy
        .forward(ForwardRequest {
            service,
            sub_path: String::new(),
            method,
            query,
            body,
            user: identity.map(|Extension(id)| id.name),
        })
        .await
}

async fn proxy_service_path(
    State(proxy): State<ProxyService>,
    identity: Option<Extension<Identity>>,
    Path((service, sub_path)): Path<(String, String)>,
    method: Method,
    Query(query): Query<Vec<(String, String)>>,
    body: Bytes,
) -> Result<Response<Body>, ApiError> {
    proxy
        .forward(ForwardRequest {
            service,
            sub_path,
            method,
            query,
            body,
            user: identity.map(|Extension(id)| id.name),
        })
        .await
}

/// `ANY /api/proxy/{service}/{*path}`; authentication is layered on by the caller.
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/proxy/{service}", any(proxy_service_root))
        .route("/api/proxy/{service}/{*path}", any(proxy_service_path))
}

use axum::Json;
use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use serde_json::{Value, json};
use tracing::error;

use crate::store::StoreError;

/// Every failure the HTTP surface can report. Each variant maps to a distinct `error` code so
/// the UI can tell "configure it", "log in" and "the upstream failed" apart.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0} is not configured")]
    NotConfigured(String),
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    NotFound(String),
    #[error("authentication required")]
    Unauthenticated,
    #[error("invalid username or password")]
    InvalidCredentials,
    #[error("too many login attempts; retry in {retry_after_secs}s")]
    TooManyRequests { retry_after_secs: u64 },
    #[error("failed to reach {service}: {message}")]
    UpstreamUnreachable { service: String, message: String },
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<Value>,
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::NotConfigured(_) | ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Unauthenticated | ApiError::InvalidCredentials => StatusCode::UNAUTHORIZED,
            ApiError::TooManyRequests { .. } => StatusCode::TOO_MANY_REQUESTS,
            ApiError::UpstreamUnreachable { .. } | ApiError::Store(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            ApiError::NotConfigured(_) => "not_configured",
            ApiError::BadRequest(_) => "bad_request",
            ApiError::NotFound(_) => "not_found",
            ApiError::Unauthenticated => "unauthenticated",
            ApiError::InvalidCredentials => "invalid_credentials",
            ApiError::TooManyRequests { .. } => "too_many_requests",
            ApiError::UpstreamUnreachable { .. } => "upstream_unreachable",
            ApiError::Store(_) => "internal",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let code = self.code();
        let (message, details) = match &self {
            ApiError::Unauthenticated => (
                "Please log in with your Jellyfin account to continue.".to_string(),
                None,
            ),
            ApiError::UpstreamUnreachable { service, message } => (
                self.to_string(),
                Some(json!({ "service": service, "error": message })),
            ),
            ApiError::Store(err) => {
                error!("store failure: {err}");
                ("internal server error".to_string(), None)
            }
            _ => (self.to_string(), None),
        };

        let mut resp = (
            status,
            Json(ErrorBody {
                error: code,
                message: Some(message),
                details,
            }),
        )
            .into_response();
        if let ApiError::TooManyRequests { retry_after_secs } = self
            && let Ok(v) = HeaderValue::from_str(&retry_after_secs.to_string())
        {
            resp.headers_mut().insert(header::RETRY_AFTER, v);
        }
        resp
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;

    async fn body_json(err: ApiError) -> (StatusCode, Value) {
        let resp = err.into_response();
        let status = resp.status();
        let bytes = to_bytes(resp.into_body(), 64 * 1024).await.expect("body");
        (status, serde_json::from_slice(&bytes).expect("json"))
    }

    #[tokio::test]
    async fn not_configured_names_the_service() {
        let (status, body) = body_json(ApiError::NotConfigured("radarr".to_string())).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "not_configured");
        assert_eq!(body["message"], "radarr is not configured");
    }

    #[tokio::test]
    async fn store_failures_hide_detail() {
        let err = ApiError::Store(StoreError::Worker("disk on fire".to_string()));
        let (status, body) = body_json(err).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["error"], "internal");
        assert!(!body.to_string().contains("disk on fire"));
    }

    #[tokio::test]
    async fn unreachable_carries_service_and_cause() {
        let (status, body) = body_json(ApiError::UpstreamUnreachable {
            service: "sonarr".to_string(),
            message: "connection refused".to_string(),
        })
        .await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["error"], "upstream_unreachable");
        assert_eq!(body["details"]["service"], "sonarr");
        assert_eq!(body["details"]["error"], "connection refused");
    }

    #[test]
    fn rate_limit_sets_retry_after() {
        let resp = ApiError::TooManyRequests { retry_after_secs: 42 }.into_response();
        assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(resp.headers().get(header::RETRY_AFTER).unwrap(), "42");
    }
}

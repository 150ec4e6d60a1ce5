use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Instant;

use axum::Json;
use axum::body::{Body, Bytes};
use axum::http::{HeaderMap, HeaderValue, Response, StatusCode, header};
use axum::response::IntoResponse;
use futures_util::StreamExt;
use serde_json::Value;
use tracing::warn;

use crate::error::ApiError;
use crate::logging::{
    RequestLog, header_map_to_entries, http_warn_options, log_request, make_body_preview,
    timestamp_ms,
};

pub(super) const DEFAULT_IMAGE_CACHE_CONTROL: &str = "public, max-age=86400";
const TEXT_CONTENT_TYPE: &str = "text/plain; charset=utf-8";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum ContentKind {
    Json,
    Image,
    Text,
}

pub(super) fn classify_content_type(content_type: Option<&str>) -> ContentKind {
    let Some(ct) = content_type else {
        return ContentKind::Text;
    };
    let base = ct
        .split(';')
        .next()
        .unwrap_or("")
        .trim()
        .to_ascii_lowercase();
    if base == "application/json" || base.ends_with("+json") {
        ContentKind::Json
    } else if base.starts_with("image/") {
        ContentKind::Image
    } else {
        ContentKind::Text
    }
}

/// Per-request facts carried into the relay for logging.
pub(super) struct RelayMeta {
    pub(super) request_id: String,
    pub(super) service: String,
    pub(super) method: String,
    pub(super) path: String,
    pub(super) target_url: String,
    pub(super) user: Option<String>,
    pub(super) start: Instant,
}

impl RelayMeta {
    fn log(&self, status: StatusCode, content_type: Option<&str>, streamed: Option<u64>, error: Option<&str>) {
        log_request(&RequestLog {
            timestamp_ms: timestamp_ms(),
            request_id: &self.request_id,
            service: &self.service,
            method: &self.method,
            path: &self.path,
            status_code: status.as_u16(),
            duration_ms: self.start.elapsed().as_millis() as u64,
            target_url: &self.target_url,
            content_type,
            bytes_streamed: streamed,
            user: self.user.as_deref(),
            error,
        });
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: header::HeaderName) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn warn_non_success(meta: &RelayMeta, status: StatusCode, headers: &HeaderMap, body: &[u8]) {
    let opt = http_warn_options();
    if opt.enabled {
        let preview = make_body_preview(
            body,
            header_str(headers, header::CONTENT_TYPE),
            opt.max_body_bytes,
        );
        let headers = serde_json::to_string(&header_map_to_entries(headers)).unwrap_or_default();
        let preview = serde_json::to_string(&preview).unwrap_or_default();
        warn!(
            "{} returned {} for {} {}; headers={} body={}",
            meta.service, status, meta.method, meta.path, headers, preview
        );
    } else {
        warn!(
            "{} returned {} for {} {}; set MEDIAHUB_HTTP_WARN=1 to log a body preview",
            meta.service, status, meta.method, meta.path
        );
    }
}

fn read_failure(meta: &RelayMeta, err: reqwest::Error) -> ApiError {
    let message = super::describe_transport_error(err);
    warn!("reading {} response failed: {}", meta.service, message);
    ApiError::UpstreamUnreachable {
        service: meta.service.clone(),
        message,
    }
}

/// Translate an upstream response by content type. Non-2xx statuses are relayed verbatim.
pub(super) async fn relay_response(
    meta: RelayMeta,
    resp: reqwest::Response,
) -> Result<Response<Body>, ApiError> {
    let status = resp.status();
    let content_type = header_str(resp.headers(), header::CONTENT_TYPE).map(str::to_string);

    match classify_content_type(content_type.as_deref()) {
        ContentKind::Image => Ok(stream_image(meta, resp, content_type)),
        kind => {
            let headers = resp.headers().clone();
            let bytes = resp.bytes().await.map_err(|e| read_failure(&meta, e))?;
            if !status.is_success() {
                warn_non_success(&meta, status, &headers, &bytes);
            }
            meta.log(status, content_type.as_deref(), None, None);

            if kind == ContentKind::Json
                && let Ok(value) = serde_json::from_slice::<Value>(&bytes)
            {
                return Ok((status, Json(value)).into_response());
            }
            Ok(text_response(status, bytes))
        }
    }
}

fn text_response(status: StatusCode, bytes: Bytes) -> Response<Body> {
    let text = String::from_utf8_lossy(&bytes).into_owned();
    let mut resp = Response::new(Body::from(text));
    *resp.status_mut() = status;
    resp.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static(TEXT_CONTENT_TYPE),
    );
    resp
}

/// Logs the streamed image once the body is finished or the client has gone away.
struct StreamFinalize {
    meta: RelayMeta,
    status: StatusCode,
    content_type: Option<String>,
    bytes: Arc<AtomicU64>,
    failed: Arc<AtomicBool>,
}

impl Drop for StreamFinalize {
    fn drop(&mut self) {
        let streamed = self.bytes.load(Ordering::Relaxed);
        let error = self
            .failed
            .load(Ordering::Relaxed)
            .then_some("upstream stream error");
        self.meta
            .log(self.status, self.content_type.as_deref(), Some(streamed), error);
    }
}

fn stream_image(meta: RelayMeta, resp: reqwest::Response, content_type: Option<String>) -> Response<Body> {
    let status = resp.status();
    let upstream_headers = resp.headers().clone();
    if !status.is_success() {
        warn!(
            "{} returned {} for image {} {}",
            meta.service, status, meta.method, meta.path
        );
    }

    let bytes = Arc::new(AtomicU64::new(0));
    let failed = Arc::new(AtomicBool::new(false));
    let service = meta.service.clone();
    let finalize = StreamFinalize {
        meta,
        status,
        content_type,
        bytes: bytes.clone(),
        failed: failed.clone(),
    };

    let stream = resp.bytes_stream().map(move |item| {
        // keep finalize alive until the stream is dropped
        let _finalize = &finalize;
        match item {
            Ok(chunk) => {
                bytes.fetch_add(chunk.len() as u64, Ordering::Relaxed);
                Ok(chunk)
            }
            Err(e) => {
                failed.store(true, Ordering::Relaxed);
                warn!("{service} image stream error: {e}");
                Err(e)
            }
        }
    });

    let mut out = Response::new(Body::from_stream(stream));
    *out.status_mut() = status;
    let headers = out.headers_mut();
    if let Some(ct) = upstream_headers.get(header::CONTENT_TYPE) {
        headers.insert(header::CONTENT_TYPE, ct.clone());
    }
    match upstream_headers.get(header::CACHE_CONTROL) {
        Some(cc) => {
            headers.insert(header::CACHE_CONTROL, cc.clone());
        }
        None => {
            headers.insert(
                header::CACHE_CONTROL,
                HeaderValue::from_static(DEFAULT_IMAGE_CACHE_CONTROL),
            );
        }
    }
    for name in [header::CONTENT_LENGTH, header::ETAG, header::LAST_MODIFIED] {
        if let Some(v) = upstream_headers.get(&name) {
            headers.insert(name, v.clone());
        }
    }
    out
}

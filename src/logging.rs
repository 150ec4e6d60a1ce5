use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};
use std::time::{SystemTime, UNIX_EPOCH};

use axum::http::HeaderMap;
use base64::Engine;
use serde::Serialize;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::writer::MakeWriterExt;

use crate::config::home_dir;

fn env_bool(key: &str) -> bool {
    let Ok(v) = std::env::var(key) else {
        return false;
    };
    matches!(
        v.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "y" | "on"
    )
}

fn env_usize(key: &str) -> Option<usize> {
    std::env::var(key)
        .ok()
        .and_then(|s| s.trim().parse::<usize>().ok())
        .filter(|&n| n > 0)
}

fn logs_dir() -> PathBuf {
    home_dir().join("logs")
}

/// Install the global subscriber. `RUST_LOG` wins over the `info` default.
///
/// With `MEDIAHUB_LOG_FILE=1` output is mirrored into a daily-rolling file under `<home>/logs`;
/// the returned guard must live as long as the process for those writes to flush.
pub fn init_tracing() -> Option<WorkerGuard> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    if env_bool("MEDIAHUB_LOG_FILE") {
        let dir = logs_dir();
        if let Err(err) = fs::create_dir_all(&dir) {
            eprintln!("failed to create log dir {dir:?}: {err}; logging to stderr only");
        } else {
            let appender = tracing_appender::rolling::daily(&dir, "mediahub.log");
            let (file_writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_writer(std::io::stderr.and(file_writer))
                .init();
            return Some(guard);
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();
    None
}

#[derive(Debug, Clone, Copy)]
pub struct HttpWarnOptions {
    pub enabled: bool,
    pub max_body_bytes: usize,
}

/// `MEDIAHUB_HTTP_WARN=1` attaches redacted headers and a body preview to non-2xx warnings.
pub fn http_warn_options() -> HttpWarnOptions {
    static OPT: OnceLock<HttpWarnOptions> = OnceLock::new();
    *OPT.get_or_init(|| HttpWarnOptions {
        enabled: env_bool("MEDIAHUB_HTTP_WARN"),
        max_body_bytes: env_usize("MEDIAHUB_HTTP_WARN_BODY_MAX").unwrap_or(4 * 1024),
    })
}

#[derive(Debug, Serialize, Clone, PartialEq, Eq)]
pub struct HeaderEntry {
    pub name: String,
    pub value: String,
}

fn is_sensitive_header(name_lower: &str) -> bool {
    matches!(
        name_lower,
        "authorization"
            | "proxy-authorization"
            | "cookie"
            | "set-cookie"
            | "x-api-key"
            | "x-api-token"
            | "x-emby-token"
            | "x-emby-authorization"
    )
}

pub fn header_map_to_entries(headers: &HeaderMap) -> Vec<HeaderEntry> {
    headers
        .iter()
        .map(|(name, value)| {
            let name_lower = name.as_str().to_ascii_lowercase();
            let value = if is_sensitive_header(&name_lower) {
                "[REDACTED]".to_string()
            } else {
                String::from_utf8_lossy(value.as_bytes()).into_owned()
            };
            HeaderEntry {
                name: name.as_str().to_string(),
                value,
            }
        })
        .collect()
}

/// Blank out credential-bearing query parameters before a URL reaches a log line.
pub fn redact_url(url: &str) -> String {
    let Some((base, query)) = url.split_once('?') else {
        return url.to_string();
    };
    let redacted: Vec<String> = query
        .split('&')
        .map(|pair| match pair.split_once('=') {
            Some((k, _)) if matches!(k.to_ascii_lowercase().as_str(), "apikey" | "api_key" | "token") => {
                format!("{k}=[REDACTED]")
            }
            _ => pair.to_string(),
        })
        .collect();
    format!("{base}?{}", redacted.join("&"))
}

#[derive(Debug, Serialize, Clone)]
pub struct BodyPreview {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    pub encoding: String,
    pub data: String,
    pub truncated: bool,
    pub original_len: usize,
}

fn normalize_content_type(content_type: Option<&str>) -> Option<&str> {
    let ct = content_type?.trim();
    let (base, _) = ct.split_once(';').unwrap_or((ct, ""));
    let base = base.trim();
    if base.is_empty() { None } else { Some(base) }
}

fn is_textual_content_type(content_type: Option<&str>) -> bool {
    let Some(ct) = normalize_content_type(content_type) else {
        return false;
    };
    ct.starts_with("text/")
        || ct == "application/json"
        || ct.ends_with("+json")
        || ct == "application/xml"
        || ct.ends_with("+xml")
}

pub fn make_body_preview(bytes: &[u8], content_type: Option<&str>, max: usize) -> BodyPreview {
    let original_len = bytes.len();
    let take = original_len.min(max);
    let truncated = original_len > take;
    let slice = &bytes[..take];

    if is_textual_content_type(content_type) {
        return BodyPreview {
            content_type: normalize_content_type(content_type).map(|s| s.to_string()),
            encoding: "utf8".to_string(),
            data: String::from_utf8_lossy(slice).into_owned(),
            truncated,
            original_len,
        };
    }

    BodyPreview {
        content_type: normalize_content_type(content_type).map(|s| s.to_string()),
        encoding: "base64".to_string(),
        data: base64::engine::general_purpose::STANDARD.encode(slice),
        truncated,
        original_len,
    }
}

/// One line of `requests.jsonl`.
#[derive(Debug, Serialize)]
pub struct RequestLog<'a> {
    pub timestamp_ms: u64,
    pub request_id: &'a str,
    pub service: &'a str,
    pub method: &'a str,
    pub path: &'a str,
    pub status_code: u16,
    pub duration_ms: u64,
    pub target_url: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_type: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bytes_streamed: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<&'a str>,
}

#[derive(Debug, Clone, Copy)]
struct RequestLogOptions {
    enabled: bool,
    max_bytes: u64,
    max_files: usize,
    only_errors: bool,
}

fn request_log_options() -> RequestLogOptions {
    static OPT: OnceLock<RequestLogOptions> = OnceLock::new();
    *OPT.get_or_init(|| RequestLogOptions {
        enabled: std::env::var("MEDIAHUB_REQUEST_LOG")
            .map(|v| !matches!(v.trim(), "0" | "false" | "off" | "no"))
            .unwrap_or(true),
        max_bytes: env_usize("MEDIAHUB_REQUEST_LOG_MAX_BYTES")
            .map(|n| n as u64)
            .unwrap_or(20 * 1024 * 1024),
        max_files: env_usize("MEDIAHUB_REQUEST_LOG_MAX_FILES").unwrap_or(5),
        only_errors: env_bool("MEDIAHUB_REQUEST_LOG_ONLY_ERRORS"),
    })
}

fn log_lock() -> &'static Mutex<()> {
    static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    LOCK.get_or_init(|| Mutex::new(()))
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

fn rotate_and_prune_if_needed(path: &Path, max_bytes: u64, max_files: usize) {
    if max_bytes == 0 {
        return;
    }
    let Ok(meta) = fs::metadata(path) else {
        return;
    };
    if meta.len() < max_bytes {
        return;
    }

    let prefix = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("requests")
        .to_string();
    let rotated_path = path.with_file_name(format!("{prefix}.{}.jsonl", now_ms()));
    let _ = fs::rename(path, &rotated_path);

    let Some(dir) = path.parent() else {
        return;
    };
    let Ok(rd) = fs::read_dir(dir) else {
        return;
    };
    let mut rotated: Vec<PathBuf> = rd
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .map(|s| s.starts_with(&format!("{prefix}.")) && s.ends_with(".jsonl"))
                .unwrap_or(false)
        })
        .collect();
    if rotated.len() <= max_files {
        return;
    }
    rotated.sort();
    let remove_count = rotated.len() - max_files;
    for p in rotated.into_iter().take(remove_count) {
        let _ = fs::remove_file(p);
    }
}

fn append_request_log(path: &Path, entry: &RequestLog<'_>, max_bytes: u64, max_files: usize) {
    if let Some(parent) = path.parent() {
        let _ = fs::create_dir_all(parent);
    }
    let _guard = match log_lock().lock() {
        Ok(g) => g,
        Err(e) => e.into_inner(),
    };
    rotate_and_prune_if_needed(path, max_bytes, max_files);
    if let Ok(line) = serde_json::to_string(entry)
        && let Ok(mut file) = OpenOptions::new().create(true).append(true).open(path)
    {
        let _ = writeln!(file, "{}", line);
    }
}

/// Append one proxied request to `<home>/logs/requests.jsonl`.
pub fn log_request(entry: &RequestLog<'_>) {
    let opt = request_log_options();
    if !opt.enabled || cfg!(test) {
        return;
    }
    if opt.only_errors && (200..300).contains(&entry.status_code) {
        return;
    }
    append_request_log(
        &logs_dir().join("requests.jsonl"),
        entry,
        opt.max_bytes,
        opt.max_files,
    );
}

pub fn timestamp_ms() -> u64 {
    now_ms()
}

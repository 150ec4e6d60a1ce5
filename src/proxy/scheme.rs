use axum::http::{HeaderMap, HeaderName, HeaderValue};
use tracing::warn;

use crate::settings::{JELLYFIN, JELLYSTAT, SABNZBD, ServiceConfig, TDARR};

pub const CLIENT_NAME: &str = "mediahub";
const DEVICE_NAME: &str = "mediahub";
const DEVICE_ID: &str = "mediahub-server";

/// Jellyfin's client identification string, optionally carrying a session token.
pub fn media_browser_authorization(token: Option<&str>) -> String {
    let mut out = format!(
        r#"MediaBrowser Client="{CLIENT_NAME}", Device="{DEVICE_NAME}", DeviceId="{DEVICE_ID}", Version="{}""#,
        env!("CARGO_PKG_VERSION")
    );
    if let Some(token) = token {
        out.push_str(&format!(r#", Token="{token}""#));
    }
    out
}

/// How a service expects its credential to be presented.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthScheme {
    /// `X-Emby-Token` plus a `MediaBrowser` `Authorization` header with the same token.
    MediaBrowser,
    /// `x-api-token: <apiKey>`.
    ApiTokenHeader,
    /// The API key verbatim as the whole `Authorization` value.
    RawAuthorization,
    /// `apikey=<apiKey>` in the query string, no header.
    ApiKeyQuery,
    /// `X-Api-Key: <apiKey>`; the *arr default.
    ApiKeyHeader,
}

/// Services with a non-default scheme. Anything not listed gets [`AuthScheme::ApiKeyHeader`].
const SCHEMES: &[(&str, AuthScheme)] = &[
    (JELLYFIN, AuthScheme::MediaBrowser),
    (JELLYSTAT, AuthScheme::ApiTokenHeader),
    (TDARR, AuthScheme::RawAuthorization),
    (SABNZBD, AuthScheme::ApiKeyQuery),
];

/// Headers and query pairs to add to one outgoing request.
#[derive(Debug, Default)]
pub struct Injection {
    pub headers: HeaderMap,
    pub query: Vec<(String, String)>,
}

impl Injection {
    fn header(&mut self, name: &'static str, value: &str) {
        match HeaderValue::from_str(value) {
            Ok(mut v) => {
                v.set_sensitive(true);
                self.headers.insert(HeaderName::from_static(name), v);
            }
            Err(_) => warn!("credential for header {name} contains invalid characters; skipped"),
        }
    }
}

impl AuthScheme {
    pub fn for_service(service: &str) -> Self {
        SCHEMES
            .iter()
            .find(|(name, _)| *name == service)
            .map(|(_, scheme)| *scheme)
            .unwrap_or(AuthScheme::ApiKeyHeader)
    }

    /// Credential material for `cfg` under this scheme. Missing material injects nothing.
    pub fn inject(self, cfg: &ServiceConfig) -> Injection {
        let mut out = Injection::default();
        match self {
            AuthScheme::MediaBrowser => {
                if let Some(token) = cfg.token() {
                    out.header("x-emby-token", token);
                    out.header("authorization", &media_browser_authorization(Some(token)));
                }
            }
            AuthScheme::ApiTokenHeader => {
                if let Some(key) = cfg.api_key() {
                    out.header("x-api-token", key);
                }
            }
            AuthScheme::RawAuthorization => {
                if let Some(key) = cfg.api_key() {
                    out.header("authorization", key);
                }
            }
            AuthScheme::ApiKeyQuery => {
                if let Some(key) = cfg.api_key() {
                    out.query.push(("apikey".to_string(), key.to_string()));
                }
            }
            AuthScheme::ApiKeyHeader => {
                if let Some(key) = cfg.api_key() {
                    out.header("x-api-key", key);
                }
            }
        }
        out
    }
}

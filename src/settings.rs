use axum::Json;
use axum::body::Bytes;
use axum::extract::{Path, State};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value, json};
use tracing::{info, warn};

use crate::error::ApiError;
use crate::store::{Store, StoreError};

pub const RADARR: &str = "radarr";
pub const SONARR: &str = "sonarr";
pub const LIDARR: &str = "lidarr";
pub const SABNZBD: &str = "sabnzbd";
pub const PROWLARR: &str = "prowlarr";
pub const BAZARR: &str = "bazarr";
pub const JELLYSEERR: &str = "jellyseerr";
pub const JELLYFIN: &str = "jellyfin";
pub const TDARR: &str = "tdarr";
pub const JELLYSTAT: &str = "jellystat";

/// Logical service names the dashboard knows about, in navigation order.
pub const KNOWN_SERVICES: &[&str] = &[
    JELLYFIN, JELLYSEERR, RADARR, SONARR, LIDARR, PROWLARR, BAZARR, SABNZBD, TDARR, JELLYSTAT,
];

/// The media server doubles as the dashboard's login provider.
pub const MEDIA_SERVER: &str = JELLYFIN;

fn null_as_empty<'de, D: Deserializer<'de>>(d: D) -> Result<String, D::Error> {
    Ok(Option::<String>::deserialize(d)?.unwrap_or_default())
}

/// Stored connection record for one logical service.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceConfig {
    #[serde(default, deserialize_with = "null_as_empty")]
    pub url: String,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub api_key: String,
    // media server session
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_id: Option<String>,
}

fn non_blank(v: &Option<String>) -> Option<&str> {
    v.as_deref().map(str::trim).filter(|s| !s.is_empty())
}

impl ServiceConfig {
    /// A config with no URL is treated as absent.
    pub fn is_configured(&self) -> bool {
        !self.url.trim().is_empty()
    }

    pub fn base_url(&self) -> &str {
        self.url.trim().trim_end_matches('/')
    }

    pub fn api_key(&self) -> Option<&str> {
        Some(self.api_key.trim()).filter(|s| !s.is_empty())
    }

    pub fn token(&self) -> Option<&str> {
        non_blank(&self.token)
    }

    pub fn user_id(&self) -> Option<&str> {
        non_blank(&self.user_id)
    }

    /// Authenticated iff both token and user id are present and non-blank.
    pub fn has_session(&self) -> bool {
        self.token().is_some() && self.user_id().is_some()
    }
}

fn service_defaults(name: &str) -> Value {
    if name == MEDIA_SERVER {
        json!({
            "url": "",
            "apiKey": "",
            "token": "",
            "userId": "",
            "userName": "",
            "serverId": "",
        })
    } else {
        json!({ "url": "", "apiKey": "" })
    }
}

/// The shape the UI expects for every key, before anything has been saved.
pub fn default_settings() -> Map<String, Value> {
    let mut out = Map::new();
    for name in KNOWN_SERVICES {
        out.insert((*name).to_string(), service_defaults(name));
    }
    out.insert(
        "appearance".to_string(),
        json!({
            "theme": "dark",
            "accentColor": "#7c3aed",
            "compactMode": false,
            "showPosters": true,
        }),
    );
    out.insert(
        "navigation".to_string(),
        json!({
            "order": KNOWN_SERVICES,
            "hidden": [],
            "defaultPage": "dashboard",
        }),
    );
    out
}

/// Stored values replace the default for their key wholesale; no field-level merge.
pub fn merge_with_defaults(stored: Map<String, Value>) -> Map<String, Value> {
    let mut out = default_settings();
    for (key, value) in stored {
        out.insert(key, value);
    }
    out
}

/// Read-through lookup from service name to its stored [`ServiceConfig`].
///
/// Holds nothing but the store handle; a settings change is visible to the very next request.
#[derive(Clone)]
pub struct CredentialResolver {
    store: Store,
}

impl CredentialResolver {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    pub async fn resolve(&self, service: &str) -> Result<Option<ServiceConfig>, StoreError> {
        let Some(value) = self.store.get_setting(service).await? else {
            return Ok(None);
        };
        serde_json::from_value(value)
            .map(Some)
            .map_err(|source| StoreError::Decode {
                key: service.to_string(),
                source,
            })
    }
}

fn parse_json_body(body: &Bytes) -> Result<Value, ApiError> {
    serde_json::from_slice(body)
        .map_err(|e| ApiError::BadRequest(format!("request body must be valid JSON: {e}")))
}

pub async fn get_settings(State(store): State<Store>) -> Result<Json<Value>, ApiError> {
    let stored = store.get_all_settings().await?;
    Ok(Json(Value::Object(merge_with_defaults(stored))))
}

pub async fn put_setting(
    State(store): State<Store>,
    Path(key): Path<String>,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    let value = parse_json_body(&body)?;
    store.set_setting(&key, &value).await?;
    info!("setting '{key}' updated");
    Ok(Json(json!({ "success": true, "key": key, "value": value })))
}

/// Best-effort bulk upsert: a failing key is logged and skipped, nothing is rolled back.
pub async fn put_settings_bulk(
    State(store): State<Store>,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    let Value::Object(entries) = parse_json_body(&body)? else {
        return Err(ApiError::BadRequest(
            "bulk settings body must be a JSON object".to_string(),
        ));
    };

    let mut failed = Vec::new();
    for (key, value) in &entries {
        if let Err(err) = store.set_setting(key, value).await {
            warn!("failed to store setting '{key}': {err}");
            failed.push(key.clone());
        }
    }
    info!(
        "bulk settings update: {} stored, {} failed",
        entries.len() - failed.len(),
        failed.len()
    );

    if failed.is_empty() {
        Ok(Json(json!({ "success": true })))
    } else {
        Ok(Json(json!({ "success": false, "failed": failed })))
    }
}

pub async fn delete_setting(
    State(store): State<Store>,
    Path(key): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let removed = store.delete_setting(&key).await?;
    Ok(Json(json!({ "success": true, "key": key, "removed": removed })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn defaults_cover_every_service_and_preference_block() {
        let defaults = default_settings();
        for name in KNOWN_SERVICES {
            let entry = defaults.get(*name).expect("service default");
            assert_eq!(entry["url"], "");
            assert_eq!(entry["apiKey"], "");
        }
        assert_eq!(defaults[JELLYFIN]["token"], "");
        assert_eq!(defaults[JELLYFIN]["serverId"], "");
        assert!(defaults.contains_key("appearance"));
        assert!(defaults.contains_key("navigation"));
    }

    #[test]
    fn stored_values_replace_defaults_wholesale() {
        let mut stored = Map::new();
        stored.insert(RADARR.to_string(), json!({ "url": "http://x:7878" }));
        stored.insert("custom".to_string(), json!([1, 2]));
        let merged = merge_with_defaults(stored);
        assert_eq!(merged[RADARR], json!({ "url": "http://x:7878" }));
        assert_eq!(merged["custom"], json!([1, 2]));
        assert_eq!(merged[SONARR], json!({ "url": "", "apiKey": "" }));
    }

    #[test]
    fn service_config_accepts_nulls_and_extra_fields() {
        let cfg: ServiceConfig = serde_json::from_value(json!({
            "url": "http://sab:8080/",
            "apiKey": null,
            "enabled": true,
        }))
        .expect("decode");
        assert_eq!(cfg.base_url(), "http://sab:8080");
        assert_eq!(cfg.api_key(), None);
        assert!(cfg.is_configured());
    }

    #[test]
    fn blank_token_is_not_a_session() {
        let cfg = ServiceConfig {
            url: "http://jf".to_string(),
            token: Some("".to_string()),
            user_id: Some("u1".to_string()),
            ..Default::default()
        };
        assert!(!cfg.has_session());
        let cfg = ServiceConfig {
            token: Some("t".to_string()),
            user_id: Some("  ".to_string()),
            ..cfg
        };
        assert!(!cfg.has_session());
    }

    #[tokio::test]
    async fn resolver_reads_through_on_every_call() {
        let store = Store::open_in_memory().expect("open");
        let resolver = CredentialResolver::new(store.clone());
        assert_eq!(resolver.resolve(RADARR).await.expect("resolve"), None);

        store
            .set_setting(RADARR, &json!({ "url": "http://a", "apiKey": "k1" }))
            .await
            .expect("set");
        let first = resolver.resolve(RADARR).await.expect("resolve").expect("some");
        assert_eq!(first.api_key(), Some("k1"));

        store
            .set_setting(RADARR, &json!({ "url": "http://b", "apiKey": "k2" }))
            .await
            .expect("set");
        let second = resolver.resolve(RADARR).await.expect("resolve").expect("some");
        assert_eq!(second.base_url(), "http://b");
        assert_eq!(second.api_key(), Some("k2"));
    }

    #[tokio::test]
    async fn resolver_rejects_non_object_values() {
        let store = Store::open_in_memory().expect("open");
        store.set_setting(SONARR, &json!("oops")).await.expect("set");
        let err = CredentialResolver::new(store)
            .resolve(SONARR)
            .await
            .expect_err("should not decode");
        assert!(matches!(err, StoreError::Decode { .. }));
    }
}

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rusqlite::{Connection, OptionalExtension, params};
use serde_json::{Map, Value};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

pub const DB_FILE_NAME: &str = "mediahub.db";

/// TTL applied by callers that have no opinion about cache lifetime.
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(300);

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS settings (
  key TEXT PRIMARY KEY,
  value TEXT NOT NULL,
  updated_at INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS cache (
  key TEXT PRIMARY KEY,
  value TEXT NOT NULL,
  expires_at INTEGER NOT NULL,
  created_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_cache_expires_at ON cache(expires_at);
"#;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("failed to open store at {path:?}: {message}")]
    Open { path: PathBuf, message: String },
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("failed to decode stored value for '{key}': {source}")]
    Decode {
        key: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to encode value for '{key}': {source}")]
    Encode {
        key: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("store worker failed: {0}")]
    Worker(String),
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

fn decode(key: &str, raw: &str) -> Result<Value, StoreError> {
    serde_json::from_str(raw).map_err(|source| StoreError::Decode {
        key: key.to_string(),
        source,
    })
}

fn encode(key: &str, value: &Value) -> Result<String, StoreError> {
    serde_json::to_string(value).map_err(|source| StoreError::Encode {
        key: key.to_string(),
        source,
    })
}

/// Durable key-value store with two namespaces: `settings` and an expiring `cache`.
///
/// Backed by a single SQLite connection in WAL mode behind a mutex, so statements are serialized.
/// Every call runs on the blocking pool. Clones share the connection.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
    path: Option<PathBuf>,
}

impl Store {
    /// Open (or create) `<data_dir>/mediahub.db`.
    pub fn open(data_dir: &Path) -> Result<Self, StoreError> {
        let path = data_dir.join(DB_FILE_NAME);
        std::fs::create_dir_all(data_dir).map_err(|err| StoreError::Open {
            path: path.clone(),
            message: format!("failed to create data dir: {err}"),
        })?;
        let conn = Connection::open(&path).map_err(|err| StoreError::Open {
            path: path.clone(),
            message: err.to_string(),
        })?;
        let store = Self::init(conn, Some(path.clone())).map_err(|err| StoreError::Open {
            path,
            message: err.to_string(),
        })?;
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?, None)
    }

    fn init(conn: Connection, path: Option<PathBuf>) -> Result<Self, StoreError> {
        let mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch(SCHEMA)?;
        debug!("store opened (journal_mode={mode}, path={path:?})");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path,
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = match conn.lock() {
                Ok(g) => g,
                Err(e) => e.into_inner(),
            };
            f(&mut guard)
        })
        .await
        .map_err(|e| StoreError::Worker(e.to_string()))?
    }

    pub async fn get_setting(&self, key: &str) -> Result<Option<Value>, StoreError> {
        let key = key.to_string();
        self.with_conn(move |conn| {
            let raw: Option<String> = conn
                .query_row(
                    "SELECT value FROM settings WHERE key = ?1",
                    params![key],
                    |row| row.get(0),
                )
                .optional()?;
            raw.map(|raw| decode(&key, &raw)).transpose()
        })
        .await
    }

    /// Upsert in a single statement; concurrent writers to the same key resolve last-write-wins.
    pub async fn set_setting(&self, key: &str, value: &Value) -> Result<(), StoreError> {
        let key = key.to_string();
        let raw = encode(&key, value)?;
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO settings (key, value, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
                params![key, raw, now_ms()],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn get_all_settings(&self) -> Result<Map<String, Value>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT key, value FROM settings ORDER BY key")?;
            let rows = stmt.query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?;
            let mut out = Map::new();
            for row in rows {
                let (key, raw) = row?;
                let value = decode(&key, &raw)?;
                out.insert(key, value);
            }
            Ok(out)
        })
        .await
    }

    /// Returns whether a row was removed.
    pub async fn delete_setting(&self, key: &str) -> Result<bool, StoreError> {
        let key = key.to_string();
        self.with_conn(move |conn| {
            let n = conn.execute("DELETE FROM settings WHERE key = ?1", params![key])?;
            Ok(n > 0)
        })
        .await
    }

    /// Read a cache entry. An entry that has expired is deleted here and reported as a miss.
    pub async fn get_cache(&self, key: &str) -> Result<Option<Value>, StoreError> {
        let key = key.to_string();
        self.with_conn(move |conn| {
            let row: Option<(String, i64)> = conn
                .query_row(
                    "SELECT value, expires_at FROM cache WHERE key = ?1",
                    params![key],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;
            let Some((raw, expires_at)) = row else {
                return Ok(None);
            };
            if expires_at <= now_ms() {
                conn.execute(
                    "DELETE FROM cache WHERE key = ?1 AND expires_at = ?2",
                    params![key, expires_at],
                )?;
                return Ok(None);
            }
            decode(&key, &raw).map(Some)
        })
        .await
    }

    pub async fn set_cache(&self, key: &str, value: &Value, ttl: Duration) -> Result<(), StoreError> {
        let key = key.to_string();
        let raw = encode(&key, value)?;
        let ttl_ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
        self.with_conn(move |conn| {
            let now = now_ms();
            conn.execute(
                "INSERT INTO cache (key, value, expires_at, created_at) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value,
                   expires_at = excluded.expires_at, created_at = excluded.created_at",
                params![key, raw, now.saturating_add(ttl_ms), now],
            )?;
            Ok(())
        })
        .await
    }

    /// Drop every cache row; returns how many were removed.
    pub async fn clear_cache(&self) -> Result<usize, StoreError> {
        self.with_conn(|conn| Ok(conn.execute("DELETE FROM cache", [])?))
            .await
    }

    /// Bulk-delete rows that are already past their expiry.
    pub async fn cleanup_expired_cache(&self) -> Result<usize, StoreError> {
        self.with_conn(|conn| {
            Ok(conn.execute("DELETE FROM cache WHERE expires_at < ?1", params![now_ms()])?)
        })
        .await
    }

    /// Keys physically present in the cache table, expired or not.
    pub async fn cache_keys(&self) -> Result<Vec<String>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT key FROM cache ORDER BY key")?;
            let keys = stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(keys)
        })
        .await
    }
}

/// Periodic housekeeping pass over the cache table.
///
/// Lazy eviction in [`Store::get_cache`] already hides expired rows; this only reclaims space.
pub fn spawn_cache_sweeper(store: Store, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // the first tick completes immediately
        ticker.tick().await;
        info!("cache sweeper running every {}s", every.as_secs());
        loop {
            ticker.tick().await;
            match store.cleanup_expired_cache().await {
                Ok(0) => {}
                Ok(n) => debug!("cache sweeper removed {n} expired entries"),
                Err(err) => warn!("cache sweep failed: {err}"),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn temp_data_dir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("mediahub-store-test-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).expect("create temp dir");
        dir
    }

    #[tokio::test]
    async fn setting_round_trips_nested_and_empty_values() {
        let store = Store::open_in_memory().expect("open");
        let cases = vec![
            ("radarr", json!({ "url": "http://x:7878", "apiKey": "" })),
            ("appearance", json!({ "theme": "dark", "nested": { "list": [1, "two", null] } })),
            ("empty", json!("")),
            ("flag", json!(false)),
        ];
        for (key, value) in &cases {
            store.set_setting(key, value).await.expect("set");
        }
        for (key, value) in &cases {
            assert_eq!(store.get_setting(key).await.expect("get").as_ref(), Some(value));
        }
        assert_eq!(store.get_setting("missing").await.expect("get"), None);
    }

    #[tokio::test]
    async fn set_setting_twice_is_idempotent() {
        let store = Store::open_in_memory().expect("open");
        let value = json!({ "url": "http://sonarr:8989", "apiKey": "abc" });
        store.set_setting("sonarr", &value).await.expect("set");
        let once = store.get_all_settings().await.expect("all");
        store.set_setting("sonarr", &value).await.expect("set again");
        let twice = store.get_all_settings().await.expect("all");
        assert_eq!(once, twice);
        assert_eq!(twice.len(), 1);
    }

    #[tokio::test]
    async fn set_setting_overwrites_wholesale() {
        let store = Store::open_in_memory().expect("open");
        store
            .set_setting("radarr", &json!({ "url": "http://a", "apiKey": "k" }))
            .await
            .expect("set");
        store
            .set_setting("radarr", &json!({ "url": "http://b" }))
            .await
            .expect("set");
        assert_eq!(
            store.get_setting("radarr").await.expect("get"),
            Some(json!({ "url": "http://b" }))
        );
    }

    #[tokio::test]
    async fn delete_setting_reports_removal() {
        let store = Store::open_in_memory().expect("open");
        store.set_setting("bazarr", &json!({})).await.expect("set");
        assert!(store.delete_setting("bazarr").await.expect("delete"));
        assert!(!store.delete_setting("bazarr").await.expect("delete again"));
        assert_eq!(store.get_setting("bazarr").await.expect("get"), None);
    }

    #[tokio::test]
    async fn malformed_setting_surfaces_decode_error() {
        let store = Store::open_in_memory().expect("open");
        {
            let conn = store.conn.lock().expect("lock");
            conn.execute(
                "INSERT INTO settings (key, value, updated_at) VALUES ('broken', '{not json', 0)",
                [],
            )
            .expect("raw insert");
        }
        let err = store.get_setting("broken").await.expect_err("should fail");
        assert!(matches!(err, StoreError::Decode { ref key, .. } if key == "broken"));
    }

    #[tokio::test]
    async fn expired_cache_entry_is_deleted_on_read() {
        let store = Store::open_in_memory().expect("open");
        store
            .set_cache("posters", &json!({ "n": 1 }), Duration::from_secs(1))
            .await
            .expect("set");
        assert_eq!(
            store.get_cache("posters").await.expect("get"),
            Some(json!({ "n": 1 }))
        );

        tokio::time::sleep(Duration::from_millis(1100)).await;

        assert_eq!(store.get_cache("posters").await.expect("get"), None);
        assert!(store.cache_keys().await.expect("keys").is_empty());
    }

    #[tokio::test]
    async fn cleanup_removes_only_expired_rows() {
        let store = Store::open_in_memory().expect("open");
        store
            .set_cache("stale", &json!(1), Duration::ZERO)
            .await
            .expect("set");
        store
            .set_cache("fresh", &json!(2), DEFAULT_CACHE_TTL)
            .await
            .expect("set");
        tokio::time::sleep(Duration::from_millis(5)).await;

        assert_eq!(store.cleanup_expired_cache().await.expect("cleanup"), 1);
        assert_eq!(store.cache_keys().await.expect("keys"), vec!["fresh".to_string()]);
        assert_eq!(store.get_cache("fresh").await.expect("get"), Some(json!(2)));
    }

    #[tokio::test]
    async fn clear_cache_leaves_settings_alone() {
        let store = Store::open_in_memory().expect("open");
        store.set_setting("jellyfin", &json!({ "url": "http://jf" })).await.expect("set");
        store.set_cache("a", &json!(1), DEFAULT_CACHE_TTL).await.expect("set");
        store.set_cache("b", &json!(2), DEFAULT_CACHE_TTL).await.expect("set");

        assert_eq!(store.clear_cache().await.expect("clear"), 2);
        assert!(store.cache_keys().await.expect("keys").is_empty());
        assert!(store.get_setting("jellyfin").await.expect("get").is_some());
    }

    #[tokio::test]
    async fn file_backed_store_survives_reopen() {
        let dir = temp_data_dir();
        {
            let store = Store::open(&dir).expect("open");
            store
                .set_setting("prowlarr", &json!({ "url": "http://p:9696", "apiKey": "z" }))
                .await
                .expect("set");
        }
        let reopened = Store::open(&dir).expect("reopen");
        assert_eq!(
            reopened.get_setting("prowlarr").await.expect("get"),
            Some(json!({ "url": "http://p:9696", "apiKey": "z" }))
        );
        assert_eq!(reopened.path(), Some(dir.join(DB_FILE_NAME).as_path()));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn open_fails_when_data_dir_is_a_file() {
        let dir = temp_data_dir();
        let blocker = dir.join("not-a-dir");
        std::fs::write(&blocker, b"x").expect("write file");
        let err = Store::open(&blocker).err().expect("open should fail");
        assert!(matches!(err, StoreError::Open { .. }));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn sweeper_reclaims_expired_rows() {
        let store = Store::open_in_memory().expect("open");
        store.set_cache("gone", &json!(1), Duration::ZERO).await.expect("set");
        let handle = spawn_cache_sweeper(store.clone(), Duration::from_millis(20));
        tokio::time::sleep(Duration::from_millis(150)).await;
        handle.abort();
        assert!(store.cache_keys().await.expect("keys").is_empty());
    }
}

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::warn;

/// Runtime settings for the server process itself.
///
/// Upstream service settings do not live here; those are stored in the key-value store and
/// edited through the settings API.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Address the HTTP server binds to.
    pub listen: SocketAddr,
    /// Directory holding `mediahub.db`. Defaults to `<home>/data`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<PathBuf>,
    /// Hard cap on every upstream forward, headers and body included.
    pub upstream_timeout_secs: u64,
    /// Interval of the expired-cache sweep; 0 disables the sweeper.
    pub cache_sweep_secs: u64,
    /// Login attempts allowed per client within `login_window_secs`.
    pub login_attempts: u32,
    pub login_window_secs: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([127, 0, 0, 1], 3001)),
            data_dir: None,
            upstream_timeout_secs: 30,
            cache_sweep_secs: 300,
            login_attempts: 5,
            login_window_secs: 15 * 60,
        }
    }
}

impl AppConfig {
    pub fn data_dir(&self) -> PathBuf {
        self.data_dir
            .clone()
            .unwrap_or_else(|| home_dir().join("data"))
    }

    pub fn upstream_timeout(&self) -> Duration {
        Duration::from_secs(self.upstream_timeout_secs.max(1))
    }

    pub fn cache_sweep_interval(&self) -> Option<Duration> {
        (self.cache_sweep_secs > 0).then(|| Duration::from_secs(self.cache_sweep_secs))
    }

    pub fn login_window(&self) -> Duration {
        Duration::from_secs(self.login_window_secs)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("MEDIAHUB_LISTEN")
            && !v.trim().is_empty()
        {
            match v.trim().parse::<SocketAddr>() {
                Ok(addr) => self.listen = addr,
                Err(err) => warn!("ignoring MEDIAHUB_LISTEN={v:?}: {err}"),
            }
        }
        if let Ok(v) = std::env::var("MEDIAHUB_DATA_DIR")
            && !v.trim().is_empty()
        {
            self.data_dir = Some(PathBuf::from(v.trim()));
        }
    }
}

/// Home directory for config, logs and (by default) data: `$MEDIAHUB_HOME` or `~/.mediahub`.
pub fn home_dir() -> PathBuf {
    if let Ok(v) = std::env::var("MEDIAHUB_HOME")
        && !v.trim().is_empty()
    {
        return PathBuf::from(v.trim());
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".mediahub")
}

pub fn config_file_path() -> PathBuf {
    home_dir().join("config.toml")
}

fn parse_config(text: &str) -> Result<AppConfig> {
    Ok(toml::from_str::<AppConfig>(text)?)
}

/// Load `config.toml` from `path`, falling back to defaults when the file does not exist.
/// Environment overrides are applied last.
pub async fn load_config_from(path: &Path) -> Result<AppConfig> {
    let mut cfg = if fs::try_exists(path).await.unwrap_or(false) {
        let text = fs::read_to_string(path)
            .await
            .with_context(|| format!("failed to read {path:?}"))?;
        parse_config(&text).with_context(|| format!("invalid config at {path:?}"))?
    } else {
        AppConfig::default()
    };
    cfg.apply_env_overrides();
    Ok(cfg)
}

pub async fn load_config() -> Result<AppConfig> {
    load_config_from(&config_file_path()).await
}

const CONFIG_TOML_TEMPLATE: &str = r#"# mediahub config.toml
#
# Process-level settings only. Service URLs and API keys are managed from the dashboard
# (or `mediahub settings set <service> '<json>'`) and stored in the data directory.
#
# Environment overrides: MEDIAHUB_LISTEN, MEDIAHUB_DATA_DIR, MEDIAHUB_HOME.

# Address the HTTP server binds to.
listen = "127.0.0.1:3001"

# Where mediahub.db lives. Defaults to <home>/data.
# data_dir = "/var/lib/mediahub"

# Every proxied upstream call fails after this many seconds.
upstream_timeout_secs = 30

# How often expired cache rows are purged (seconds). 0 disables the sweep;
# expired entries are still never returned.
cache_sweep_secs = 300

# Login attempts allowed per client address within the window.
login_attempts = 5
login_window_secs = 900
"#;

/// Write a commented template to `path` (tmp file + rename). Refuses to clobber unless `force`.
pub async fn init_config_toml_at(path: &Path, force: bool) -> Result<PathBuf> {
    let dir = path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    fs::create_dir_all(&dir).await?;

    if path.exists() && !force {
        anyhow::bail!("config.toml already exists at {path:?}; use --force to overwrite");
    }

    if path.exists() {
        let backup = path.with_extension("toml.bak");
        if let Err(err) = fs::copy(path, &backup).await {
            warn!("failed to backup {:?} to {:?}: {}", path, backup, err);
        }
    }

    let tmp_path = dir.join("config.toml.tmp");
    fs::write(&tmp_path, CONFIG_TOML_TEMPLATE.as_bytes()).await?;
    fs::rename(&tmp_path, path).await?;
    Ok(path.to_path_buf())
}

pub async fn init_config_toml(force: bool) -> Result<PathBuf> {
    init_config_toml_at(&config_file_path(), force).await
}

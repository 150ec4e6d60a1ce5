mod auth;
mod commands;
mod config;
mod error;
mod logging;
mod proxy;
mod server;
mod settings;
mod store;
#[cfg(test)]
mod test_support;

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use thiserror::Error;

use crate::config::load_config;

#[derive(Parser, Debug)]
#[command(name = "mediahub")]
#[command(version, about = "Media dashboard backend: settings store, Jellyfin login and service proxy", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the HTTP server (default)
    Serve {
        /// Listen address, e.g. 0.0.0.0:3001; overrides config.toml
        #[arg(long)]
        listen: Option<SocketAddr>,
        /// Directory holding mediahub.db; overrides config.toml
        #[arg(long)]
        data_dir: Option<PathBuf>,
    },
    /// Inspect or edit stored service settings
    Settings {
        #[command(subcommand)]
        cmd: SettingsCommand,
    },
    /// Inspect or purge the response cache
    Cache {
        #[command(subcommand)]
        cmd: CacheCommand,
    },
    /// Manage ~/.mediahub/config.toml
    Config {
        #[command(subcommand)]
        cmd: ConfigCommand,
    },
}

#[derive(Subcommand, Debug)]
pub enum SettingsCommand {
    /// Show every known service and whether it is configured
    List {
        /// Print the merged settings object as JSON instead
        #[arg(long)]
        json: bool,
    },
    /// Print one stored value
    Get { key: String },
    /// Store a JSON value under a key, replacing what was there
    Set { key: String, value: String },
    /// Remove a stored key
    Delete { key: String },
}

#[derive(Subcommand, Debug)]
pub enum CacheCommand {
    /// List live cache keys
    List,
    /// Drop every cache entry
    Clear,
    /// Purge expired entries now
    Sweep,
}

#[derive(Subcommand, Debug)]
pub enum ConfigCommand {
    /// Write a commented config.toml template
    Init {
        /// Overwrite an existing file (a .bak copy is kept)
        #[arg(long)]
        force: bool,
    },
    /// Print the effective configuration
    Show,
}

#[derive(Debug, Error)]
pub enum CliError {
    #[error("config error: {0}")]
    Config(String),
    #[error("store error: {0}")]
    Store(#[from] store::StoreError),
    #[error("{0}")]
    Usage(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type CliResult<T> = Result<T, CliError>;

#[tokio::main]
async fn main() {
    let _log_guard = logging::init_tracing();

    if let Err(err) = run(Cli::parse()).await {
        tracing::error!("{err}");
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> CliResult<()> {
    match cli.command.unwrap_or(Command::Serve {
        listen: None,
        data_dir: None,
    }) {
        Command::Serve { listen, data_dir } => {
            let mut cfg = load_config()
                .await
                .map_err(|e| CliError::Config(e.to_string()))?;
            if let Some(addr) = listen {
                cfg.listen = addr;
            }
            if data_dir.is_some() {
                cfg.data_dir = data_dir;
            }
            server::serve(cfg).await?;
        }
        Command::Settings { cmd } => commands::settings::handle_settings_cmd(cmd).await?,
        Command::Cache { cmd } => commands::cache::handle_cache_cmd(cmd).await?,
        Command::Config { cmd } => commands::config::handle_config_cmd(cmd).await?,
    }
    Ok(())
}

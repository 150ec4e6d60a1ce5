pub mod cache;
pub mod config;
pub mod settings;

use crate::config::load_config;
use crate::store::Store;
use crate::{CliError, CliResult};

/// Open the store the server would use, honouring config.toml and env overrides.
async fn open_store() -> CliResult<Store> {
    let cfg = load_config()
        .await
        .map_err(|e| CliError::Config(e.to_string()))?;
    Ok(Store::open(&cfg.data_dir())?)
}

use super::open_store;
use crate::{CacheCommand, CliResult};

pub async fn handle_cache_cmd(cmd: CacheCommand) -> CliResult<()> {
    let store = open_store().await?;
    match cmd {
        CacheCommand::List => {
            let keys = store.cache_keys().await?;
            if keys.is_empty() {
                println!("Cache is empty");
            } else {
                for key in keys {
                    println!("{key}");
                }
            }
        }
        CacheCommand::Clear => {
            let removed = store.clear_cache().await?;
            println!("Removed {removed} cache entries");
        }
        CacheCommand::Sweep => {
            let removed = store.cleanup_expired_cache().await?;
            println!("Purged {removed} expired cache entries");
        }
    }
    Ok(())
}

use owo_colors::OwoColorize;
use serde_json::Value;

use super::open_store;
use crate::settings::{KNOWN_SERVICES, MEDIA_SERVER, ServiceConfig, merge_with_defaults};
use crate::{CliError, CliResult, SettingsCommand};

fn describe(service: &str, value: Option<&Value>) -> String {
    let cfg = value
        .cloned()
        .and_then(|v| serde_json::from_value::<ServiceConfig>(v).ok())
        .unwrap_or_default();
    if !cfg.is_configured() {
        return format!("  {:<12} {}", service, "not configured".dimmed());
    }
    let mut line = format!("  {:<12} {}", service.green(), cfg.base_url());
    if cfg.api_key().is_none() && service != MEDIA_SERVER {
        line.push_str(&format!(" {}", "(no api key)".yellow()));
    }
    if service == MEDIA_SERVER {
        if cfg.has_session() {
            let user = cfg.user_name.as_deref().unwrap_or("?");
            line.push_str(&format!(" {}", format!("(logged in as {user})").cyan()));
        } else {
            line.push_str(&format!(" {}", "(no session)".yellow()));
        }
    }
    line
}

pub async fn handle_settings_cmd(cmd: SettingsCommand) -> CliResult<()> {
    let store = open_store().await?;
    match cmd {
        SettingsCommand::List { json } => {
            let stored = store.get_all_settings().await?;
            if json {
                let merged = Value::Object(merge_with_defaults(stored));
                let text =
                    serde_json::to_string_pretty(&merged).unwrap_or_else(|_| "{}".to_string());
                println!("{text}");
                return Ok(());
            }
            println!("{}", "Services".bold());
            for service in KNOWN_SERVICES {
                println!("{}", describe(service, stored.get(*service)));
            }
            let extra: Vec<&String> = stored
                .keys()
                .filter(|k| !KNOWN_SERVICES.contains(&k.as_str()))
                .collect();
            if !extra.is_empty() {
                println!("{}", "Other keys".bold());
                for key in extra {
                    println!("  {key}");
                }
            }
        }
        SettingsCommand::Get { key } => match store.get_setting(&key).await? {
            Some(value) => {
                let text =
                    serde_json::to_string_pretty(&value).unwrap_or_else(|_| value.to_string());
                println!("{text}");
            }
            None => return Err(CliError::Usage(format!("no setting stored under '{key}'"))),
        },
        SettingsCommand::Set { key, value } => {
            let parsed: Value = serde_json::from_str(&value)
                .map_err(|e| CliError::Usage(format!("value must be JSON: {e}")))?;
            store.set_setting(&key, &parsed).await?;
            println!("Stored '{key}'");
        }
        SettingsCommand::Delete { key } => {
            if store.delete_setting(&key).await? {
                println!("Deleted '{key}'");
            } else {
                println!("No setting stored under '{key}'");
            }
        }
    }
    Ok(())
}

use crate::config::{config_file_path, init_config_toml, load_config};
use crate::{CliError, CliResult, ConfigCommand};

pub async fn handle_config_cmd(cmd: ConfigCommand) -> CliResult<()> {
    match cmd {
        ConfigCommand::Init { force } => {
            let path = init_config_toml(force)
                .await
                .map_err(|e| CliError::Config(e.to_string()))?;
            println!("Wrote TOML config template to {path:?}");
        }
        ConfigCommand::Show => {
            let cfg = load_config()
                .await
                .map_err(|e| CliError::Config(e.to_string()))?;
            let text = toml::to_string_pretty(&cfg).map_err(|e| CliError::Config(e.to_string()))?;
            println!("# effective config (file: {:?})", config_file_path());
            println!("# data_dir resolves to {:?}", cfg.data_dir());
            print!("{text}");
        }
    }
    Ok(())
}

//! `guidelight config` handlers.

use crate::cli::{ConfigArgs, ConfigCommand, GlobalOpts};
use crate::error::CliError;

pub fn handle(args: &ConfigArgs, global: &GlobalOpts) -> Result<(), CliError> {
    match args.command {
        ConfigCommand::Path => {
            let path = global
                .config
                .clone()
                .unwrap_or_else(guidelight_config::config_path);
            println!("{}", path.display());
        }
        ConfigCommand::Show => {
            let config = crate::load_config(global)?;
            print!("{}", config.to_toml()?);
        }
    }
    Ok(())
}

//! Subcommand handlers for config actions.

use std::path::{Path, PathBuf};

use super::args::ConfigAction;
use crate::config::{default_path, ConfigError, ServerConfig};

/// Handle config subcommand actions.
///
/// # Arguments
/// * `action` - The requested action
/// * `config_path` - Explicit `--config` path, if any
/// * `effective` - Configuration after file and CLI overrides were merged
pub fn handle_config_action(
    action: ConfigAction,
    config_path: Option<&Path>,
    effective: &ServerConfig,
) -> Result<(), ConfigError> {
    let path: Option<PathBuf> = config_path.map(Path::to_path_buf).or_else(default_path);

    match action {
        ConfigAction::Show => {
            match &path {
                Some(p) if p.exists() => println!("# Config file: {} (exists)", p.display()),
                Some(p) => println!("# Config file: {} (not found)", p.display()),
                None => println!("# Config file: none"),
            }
            println!();
            print!("{}", effective.to_toml()?);
        }
        ConfigAction::Init => {
            let path = path.ok_or(ConfigError::NoConfigDir)?;
            ServerConfig::default().save_new(&path)?;
            println!("Created config file: {}", path.display());
        }
    }
    Ok(())
}

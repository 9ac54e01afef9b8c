//! Project setup command: `uplift init`.

use std::path::Path;

use anyhow::{Context, Result};

use uplift::config::{DEFAULT_CONFIG_PATH, UpliftConfig};
use uplift::update::db::StatusDb;

pub fn cmd_init(config: &UpliftConfig, db_path: &Path) -> Result<()> {
    let config_path = Path::new(DEFAULT_CONFIG_PATH);
    if config_path.exists() {
        println!("Config already exists at {}", config_path.display());
    } else {
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create config directory")?;
        }
        let body = toml::to_string_pretty(config).context("Failed to serialize config")?;
        std::fs::write(config_path, body)
            .with_context(|| format!("Failed to write {}", config_path.display()))?;
        println!("Wrote default config to {}", config_path.display());
    }

    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent).context("Failed to create database directory")?;
    }
    StatusDb::new(db_path)?;
    println!("Status database initialized at {}", db_path.display());
    Ok(())
}

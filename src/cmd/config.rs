//! Configuration view command: `uplift config`.

use std::path::Path;

use anyhow::{Context, Result};
use console::style;

use uplift::config::{DEFAULT_CONFIG_PATH, UpliftConfig};

fn secret_state(value: &Option<String>) -> &'static str {
    if value.as_deref().is_some_and(|v| !v.is_empty()) {
        "<redacted>"
    } else {
        "<unset>"
    }
}

pub fn cmd_config(config: &UpliftConfig, explicit_path: Option<&Path>) -> Result<()> {
    let path = explicit_path.unwrap_or(Path::new(DEFAULT_CONFIG_PATH));
    if path.exists() {
        println!("{} {}", style("Config file:").bold(), path.display());
    } else {
        println!("{} none (using defaults)", style("Config file:").bold());
    }
    println!();

    // Secrets are skipped by serialization; report only whether they are set.
    let body = toml::to_string_pretty(config).context("Failed to serialize config")?;
    println!("{}", body.trim_end());
    println!();
    println!("{}", style("Secrets").bold());
    println!("  rewrite.api_key = {}", secret_state(&config.rewrite.api_key));
    println!("  github.token    = {}", secret_state(&config.github.token));
    Ok(())
}

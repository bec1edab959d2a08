//! Initialize the configuration directory: create ~/.parley, a default config and the store directory.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

use crate::config::{self, Config};

/// Ensure the configuration directory has been initialized (config file exists).
pub fn require_initialized(config_path: &Path) -> Result<()> {
    if !config_path.exists() {
        anyhow::bail!(
            "configuration not initialized; run `parley init` first (config file not found: {})",
            config_path.display()
        );
    }
    Ok(())
}

/// Create the config directory and default files if they do not exist.
/// - Creates the config directory (parent of config file path).
/// - Writes `config.json` with every default spelled out if missing.
/// - Creates the directory that will hold the SQLite store.
pub fn init_config_dir(config_path: &Path) -> Result<PathBuf> {
    let config_dir = config_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(config_dir)
        .with_context(|| format!("creating config directory {}", config_dir.display()))?;

    let config = if !config_path.exists() {
        let config = Config::default();
        let json = serde_json::to_string_pretty(&config).context("serializing default config")?;
        std::fs::write(config_path, json)
            .with_context(|| format!("writing default config to {}", config_path.display()))?;
        log::info!("created default config at {}", config_path.display());
        config
    } else {
        log::debug!("config already exists at {}, leaving it", config_path.display());
        let (config, _) = config::load_config(Some(config_path.to_path_buf()))?;
        config
    };

    let store_path = config::resolve_store_path(&config, config_path);
    if let Some(store_dir) = store_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        if !store_dir.exists() {
            std::fs::create_dir_all(store_dir)
                .with_context(|| format!("creating store directory {}", store_dir.display()))?;
            log::info!("created store directory at {}", store_dir.display());
        }
    }

    Ok(config_dir.to_path_buf())
}

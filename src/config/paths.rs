use std::path::PathBuf;

use anyhow::{Context, Result};

/// Returns the base termhub directory: ~/.termhub
pub fn termhub_dir() -> Result<PathBuf> {
    let home = dirs::home_dir().context("Could not determine home directory")?;
    Ok(home.join(".termhub"))
}

/// Returns the per-user tab topology directory: ~/.termhub/tabs
pub fn tabs_dir() -> Result<PathBuf> {
    Ok(termhub_dir()?.join("tabs"))
}

/// Returns the default config path: ~/.config/termhub/termhub.toml
pub fn default_config_path() -> Result<PathBuf> {
    let config = dirs::config_dir().context("Could not determine config directory")?;
    Ok(config.join("termhub").join("termhub.toml"))
}

/// Ensures the data directory exists
pub fn ensure_dirs(data_dir: &std::path::Path) -> Result<()> {
    std::fs::create_dir_all(data_dir)
        .with_context(|| format!("Failed to create directory: {}", data_dir.display()))?;
    Ok(())
}

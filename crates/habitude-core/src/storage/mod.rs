mod config;
pub mod database;
pub mod migrations;

pub use config::{Config, RemoteSettings, SyncSettings};
pub use database::Database;

use std::path::PathBuf;

use crate::error::{ConfigError, Result};

/// Returns the Habitude data directory, creating it if needed.
///
/// `HABITUDE_DATA_DIR` overrides the location outright. Otherwise the
/// directory is `~/.config/habitude[-dev]/`, with `HABITUDE_ENV=dev`
/// selecting the development directory.
///
/// # Errors
/// Returns an error if no home directory can be determined or if creating
/// the directory fails.
pub fn data_dir() -> Result<PathBuf> {
    if let Ok(dir) = std::env::var("HABITUDE_DATA_DIR") {
        let dir = PathBuf::from(dir);
        std::fs::create_dir_all(&dir)?;
        return Ok(dir);
    }

    let base_dir = dirs::home_dir()
        .ok_or(ConfigError::NoDataDir)?
        .join(".config");

    let env = std::env::var("HABITUDE_ENV").unwrap_or_else(|_| "production".to_string());

    let dir = if env == "dev" {
        base_dir.join("habitude-dev")
    } else {
        base_dir.join("habitude")
    };

    std::fs::create_dir_all(&dir)?;
    Ok(dir)
}

//! Configuration loading from a TOML file, with defaults.
//!
//! A missing or malformed file never fails the caller; it is logged and the
//! defaults are used instead.

use skybus_types::config::Config;
use std::path::Path;
use tracing::{info, warn};

/// Load configuration from a TOML file, falling back to defaults.
pub fn load_config(path: &Path) -> Config {
    if !path.exists() {
        info!(path = %path.display(), "Config file not found, using defaults");
        return Config::default();
    }
    match std::fs::read_to_string(path) {
        Ok(contents) => match toml::from_str::<Config>(&contents) {
            Ok(config) => {
                info!(path = %path.display(), "Loaded configuration");
                config
            }
            Err(e) => {
                warn!(
                    error = %e,
                    path = %path.display(),
                    "Failed to parse config, using defaults"
                );
                Config::default()
            }
        },
        Err(e) => {
            warn!(
                error = %e,
                path = %path.display(),
                "Failed to read config file, using defaults"
            );
            Config::default()
        }
    }
}

//! Configuration for the connection coordinator

mod coordinator;
mod serde_utils;

pub use coordinator::{CoordinatorConfig, HeartbeatConfig, RetryConfig, ShutdownTimeouts};
pub use serde_utils::duration_secs;

use crate::error::ConfigError;
use std::path::{Path, PathBuf};

/// Default configuration directory, honoring `XDG_CONFIG_HOME` and falling
/// back to `$HOME/.config`, then to the current directory.
pub fn default_config_dir() -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        return PathBuf::from(xdg).join("fleetline");
    }
    if let Ok(home) = std::env::var("HOME") {
        return PathBuf::from(home).join(".config").join("fleetline");
    }
    PathBuf::from(".").join("fleetline")
}

/// Default configuration file path.
pub fn default_config_path() -> PathBuf {
    default_config_dir().join("config.toml")
}

/// Load configuration from a TOML file.
pub fn load_config<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    if !path.exists() {
        return Err(ConfigError::NotFound(path.to_path_buf()));
    }

    let content = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Invalid(format!("failed to read config: {e}")))?;

    let config: T = toml::from_str(&content)?;
    Ok(config)
}

/// Save configuration to a TOML file, creating parent directories as needed.
pub fn save_config<T: serde::Serialize>(path: &Path, config: &T) -> Result<(), ConfigError> {
    let content = toml::to_string_pretty(config)?;

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| ConfigError::Invalid(format!("failed to create config dir: {e}")))?;
    }

    std::fs::write(path, content)
        .map_err(|e| ConfigError::Invalid(format!("failed to write config: {e}")))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_config_missing_file_errors() {
        let result: Result<CoordinatorConfig, _> = load_config(Path::new("/nonexistent/config.toml"));
        assert!(matches!(result, Err(ConfigError::NotFound(_))));
    }

    #[test]
    fn test_save_then_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");

        let config = CoordinatorConfig::default();
        save_config(&path, &config).unwrap();

        let loaded: CoordinatorConfig = load_config(&path).unwrap();
        assert_eq!(loaded.command_timeout, config.command_timeout);
        assert_eq!(loaded.retry.max_attempts, config.retry.max_attempts);
    }
}

pub mod config;
pub mod manager;

pub use config::{
    BrokerConfig, ClientConfig, Config, ConfigError, ConfigResult, GatewayConfig, LogLevel,
    LoggingConfig, ThrottleConfig, WorkerConfig,
};
pub use manager::ConfigManager;

use std::path::PathBuf;

/// Microman configuration directory (`~/.microman`)
pub fn microman_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".microman"))
}

/// Default configuration file path
pub fn default_config_path() -> Option<PathBuf> {
    microman_dir().map(|dir| dir.join("config.json"))
}

/// Expand a leading `~/` to the home directory
pub fn expand_tilde(path: &str) -> Option<PathBuf> {
    match path.strip_prefix("~/") {
        Some(rest) => dirs::home_dir().map(|home| home.join(rest)),
        None => Some(PathBuf::from(path)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_path() {
        if let Some(path) = default_config_path() {
            assert!(path.to_string_lossy().contains(".microman"));
            assert!(path.ends_with("config.json"));
        }
    }

    #[test]
    fn test_expand_tilde() {
        assert_eq!(
            expand_tilde("/etc/microman.json"),
            Some(PathBuf::from("/etc/microman.json"))
        );
        if let Some(expanded) = expand_tilde("~/.microman/config.json") {
            assert!(!expanded.to_string_lossy().starts_with('~'));
        }
    }
}

//! Configuration loader with file and environment variable support

use crate::{AppConfig, ConfigError};
use std::env;
use std::path::PathBuf;
use tracing::info;

/// Standard config file search paths
const CONFIG_PATHS: &[&str] = &[
    "config.toml",
    "wd-cron.toml",
    "./config/config.toml",
    "/etc/wd-cron/config.toml",
];

/// Configuration loader
pub struct ConfigLoader {
    config_path: Option<PathBuf>,
}

impl ConfigLoader {
    /// Create a new configuration loader
    pub fn new() -> Self {
        Self { config_path: None }
    }

    /// Create a loader with a specific config file path
    pub fn with_path<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            config_path: Some(path.into()),
        }
    }

    /// Load configuration from file (if found) with environment variable overrides
    pub fn load(&self) -> Result<AppConfig, ConfigError> {
        let mut config = AppConfig::default();

        if let Some(path) = self.find_config_file() {
            info!(?path, "Loading configuration from file");
            config = AppConfig::from_file(&path)?;
        }

        self.apply_env_overrides(&mut config);

        Ok(config)
    }

    /// Find the configuration file to use
    fn find_config_file(&self) -> Option<PathBuf> {
        if let Some(path) = &self.config_path {
            if path.exists() {
                return Some(path.clone());
            }
        }

        if let Ok(path) = env::var("WD_CONFIG") {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }

        CONFIG_PATHS
            .iter()
            .map(PathBuf::from)
            .find(|path| path.exists())
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&self, config: &mut AppConfig) {
        // Endpoints
        if let Ok(val) = env::var("WD_QUEUE_URL") {
            config.endpoints.queue_url = val;
        }
        if let Ok(val) = env::var("WD_INSTANCES_URL") {
            config.endpoints.instances_url = val;
        }
        if let Ok(val) = env::var("WD_SEND_BASE_URL") {
            config.endpoints.send_base_url = val;
        }
        if let Ok(val) = env::var("WD_CONFIRMATION_URL") {
            config.endpoints.confirmation_url = val;
        }

        // Timeouts
        if let Ok(val) = env::var("WD_REQUEST_TIMEOUT_MS") {
            if let Ok(ms) = val.parse() {
                config.http.request_timeout_ms = ms;
            }
        }
        if let Ok(val) = env::var("WD_SEND_TIMEOUT_MS") {
            if let Ok(ms) = val.parse() {
                config.http.send_timeout_ms = ms;
            }
        }

        // Polling
        if let Ok(val) = env::var("WD_QUEUE_INTERVAL_MS") {
            if let Ok(ms) = val.parse() {
                config.polling.queue_interval_ms = ms;
            }
        }
        if let Ok(val) = env::var("WD_INSTANCES_INTERVAL_MS") {
            if let Ok(ms) = val.parse() {
                config.polling.instances_interval_ms = ms;
            }
        }

        // Pacing / retry
        if let Ok(val) = env::var("WD_MAX_MESSAGES_PER_CYCLE") {
            if let Ok(n) = val.parse() {
                config.pacing.max_messages_per_cycle = n;
            }
        }
        if let Ok(val) = env::var("WD_MAX_SEND_ATTEMPTS") {
            if let Ok(n) = val.parse() {
                config.retry.max_send_attempts = n;
            }
        }

        // Ledger
        if let Ok(val) = env::var("WD_LEDGER_PATH") {
            config.ledger.path = val;
        }

        // Server
        if let Ok(val) = env::var("WD_SERVER_ENABLED") {
            config.server.enabled = val.parse().unwrap_or(true);
        }
        if let Ok(val) = env::var("WD_SERVER_PORT") {
            if let Ok(port) = val.parse() {
                config.server.port = port;
            }
        }

        // Logging
        if let Ok(val) = env::var("WD_LOG_FILE") {
            config.logging.file = if val.is_empty() { None } else { Some(val) };
        }
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_explicit_path_is_loaded() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[ledger]
path = "/var/lib/wd/sent.json"

[polling]
idle_poll_interval_ms = 250
"#
        )
        .unwrap();

        let config = ConfigLoader::with_path(file.path()).load().unwrap();
        assert_eq!(config.ledger.path, "/var/lib/wd/sent.json");
        assert_eq!(config.polling.idle_poll_interval_ms, 250);
    }

    #[test]
    fn test_invalid_toml_is_an_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[pacing\nmax_messages_per_cycle = ").unwrap();

        let result = ConfigLoader::with_path(file.path()).load();
        assert!(matches!(result, Err(ConfigError::ParseError(_))));
    }
}

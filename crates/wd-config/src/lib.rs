//! Dispatch Worker Configuration
//!
//! TOML-based configuration with environment variable override support.
//! Every section has defaults, so an empty file (or no file) is valid apart
//! from the endpoint URLs, which must point at a real deployment.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

mod loader;

pub use loader::ConfigLoader;

/// Configuration error types
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

/// Root application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub endpoints: EndpointsConfig,
    pub http: HttpClientConfig,
    pub polling: PollingConfig,
    pub pacing: PacingConfig,
    pub retry: RetryConfig,
    pub ledger: LedgerConfig,
    pub server: ServerConfig,
    pub logging: LoggingConfig,
}

/// Remote endpoints the worker talks to
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointsConfig {
    /// Send-queue endpoint (GET)
    pub queue_url: String,
    /// Instance-status endpoint (GET)
    pub instances_url: String,
    /// Provider base URL; `/{sendText|sendMedia}/{instance}` is appended
    pub send_base_url: String,
    /// Confirmation endpoint (POST)
    pub confirmation_url: String,
    /// Substring of the queue's `message` field meaning "no records"
    pub empty_queue_sentinel: String,
}

impl Default for EndpointsConfig {
    fn default() -> Self {
        Self {
            queue_url: "http://localhost:5000/api/sendwhatsapp/colaenvio".to_string(),
            instances_url: "http://localhost:5000/api/instances".to_string(),
            send_base_url: "http://localhost:8080/message".to_string(),
            confirmation_url: "http://localhost:5000/api/sendwhatsapp/envio".to_string(),
            empty_queue_sentinel: "No hay registros".to_string(),
        }
    }
}

/// Outbound HTTP timeouts
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpClientConfig {
    /// Timeout for queue, instance and confirmation calls
    pub request_timeout_ms: u64,
    /// Timeout for provider send calls
    pub send_timeout_ms: u64,
    pub connect_timeout_ms: u64,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: 15_000,
            send_timeout_ms: 30_000,
            connect_timeout_ms: 10_000,
        }
    }
}

/// Poll intervals
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PollingConfig {
    pub queue_interval_ms: u64,
    pub instances_interval_ms: u64,
    /// How long a dispatch loop waits when the working queue is empty
    pub idle_poll_interval_ms: u64,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            queue_interval_ms: 15_000,
            instances_interval_ms: 15_000,
            idle_poll_interval_ms: 5_000,
        }
    }
}

/// Inclusive `[min_ms, max_ms]` window a delay is drawn from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowMs {
    pub min_ms: u64,
    pub max_ms: u64,
}

impl WindowMs {
    pub const fn new(min_ms: u64, max_ms: u64) -> Self {
        Self { min_ms, max_ms }
    }

    pub fn min(&self) -> Duration {
        Duration::from_millis(self.min_ms)
    }

    pub fn max(&self) -> Duration {
        Duration::from_millis(self.max_ms)
    }

    fn check(&self, name: &str) -> Result<(), ConfigError> {
        if self.min_ms > self.max_ms {
            return Err(ConfigError::ValidationError(format!(
                "{}: min_ms ({}) is greater than max_ms ({})",
                name, self.min_ms, self.max_ms
            )));
        }
        Ok(())
    }
}

/// Send pacing
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PacingConfig {
    /// Sends per instance before a cycle pause is taken
    pub max_messages_per_cycle: u32,
    /// Regular wait between two sends
    pub message_interval: WindowMs,
    pub extended_pause: WindowMs,
    /// Chance a wait is drawn from `extended_pause` instead
    pub extended_pause_probability: f64,
    pub occasional_break: WindowMs,
    /// Chance a cycle pause is drawn from `occasional_break`
    pub occasional_break_probability: f64,
    pub reading: WindowMs,
    pub writing_base: WindowMs,
    pub writing_per_word: WindowMs,
}

impl Default for PacingConfig {
    fn default() -> Self {
        Self {
            max_messages_per_cycle: 7,
            message_interval: WindowMs::new(20_000, 60_000),
            extended_pause: WindowMs::new(60_000, 180_000),
            extended_pause_probability: 0.25,
            occasional_break: WindowMs::new(120_000, 300_000),
            occasional_break_probability: 0.10,
            reading: WindowMs::new(2_000, 4_000),
            writing_base: WindowMs::new(3_000, 6_000),
            writing_per_word: WindowMs::new(80, 200),
        }
    }
}

/// Retry policy for transient send failures
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total send attempts per message, the first one included
    pub max_send_attempts: u32,
    pub backoff: WindowMs,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_send_attempts: 3,
            backoff: WindowMs::new(30_000, 120_000),
        }
    }
}

/// Sent-message ledger file
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    pub path: String,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            path: "./sentMessages.json".to_string(),
        }
    }
}

/// Health / metrics server
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: "0.0.0.0".to_string(),
            port: 9090,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Append a plain-text copy of the log stream to this file
    pub file: Option<String>,
}

impl AppConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: AppConfig = toml::from_str(content)?;
        Ok(config)
    }

    /// Load configuration with environment variable override
    pub fn load() -> Result<Self, ConfigError> {
        ConfigLoader::new().load()
    }

    /// Reject configurations the worker cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        let endpoints = [
            ("endpoints.queue_url", &self.endpoints.queue_url),
            ("endpoints.instances_url", &self.endpoints.instances_url),
            ("endpoints.send_base_url", &self.endpoints.send_base_url),
            ("endpoints.confirmation_url", &self.endpoints.confirmation_url),
        ];
        for (name, url) in endpoints {
            if url.trim().is_empty() {
                return Err(ConfigError::ValidationError(format!("{} is empty", name)));
            }
        }

        let intervals = [
            ("polling.queue_interval_ms", self.polling.queue_interval_ms),
            ("polling.instances_interval_ms", self.polling.instances_interval_ms),
            ("polling.idle_poll_interval_ms", self.polling.idle_poll_interval_ms),
            ("http.request_timeout_ms", self.http.request_timeout_ms),
            ("http.send_timeout_ms", self.http.send_timeout_ms),
        ];
        for (name, value) in intervals {
            if value == 0 {
                return Err(ConfigError::ValidationError(format!("{} must be > 0", name)));
            }
        }

        let p = &self.pacing;
        p.message_interval.check("pacing.message_interval")?;
        p.extended_pause.check("pacing.extended_pause")?;
        p.occasional_break.check("pacing.occasional_break")?;
        p.reading.check("pacing.reading")?;
        p.writing_base.check("pacing.writing_base")?;
        p.writing_per_word.check("pacing.writing_per_word")?;
        self.retry.backoff.check("retry.backoff")?;

        for (name, prob) in [
            ("pacing.extended_pause_probability", p.extended_pause_probability),
            ("pacing.occasional_break_probability", p.occasional_break_probability),
        ] {
            if !(0.0..=1.0).contains(&prob) {
                return Err(ConfigError::ValidationError(format!(
                    "{} must be within [0, 1], got {}",
                    name, prob
                )));
            }
        }

        if p.max_messages_per_cycle == 0 {
            return Err(ConfigError::ValidationError(
                "pacing.max_messages_per_cycle must be > 0".to_string(),
            ));
        }
        if self.retry.max_send_attempts == 0 {
            return Err(ConfigError::ValidationError(
                "retry.max_send_attempts must be > 0".to_string(),
            ));
        }
        if self.ledger.path.trim().is_empty() {
            return Err(ConfigError::ValidationError("ledger.path is empty".to_string()));
        }

        Ok(())
    }

    /// Generate an example TOML configuration
    pub fn example_toml() -> String {
        r#"# Dispatch worker configuration
# Environment variables (WD_*) override these settings

[endpoints]
queue_url = "http://localhost:5000/api/sendwhatsapp/colaenvio"
instances_url = "http://localhost:5000/api/instances"
send_base_url = "http://localhost:8080/message"
confirmation_url = "http://localhost:5000/api/sendwhatsapp/envio"
empty_queue_sentinel = "No hay registros"

[http]
request_timeout_ms = 15000
send_timeout_ms = 30000
connect_timeout_ms = 10000

[polling]
queue_interval_ms = 15000
instances_interval_ms = 15000
idle_poll_interval_ms = 5000

[pacing]
max_messages_per_cycle = 7
extended_pause_probability = 0.25
occasional_break_probability = 0.10
message_interval = { min_ms = 20000, max_ms = 60000 }
extended_pause = { min_ms = 60000, max_ms = 180000 }
occasional_break = { min_ms = 120000, max_ms = 300000 }
reading = { min_ms = 2000, max_ms = 4000 }
writing_base = { min_ms = 3000, max_ms = 6000 }
writing_per_word = { min_ms = 80, max_ms = 200 }

[retry]
max_send_attempts = 3
backoff = { min_ms = 30000, max_ms = 120000 }

[ledger]
path = "./sentMessages.json"

[server]
enabled = true
host = "0.0.0.0"
port = 9090

[logging]
# file = "./envio.log"
"#
        .to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = AppConfig::default();
        config.validate().unwrap();
        assert_eq!(config.pacing.max_messages_per_cycle, 7);
        assert_eq!(config.retry.max_send_attempts, 3);
        assert_eq!(config.http.send_timeout_ms, 30_000);
        assert_eq!(config.polling.idle_poll_interval_ms, 5_000);
    }

    #[test]
    fn test_example_toml_matches_defaults() {
        let parsed = AppConfig::from_toml_str(&AppConfig::example_toml()).unwrap();
        let defaults = AppConfig::default();
        assert_eq!(parsed.pacing.message_interval, defaults.pacing.message_interval);
        assert_eq!(parsed.pacing.writing_per_word, defaults.pacing.writing_per_word);
        assert_eq!(parsed.retry.backoff, defaults.retry.backoff);
        assert_eq!(parsed.endpoints.empty_queue_sentinel, "No hay registros");
        assert!(parsed.logging.file.is_none());
        parsed.validate().unwrap();
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let config = AppConfig::from_toml_str(
            r#"
[retry]
max_send_attempts = 5
"#,
        )
        .unwrap();
        assert_eq!(config.retry.max_send_attempts, 5);
        assert_eq!(config.retry.backoff, WindowMs::new(30_000, 120_000));
        assert_eq!(config.polling.queue_interval_ms, 15_000);
    }

    #[test]
    fn test_inverted_window_rejected() {
        let mut config = AppConfig::default();
        config.pacing.reading = WindowMs::new(5_000, 1_000);
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("pacing.reading"));
    }

    #[test]
    fn test_probability_out_of_range_rejected() {
        let mut config = AppConfig::default();
        config.pacing.extended_pause_probability = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_attempts_rejected() {
        let mut config = AppConfig::default();
        config.retry.max_send_attempts = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_empty_endpoint_rejected() {
        let mut config = AppConfig::default();
        config.endpoints.confirmation_url = String::new();
        assert!(config.validate().is_err());
    }
}

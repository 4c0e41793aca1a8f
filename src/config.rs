//! Runtime configuration for the Sentinel orchestrator.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Main configuration for the orchestrator daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Address the HTTP server binds to.
    pub bind_addr: String,

    /// Port the HTTP server binds to.
    pub port: u16,

    /// Redis connection string backing `SessionStore`.
    pub redis_url: String,

    /// Postgres connection string backing `ModelStore` / `TrustedContextStore`.
    pub database_url: String,

    /// Tunable overrides for the constants listed in the durable-schema section.
    /// Left at defaults unless an operator has a specific reason to deviate.
    pub tuning: TuningConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1".to_string(),
            port: 8080,
            redis_url: "redis://127.0.0.1:6379".to_string(),
            database_url: "postgres://localhost/sentinel".to_string(),
            tuning: TuningConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from the default location, falling back to defaults,
    /// then applying environment variable overrides for the store DSNs and port.
    pub fn load() -> Result<Self, ConfigError> {
        let config_path = Self::config_path();

        let mut config = if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)
                .map_err(|e| ConfigError::IoError(e.to_string()))?;
            serde_json::from_str(&content).map_err(|e| ConfigError::ParseError(e.to_string()))?
        } else {
            Self::default()
        };

        config.apply_env_overrides();
        Ok(config)
    }

    /// Apply `SENTINEL_*` environment overrides on top of file/default values.
    fn apply_env_overrides(&mut self) {
        if let Ok(port) = std::env::var("SENTINEL_PORT") {
            if let Ok(port) = port.parse() {
                self.port = port;
            }
        }
        if let Ok(url) = std::env::var("SENTINEL_REDIS_URL") {
            self.redis_url = url;
        }
        if let Ok(url) = std::env::var("SENTINEL_DATABASE_URL") {
            self.database_url = url;
        }
    }

    /// Save configuration to the default location.
    pub fn save(&self) -> Result<(), ConfigError> {
        let config_path = Self::config_path();

        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::IoError(e.to_string()))?;
        }

        let content = serde_json::to_string_pretty(self)
            .map_err(|e| ConfigError::SerializeError(e.to_string()))?;

        std::fs::write(&config_path, content).map_err(|e| ConfigError::IoError(e.to_string()))?;

        Ok(())
    }

    /// Get the path to the configuration file.
    pub fn config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("sentinel-orchestrator")
            .join("config.json")
    }

    pub fn socket_addr(&self) -> String {
        format!("{}:{}", self.bind_addr, self.port)
    }
}

/// Constants from the durable "configurable constants" table, overridable
/// per-deployment. Defaults match the canonical values exactly; only change
/// these with a reason.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TuningConfig {
    pub keyboard_window: usize,
    pub keyboard_stride: usize,
    pub coffee_break_ms: i64,
    pub hst_trees: usize,
    pub hst_height: u8,
    pub hst_window_size: usize,
    pub min_samples_for_percentile: u64,
    pub decay_tau_secs: f64,
    pub trust_half_life_secs: f64,
    pub identity_maturity_windows: u64,
    pub keyboard_maturity_secs: f64,
    pub keyboard_maturity_count: f64,
    pub strike_decay_interval_secs: i64,
    pub strike_decay_max_per_eval: u32,
    pub mode_hysteresis_allows: u32,
    pub mode_hysteresis_secs: i64,
    pub trusted_hysteresis_allows: u32,
    pub trusted_hysteresis_secs: i64,
    pub learning_suspension_secs: i64,
    pub learning_recovery_secs: i64,
    pub gap_tolerance: i64,
    pub context_stability_secs: i64,
}

impl Default for TuningConfig {
    fn default() -> Self {
        Self {
            keyboard_window: 50,
            keyboard_stride: 5,
            coffee_break_ms: 2000,
            hst_trees: 100,
            hst_height: 6,
            hst_window_size: 50,
            min_samples_for_percentile: 20,
            decay_tau_secs: 45.0,
            trust_half_life_secs: 300.0,
            identity_maturity_windows: 150,
            keyboard_maturity_secs: 20.0,
            keyboard_maturity_count: 15.0,
            strike_decay_interval_secs: 10,
            strike_decay_max_per_eval: 6,
            mode_hysteresis_allows: 5,
            mode_hysteresis_secs: 20,
            trusted_hysteresis_allows: 3,
            trusted_hysteresis_secs: 10,
            learning_suspension_secs: 30,
            learning_recovery_secs: 60,
            gap_tolerance: 10,
            context_stability_secs: 30,
        }
    }
}

/// Configuration errors.
#[derive(Debug)]
pub enum ConfigError {
    IoError(String),
    ParseError(String),
    SerializeError(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::IoError(e) => write!(f, "IO error: {e}"),
            ConfigError::ParseError(e) => write!(f, "Parse error: {e}"),
            ConfigError::SerializeError(e) => write!(f, "Serialize error: {e}"),
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.port, 8080);
        assert_eq!(config.tuning.hst_trees, 100);
        assert_eq!(config.tuning.keyboard_window, 50);
    }

    #[test]
    fn test_socket_addr() {
        let config = Config::default();
        assert_eq!(config.socket_addr(), "127.0.0.1:8080");
    }
}

//! Configuration loading for the control environment

use crate::{CloneEnvError, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::time::Duration;

/// Host used when no hostname is configured
pub const DEFAULT_HOSTNAME: &str = "clonepiext";

/// Per-cycle budget for step dispatch and observation fetch (4.5 ms)
pub const DEFAULT_TIMEOUT_SECS: f64 = 0.0045;

/// How long the release action is held during reset and close (500 ms)
pub const DEFAULT_RELAX_SECS: f64 = 0.5;

/// Upper bound for every configured duration (one day)
pub const MAX_DURATION_SECS: f64 = 86_400.0;

/// Top-level configuration for a `ControlEnvironment`
///
/// Durations are expressed in seconds, matching the YAML files.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct EnvConfig {
    pub hostname: String,
    pub timeout: f64,
    pub cycle_interval: f64,
    pub log_level: LogLevel,
    pub connection: ConnectionConfig,
    pub reset: ResetConfig,
    pub close: CloseConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ConnectionConfig {
    pub handshake_timeout: f64,
    /// Expected actuator count; connect fails if the robot reports another
    pub actuator_count: Option<usize>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ResetConfig {
    pub hold_period: f64,
    pub timeout: f64,
    /// Explicit home action, defaults to every actuator released (-1.0)
    pub home: Option<Vec<f64>>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CloseConfig {
    pub relax_before_close: bool,
    pub relax_period: f64,
}

/// Diagnostic verbosity. Has no effect on control behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    #[default]
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl Default for EnvConfig {
    fn default() -> Self {
        Self {
            hostname: DEFAULT_HOSTNAME.to_string(),
            timeout: DEFAULT_TIMEOUT_SECS,
            cycle_interval: 0.001,
            log_level: LogLevel::default(),
            connection: ConnectionConfig::default(),
            reset: ResetConfig::default(),
            close: CloseConfig::default(),
        }
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: 10.0,
            actuator_count: None,
        }
    }
}

impl Default for ResetConfig {
    fn default() -> Self {
        Self {
            hold_period: DEFAULT_RELAX_SECS,
            timeout: 2.0,
            home: None,
        }
    }
}

impl Default for CloseConfig {
    fn default() -> Self {
        Self {
            relax_before_close: true,
            relax_period: DEFAULT_RELAX_SECS,
        }
    }
}

impl EnvConfig {
    /// Load configuration from a YAML file
    pub fn load_from_path(config_path: &str) -> Result<Self> {
        let contents = fs::read_to_string(config_path)
            .map_err(|e| CloneEnvError::Config(format!("Failed to read {}: {}", config_path, e)))?;
        Self::load_from_str(&contents)
    }

    /// Parse configuration from a YAML string
    pub fn load_from_str(contents: &str) -> Result<Self> {
        let config: EnvConfig = serde_yaml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = hostname.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout.as_secs_f64();
        self
    }

    pub fn with_log_level(mut self, log_level: LogLevel) -> Self {
        self.log_level = log_level;
        self
    }

    /// Reject values that cannot be turned into durations or counts
    pub fn validate(&self) -> Result<()> {
        if self.hostname.trim().is_empty() {
            return Err(CloneEnvError::Config("hostname must not be empty".to_string()));
        }

        let positive = [
            ("timeout", self.timeout),
            ("cycle_interval", self.cycle_interval),
            ("connection.handshake_timeout", self.connection.handshake_timeout),
            ("reset.timeout", self.reset.timeout),
        ];
        for (name, value) in positive {
            if !(value.is_finite() && value > 0.0) {
                return Err(CloneEnvError::Config(format!("{} must be a positive number of seconds, got {}", name, value)));
            }
        }

        let non_negative = [
            ("reset.hold_period", self.reset.hold_period),
            ("close.relax_period", self.close.relax_period),
        ];
        for (name, value) in non_negative {
            if !(value.is_finite() && value >= 0.0) {
                return Err(CloneEnvError::Config(format!("{} must not be negative, got {}", name, value)));
            }
        }

        for (name, value) in positive.into_iter().chain(non_negative) {
            if value > MAX_DURATION_SECS {
                return Err(CloneEnvError::Config(format!(
                    "{} must be at most {} seconds, got {}",
                    name, MAX_DURATION_SECS, value
                )));
            }
        }

        if self.connection.actuator_count == Some(0) {
            return Err(CloneEnvError::Config("connection.actuator_count must be at least 1".to_string()));
        }

        if let Some(home) = &self.reset.home {
            if let Some(expected) = self.connection.actuator_count {
                if home.len() != expected {
                    return Err(CloneEnvError::Config(format!(
                        "reset.home has {} values but actuator_count is {}",
                        home.len(),
                        expected
                    )));
                }
            }
        }

        Ok(())
    }

    /// Default per-call budget for step and get_obs
    pub fn timeout_budget(&self) -> Duration {
        seconds(self.timeout, DEFAULT_TIMEOUT_SECS)
    }

    /// Pacing between repeated sends and polls
    pub fn cycle_interval(&self) -> Duration {
        seconds(self.cycle_interval, 0.001)
    }
}

impl ConnectionConfig {
    pub fn handshake_timeout(&self) -> Duration {
        seconds(self.handshake_timeout, 10.0)
    }
}

impl ResetConfig {
    pub fn hold_period(&self) -> Duration {
        seconds(self.hold_period, DEFAULT_RELAX_SECS)
    }

    pub fn timeout(&self) -> Duration {
        seconds(self.timeout, 2.0)
    }
}

impl CloseConfig {
    pub fn relax_period(&self) -> Duration {
        seconds(self.relax_period, DEFAULT_RELAX_SECS)
    }
}

impl LogLevel {
    /// Filter directive understood by `tracing_subscriber::EnvFilter`
    pub fn as_filter(&self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

impl From<LogLevel> for tracing::Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Error => tracing::Level::ERROR,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Trace => tracing::Level::TRACE,
        }
    }
}

fn seconds(value: f64, fallback: f64) -> Duration {
    Duration::try_from_secs_f64(value).unwrap_or_else(|_| Duration::from_secs_f64(fallback))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approx(duration: Duration, secs: f64) -> bool {
        (duration.as_secs_f64() - secs).abs() < 1e-9
    }

    #[test]
    fn test_defaults() {
        let config = EnvConfig::default();
        assert_eq!(config.hostname, "clonepiext");
        assert!(approx(config.timeout_budget(), 0.0045));
        assert_eq!(config.log_level, LogLevel::Error);
        assert!(approx(config.reset.hold_period(), 0.5));
        assert!(config.close.relax_before_close);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let yaml = r#"
hostname: test-bot
log_level: debug
reset:
  timeout: 1.5
"#;
        let config = EnvConfig::load_from_str(yaml).unwrap();
        assert_eq!(config.hostname, "test-bot");
        assert_eq!(config.log_level, LogLevel::Debug);
        assert!(approx(config.reset.timeout(), 1.5));
        assert!(approx(config.reset.hold_period(), 0.5));
        assert!(approx(config.timeout_budget(), 0.0045));
    }

    #[test]
    fn test_rejects_bad_values() {
        let negative = "timeout: -0.001\n";
        assert!(matches!(EnvConfig::load_from_str(negative), Err(CloneEnvError::Config(_))));

        let empty_host = "hostname: ''\n";
        assert!(matches!(EnvConfig::load_from_str(empty_host), Err(CloneEnvError::Config(_))));

        let home_mismatch = "connection:\n  actuator_count: 3\nreset:\n  home: [-1.0, -1.0]\n";
        assert!(matches!(EnvConfig::load_from_str(home_mismatch), Err(CloneEnvError::Config(_))));

        let endless_reset = "reset:\n  timeout: 1.0e18\n";
        assert!(matches!(EnvConfig::load_from_str(endless_reset), Err(CloneEnvError::Config(_))));

        let endless_relax = "close:\n  relax_period: 1.0e18\n";
        assert!(matches!(EnvConfig::load_from_str(endless_relax), Err(CloneEnvError::Config(_))));

        let unknown_level = "log_level: loud\n";
        assert!(matches!(EnvConfig::load_from_str(unknown_level), Err(CloneEnvError::Yaml(_))));
    }

    #[test]
    fn test_builder_overrides() {
        let config = EnvConfig::default()
            .with_hostname("test-bot")
            .with_timeout(Duration::from_millis(2))
            .with_log_level(LogLevel::Info);
        assert_eq!(config.hostname, "test-bot");
        assert!(approx(config.timeout_budget(), 0.002));
        assert_eq!(tracing::Level::from(config.log_level), tracing::Level::INFO);
    }

    #[test]
    fn test_shipped_config_parses() {
        let path = concat!(env!("CARGO_MANIFEST_DIR"), "/config/default_config.yaml");
        let config = EnvConfig::load_from_path(path).unwrap();
        assert_eq!(config.hostname, DEFAULT_HOSTNAME);
        assert!(approx(config.timeout_budget(), DEFAULT_TIMEOUT_SECS));
        assert_eq!(config.connection.actuator_count, None);
    }

    #[test]
    fn test_missing_file() {
        let err = EnvConfig::load_from_path("does/not/exist.yaml").unwrap_err();
        assert!(err.to_string().contains("does/not/exist.yaml"));
    }
}

// 控制台配置
// Console configuration loaded from an optional JSON file

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Lowest dispatcher tick accepted
pub const MIN_TICK_MS: u64 = 10;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    pub host: String,
    pub port: u16,
    pub unit_id: u8,
    /// Upper bound for one connection attempt
    pub attempt_timeout_ms: u64,
    pub retry_backoff_ms: u64,
    pub max_attempts: u32,
    /// Per-request transport timeout
    pub request_timeout_ms: u64,
    pub request_retries: u32,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            host: "192.168.1.5".to_string(),
            port: 502,
            unit_id: 1,
            attempt_timeout_ms: 10_000,
            retry_backoff_ms: 2_000,
            max_attempts: 3,
            request_timeout_ms: 5_000,
            request_retries: 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    pub tick_ms: u64,
    /// Watchdog for a reply that never arrives
    pub reply_timeout_ms: u64,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self { tick_ms: 50, reply_timeout_ms: 20_000 }
    }
}

impl DispatcherConfig {
    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms.max(MIN_TICK_MS))
    }

    pub fn reply_timeout(&self) -> Duration {
        Duration::from_millis(self.reply_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollingConfig {
    pub high_ms: u64,
    pub low_ms: u64,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self { high_ms: 50, low_ms: 500 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VerifyConfig {
    pub timeout_ms: u64,
    pub fallback_ms: u64,
    pub pulse_hold_ms: u64,
    /// Verification window for mode register writes
    pub mode_timeout_ms: u64,
}

impl Default for VerifyConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 3_000,
            fallback_ms: 500,
            pulse_hold_ms: 1_000,
            mode_timeout_ms: 5_000,
        }
    }
}

impl VerifyConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn fallback(&self) -> Duration {
        Duration::from_millis(self.fallback_ms)
    }

    pub fn pulse_hold(&self) -> Duration {
        Duration::from_millis(self.pulse_hold_ms)
    }

    pub fn mode_timeout(&self) -> Duration {
        Duration::from_millis(self.mode_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    /// Zero the status coils and request a ready check when returning to ReadyCheck
    pub owns_status_registers: bool,
    /// Write the mode register before the session id is known
    pub write_before_session_confirmed: bool,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            owns_status_registers: true,
            write_before_session_confirmed: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecordingConfig {
    pub autosave_secs: u64,
    /// In-memory samples kept per parameter; older ones are dropped
    pub history_limit: usize,
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self { autosave_secs: 30, history_limit: 36_000 }
    }
}

/// Complete console configuration. Every section falls back to defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsoleConfig {
    pub connection: ConnectionConfig,
    pub dispatcher: DispatcherConfig,
    pub polling: PollingConfig,
    pub verify: VerifyConfig,
    pub control: ControlConfig,
    pub recording: RecordingConfig,
}

impl ConsoleConfig {
    /// Load configuration from a JSON file
    ///
    /// # Arguments
    /// * `path` - Path to the JSON document
    ///
    /// # Returns
    /// Validated configuration or the reason it was rejected
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let config: ConsoleConfig = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Apply command-line endpoint overrides and validate the result
    pub fn with_endpoint(mut self, host: Option<String>, port: Option<u16>) -> Result<Self, ConfigError> {
        if let Some(host) = host {
            self.connection.host = host;
        }
        if let Some(port) = port {
            self.connection.port = port;
        }
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.connection.host.trim().is_empty() {
            return Err(ConfigError::Invalid("connection.host is empty".into()));
        }
        if self.connection.port == 0 {
            return Err(ConfigError::Invalid("connection.port must be non-zero".into()));
        }
        if self.recording.history_limit == 0 {
            return Err(ConfigError::Invalid("recording.history_limit must be at least 1".into()));
        }
        if self.connection.max_attempts == 0 {
            return Err(ConfigError::Invalid("connection.max_attempts must be at least 1".into()));
        }
        let intervals = [
            ("connection.attempt_timeout_ms", self.connection.attempt_timeout_ms),
            ("connection.request_timeout_ms", self.connection.request_timeout_ms),
            ("dispatcher.reply_timeout_ms", self.dispatcher.reply_timeout_ms),
            ("polling.high_ms", self.polling.high_ms),
            ("polling.low_ms", self.polling.low_ms),
            ("verify.timeout_ms", self.verify.timeout_ms),
            ("verify.fallback_ms", self.verify.fallback_ms),
            ("verify.mode_timeout_ms", self.verify.mode_timeout_ms),
            ("recording.autosave_secs", self.recording.autosave_secs),
        ];
        for (name, value) in intervals {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{} must be non-zero", name)));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_document_keeps_defaults() {
        let config = ConsoleConfig::from_json(
            r#"{ "connection": { "host": "10.0.0.7" }, "control": { "write_before_session_confirmed": true } }"#,
        )
        .unwrap();
        assert_eq!(config.connection.host, "10.0.0.7");
        assert_eq!(config.connection.port, 502);
        assert_eq!(config.connection.max_attempts, 3);
        assert!(config.control.write_before_session_confirmed);
        assert!(config.control.owns_status_registers);
        assert_eq!(config.polling, PollingConfig::default());
    }

    #[test]
    fn tick_is_clamped_to_floor() {
        let dispatcher = DispatcherConfig { tick_ms: 2, ..Default::default() };
        assert_eq!(dispatcher.tick(), Duration::from_millis(MIN_TICK_MS));
    }

    #[test]
    fn zero_interval_is_rejected() {
        let err = ConsoleConfig::from_json(r#"{ "verify": { "timeout_ms": 0 } }"#).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(msg) if msg.contains("verify.timeout_ms")));
    }

    #[test]
    fn endpoint_overrides_are_validated() {
        let config = ConsoleConfig::default().with_endpoint(Some("10.1.1.2".into()), Some(1502)).unwrap();
        assert_eq!(config.connection.host, "10.1.1.2");
        assert_eq!(config.connection.port, 1502);

        let keep = ConsoleConfig::default().with_endpoint(None, None).unwrap();
        assert_eq!(keep.connection, ConnectionConfig::default());

        assert!(matches!(
            ConsoleConfig::default().with_endpoint(Some("  ".into()), None),
            Err(ConfigError::Invalid(msg)) if msg.contains("host")
        ));
        assert!(matches!(
            ConsoleConfig::default().with_endpoint(None, Some(0)),
            Err(ConfigError::Invalid(msg)) if msg.contains("port")
        ));
    }

    #[test]
    fn malformed_json_is_a_parse_error() {
        assert!(matches!(ConsoleConfig::from_json("{ nope"), Err(ConfigError::Parse(_))));
    }
}

//! Controller configuration using Figment
//!
//! Configuration is loaded from (in order of precedence):
//! 1. Environment variables prefixed with `ARDUINO_DAQ_`
//! 2. TOML configuration file (default: `config/arduino.toml`)
//! 3. Built-in defaults
//!
//! Nested keys are separated by a double underscore, since key names
//! themselves contain underscores:
//!
//! ```text
//! ARDUINO_DAQ_CONNECTION__PORT=/dev/ttyACM1
//! ARDUINO_DAQ_TIMING__OPERATION_TIMEOUT_MS=5000
//! ARDUINO_DAQ_STEPPER__BUSY_POLICY=wait
//! ```
//!
//! # Example
//!
//! ```no_run
//! use arduino_daq::config::ControllerConfig;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ControllerConfig::load_from("config/arduino.toml")?;
//!     println!("Port: {}", config.connection.port);
//!     println!("Timeout: {:?}", config.timing.operation_timeout());
//!     Ok(())
//! }
//! ```

use std::path::Path;
use std::time::Duration;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::coordinator::BusyPolicy;
use crate::session::{ConnectionDescriptor, DEFAULT_BAUD_RATE};

/// Default configuration file location.
pub const DEFAULT_CONFIG_PATH: &str = "config/arduino.toml";

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "ARDUINO_DAQ_";

const VALID_LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Configuration error types
#[derive(Debug, Error)]
#[allow(missing_docs)]
pub enum ConfigError {
    #[error("Configuration load error: {0}")]
    LoadError(#[from] Box<figment::Error>),
    #[error("Configuration validation error: {0}")]
    ValidationError(String),
}

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// Serial link settings
    pub connection: ConnectionConfig,
    /// Timeouts and sampling
    pub timing: TimingConfig,
    /// Stepper defaults
    pub stepper: StepperConfig,
    /// Log output
    pub logging: LoggingConfig,
}

/// Serial link settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Serial port (e.g., "/dev/ttyACM0", "COM3")
    pub port: String,
    /// Baud rate
    pub baud_rate: u32,
    /// Wait after opening the port while the board resets
    pub reset_wait_ms: u64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            port: String::new(),
            baud_rate: DEFAULT_BAUD_RATE,
            reset_wait_ms: 4000,
        }
    }
}

/// Timeouts and sampling
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    /// Upper bound for any blocking operation
    pub operation_timeout_ms: u64,
    /// Analog scan interval programmed into the firmware
    pub analog_scan_interval_ms: u8,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            operation_timeout_ms: 30_000,
            analog_scan_interval_ms: 19,
        }
    }
}

impl TimingConfig {
    /// Operation timeout as a `Duration`.
    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }
}

/// Stepper defaults
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StepperConfig {
    /// Default maximum speed in steps/s
    pub max_speed: u16,
    /// Default acceleration in steps/s²
    pub acceleration: u16,
    /// Driver enable input is active-low (0 powers the driver)
    pub enable_active_low: bool,
    /// Reaction to a motion request on a busy axis
    pub busy_policy: BusyPolicy,
}

impl Default for StepperConfig {
    fn default() -> Self {
        Self {
            max_speed: 400,
            acceleration: 800,
            enable_active_low: true,
            busy_policy: BusyPolicy::Reject,
        }
    }
}

/// Log output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Logging level (trace, debug, info, warn, error)
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl ControllerConfig {
    /// Load from the default location plus environment overrides.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load from `path` plus environment overrides, then validate.
    ///
    /// A missing file is not an error; defaults and environment still apply.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config: Self = Figment::from(Serialized::defaults(Self::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
            .map_err(Box::new)?;

        config.validate()?;
        Ok(config)
    }

    /// Check semantic constraints that parsing cannot.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.connection.baud_rate == 0 {
            return Err(ConfigError::ValidationError("baud_rate must be positive".into()));
        }
        if self.timing.operation_timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "operation_timeout_ms must be positive".into(),
            ));
        }
        if self.timing.analog_scan_interval_ms == 0 {
            return Err(ConfigError::ValidationError(
                "analog_scan_interval_ms must be positive".into(),
            ));
        }
        if self.stepper.max_speed == 0 {
            return Err(ConfigError::ValidationError("stepper max_speed must be positive".into()));
        }
        if !VALID_LOG_LEVELS.contains(&self.logging.level.to_lowercase().as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid log level '{}', expected one of {:?}",
                self.logging.level, VALID_LOG_LEVELS
            )));
        }
        Ok(())
    }

    /// Connection descriptor for [`crate::session::Session::open`].
    pub fn descriptor(&self) -> Result<ConnectionDescriptor, ConfigError> {
        if self.connection.port.trim().is_empty() {
            return Err(ConfigError::ValidationError("connection.port is not set".into()));
        }
        Ok(ConnectionDescriptor::new(self.connection.port.clone())
            .with_baud_rate(self.connection.baud_rate)
            .with_reset_wait(Duration::from_millis(self.connection.reset_wait_ms)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_config(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = ControllerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.connection.baud_rate, 115_200);
        assert_eq!(config.stepper.max_speed, 400);
        assert_eq!(config.stepper.acceleration, 800);
        assert_eq!(config.stepper.busy_policy, BusyPolicy::Reject);
    }

    #[test]
    #[serial]
    fn test_load_partial_file() {
        let file = write_config(
            r#"
[connection]
port = "/dev/ttyACM0"

[stepper]
busy_policy = "wait"
enable_active_low = false
"#,
        );
        let config = ControllerConfig::load_from(file.path()).unwrap();
        assert_eq!(config.connection.port, "/dev/ttyACM0");
        assert_eq!(config.connection.baud_rate, 115_200);
        assert_eq!(config.stepper.busy_policy, BusyPolicy::Wait);
        assert!(!config.stepper.enable_active_low);
        assert_eq!(config.timing.analog_scan_interval_ms, 19);
    }

    #[test]
    #[serial]
    fn test_env_overrides_file() {
        let file = write_config("[timing]\noperation_timeout_ms = 1000\n");
        std::env::set_var("ARDUINO_DAQ_TIMING__OPERATION_TIMEOUT_MS", "2500");
        let result = ControllerConfig::load_from(file.path());
        std::env::remove_var("ARDUINO_DAQ_TIMING__OPERATION_TIMEOUT_MS");

        let config = result.unwrap();
        assert_eq!(config.timing.operation_timeout(), Duration::from_millis(2500));
    }

    #[test]
    #[serial]
    fn test_invalid_log_level() {
        let file = write_config("[logging]\nlevel = \"loud\"\n");
        let err = ControllerConfig::load_from(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError(_)));
    }

    #[test]
    #[serial]
    fn test_malformed_file_is_load_error() {
        let file = write_config("[timing]\noperation_timeout_ms = \"soon\"\n");
        let err = ControllerConfig::load_from(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::LoadError(_)));
    }

    #[test]
    #[serial]
    fn test_shipped_config_loads() {
        let config = ControllerConfig::load_from(DEFAULT_CONFIG_PATH).unwrap();
        assert_eq!(config.connection.port, "/dev/ttyACM0");
        assert_eq!(config.stepper, StepperConfig::default());
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let mut config = ControllerConfig::default();
        config.timing.operation_timeout_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_descriptor_requires_port() {
        let mut config = ControllerConfig::default();
        assert!(config.descriptor().is_err());

        config.connection.port = "COM4".into();
        config.connection.reset_wait_ms = 0;
        let descriptor = config.descriptor().unwrap();
        assert_eq!(descriptor.port, "COM4");
        assert_eq!(descriptor.reset_wait, Duration::ZERO);
    }
}

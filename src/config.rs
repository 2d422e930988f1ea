//! Configuration loading using Figment
//!
//! Settings are read from:
//! 1. A TOML file (default `config/instruments.toml`)
//! 2. Environment variables prefixed with `RUSTINSTR_`
//!
//! Nested keys are separated by a double underscore so that field names keep
//! their own underscores:
//!
//! ```text
//! RUSTINSTR_APPLICATION__LOG_LEVEL=debug
//! RUSTINSTR_TIMEOUTS__READ_TIMEOUT_MS=2500
//! ```
//!
//! # Example
//!
//! ```toml
//! [application]
//! name = "bench"
//! log_level = "info"
//!
//! [[instruments]]
//! id = "dmm"
//! model = "hp34401a"
//! transport = { kind = "visa", resource = "GPIB0::22::INSTR" }
//!
//! [[instruments]]
//! id = "siggen"
//! model = "orx_402a"
//! transport = { kind = "prologix", port = "/dev/ttyUSB0", gpib_address = 9 }
//! ```

use crate::logging::parse_level;
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Configuration error types
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file or environment could not be read or deserialized.
    #[error("Configuration load error: {0}")]
    LoadError(#[from] figment::Error),
    /// The settings loaded but are inconsistent.
    #[error("Configuration validation error: {0}")]
    ValidationError(String),
}

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    /// Application settings
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Link and gate timing
    #[serde(default)]
    pub timeouts: TimeoutSettings,
    /// Instrument definitions
    #[serde(default)]
    pub instruments: Vec<InstrumentDefinition>,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name
    #[serde(default = "default_name")]
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            log_level: default_log_level(),
        }
    }
}

/// Timing applied to every link
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutSettings {
    /// How long a read waits for a reply line
    #[serde(default = "default_read_timeout")]
    pub read_timeout_ms: u64,
    /// Longest wait for the dispatch gate before a write proceeds anyway
    #[serde(default = "default_gate_send_wait")]
    pub gate_send_wait_ms: u64,
    /// Longest wait for the dispatch gate before a read proceeds anyway
    #[serde(default = "default_gate_read_wait")]
    pub gate_read_wait_ms: u64,
    /// Pause after the first command of a slow-starting instrument
    #[serde(default = "default_connect_settle")]
    pub connect_settle_ms: u64,
}

impl Default for TimeoutSettings {
    fn default() -> Self {
        Self {
            read_timeout_ms: default_read_timeout(),
            gate_send_wait_ms: default_gate_send_wait(),
            gate_read_wait_ms: default_gate_read_wait(),
            connect_settle_ms: default_connect_settle(),
        }
    }
}

impl TimeoutSettings {
    /// Read timeout as a `Duration`.
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    /// Gate wait before a write.
    pub fn gate_send_wait(&self) -> Duration {
        Duration::from_millis(self.gate_send_wait_ms)
    }

    /// Gate wait before a read.
    pub fn gate_read_wait(&self) -> Duration {
        Duration::from_millis(self.gate_read_wait_ms)
    }

    /// Connect settle delay.
    pub fn connect_settle(&self) -> Duration {
        Duration::from_millis(self.connect_settle_ms)
    }
}

/// Supported instrument models
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstrumentModel {
    /// OR-X 402A waveform generator
    #[serde(rename = "orx_402a")]
    Orx402a,
    /// Marconi 2019 signal generator
    #[serde(rename = "marconi_2019")]
    Marconi2019,
    /// HP 3457A multimeter
    Hp3457a,
    /// HP 34401A multimeter
    Hp34401a,
    /// HP 6632B power supply
    Hp6632b,
    /// HP 8954A transceiver interface
    Hp8954a,
}

/// How an instrument is reached
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TransportConfig {
    /// Offline substitution: commands are logged, nothing is sent
    Dummy,
    /// VISA resource string (e.g. "GPIB0::22::INSTR")
    Visa {
        /// Resource string.
        resource: String,
    },
    /// USB-TMC device (or USB-GPIB adapter) by `vid:pid` and serial number
    UsbTmc {
        /// `vid:pid` in hex.
        vendor_product: String,
        /// USB serial number.
        serial: String,
    },
    /// Direct serial port
    Serial {
        /// Port name (`/dev/ttyUSB0`, `COM3`).
        port: String,
        /// Line speed, 8N1.
        #[serde(default = "default_baud_rate")]
        baud_rate: u32,
    },
    /// GPIB instrument behind a Prologix GPIB-USB controller
    Prologix {
        /// Serial port of the controller.
        port: String,
        /// Instrument's GPIB address (0-30).
        gpib_address: u8,
    },
    /// Raw TCP, `host:port`
    Telnet {
        /// `host:port`.
        host: String,
    },
}

impl TransportConfig {
    /// True for offline substitution.
    pub fn is_dummy(&self) -> bool {
        matches!(self, TransportConfig::Dummy)
    }
}

/// Instrument definition in configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstrumentDefinition {
    /// Unique instrument identifier, used as the session name in logs
    pub id: String,
    /// Instrument model
    pub model: InstrumentModel,
    /// Whether this instrument is enabled
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Reset the instrument after connecting, where the model supports it
    #[serde(default)]
    pub reset_after_connect: bool,
    /// Link to the instrument
    pub transport: TransportConfig,
}

// ============================================================================
// Default value functions
// ============================================================================

fn default_name() -> String {
    "rust_instr".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_read_timeout() -> u64 {
    1000
}

fn default_gate_send_wait() -> u64 {
    100
}

fn default_gate_read_wait() -> u64 {
    1000
}

fn default_connect_settle() -> u64 {
    3000
}

fn default_enabled() -> bool {
    true
}

fn default_baud_rate() -> u32 {
    9600
}

// ============================================================================
// Configuration Loading and Validation
// ============================================================================

const MAX_GPIB_ADDRESS: u8 = 30;

impl Settings {
    /// Load configuration from `config/instruments.toml` and the environment.
    ///
    /// # Errors
    ///
    /// Returns a ConfigError if the file cannot be parsed or validation fails.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from("config/instruments.toml")
    }

    /// Load configuration from a specific file path
    ///
    /// Environment variables take precedence over the file. A missing file
    /// yields the defaults.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let settings: Self = Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("RUSTINSTR_").split("__"))
            .extract()
            .map_err(ConfigError::LoadError)?;

        settings.validate()?;
        Ok(settings)
    }

    /// Validate configuration after loading
    ///
    /// Checks:
    /// - Log level is valid (trace, debug, info, warn, error)
    /// - Instrument IDs are non-empty and unique
    /// - Each transport is complete (resource strings, ports, `host:port`,
    ///   GPIB address 0-30)
    pub fn validate(&self) -> Result<(), ConfigError> {
        if parse_level(&self.application.log_level).is_err() {
            return Err(ConfigError::ValidationError(format!(
                "Invalid log_level '{}'. Must be one of: trace, debug, info, warn, error",
                self.application.log_level
            )));
        }

        let mut ids = HashSet::new();
        for instrument in &self.instruments {
            if instrument.id.trim().is_empty() {
                return Err(ConfigError::ValidationError(
                    "Instrument ID cannot be empty".to_string(),
                ));
            }
            if !ids.insert(&instrument.id) {
                return Err(ConfigError::ValidationError(format!(
                    "Duplicate instrument ID: '{}'",
                    instrument.id
                )));
            }
            Self::validate_transport(instrument)?;
        }

        Ok(())
    }

    fn validate_transport(instrument: &InstrumentDefinition) -> Result<(), ConfigError> {
        let invalid = |what: &str| {
            Err(ConfigError::ValidationError(format!(
                "Instrument '{}': {}",
                instrument.id, what
            )))
        };
        match &instrument.transport {
            TransportConfig::Dummy => Ok(()),
            TransportConfig::Visa { resource } if resource.trim().is_empty() => {
                invalid("'resource' cannot be empty")
            }
            TransportConfig::UsbTmc {
                vendor_product,
                serial,
            } if !vendor_product.contains(':') || serial.trim().is_empty() => {
                invalid("usb_tmc needs 'vendor_product' as vid:pid and a 'serial'")
            }
            TransportConfig::Serial { port, baud_rate } if port.is_empty() || *baud_rate == 0 => {
                invalid("serial needs a 'port' and a non-zero 'baud_rate'")
            }
            TransportConfig::Prologix { port, .. } if port.is_empty() => {
                invalid("'port' cannot be empty")
            }
            TransportConfig::Prologix { gpib_address, .. } if *gpib_address > MAX_GPIB_ADDRESS => {
                invalid(&format!(
                    "GPIB address {} out of range 0-{}",
                    gpib_address, MAX_GPIB_ADDRESS
                ))
            }
            TransportConfig::Telnet { host } => match host.rsplit_once(':') {
                Some((name, port)) if !name.is_empty() && port.parse::<u16>().is_ok() => Ok(()),
                _ => invalid(&format!("telnet host '{}' is not of the form host:port", host)),
            },
            _ => Ok(()),
        }
    }

    /// Get all enabled instruments
    pub fn enabled_instruments(&self) -> Vec<&InstrumentDefinition> {
        self.instruments
            .iter()
            .filter(|inst| inst.enabled)
            .collect()
    }

    /// Look up an instrument by id
    pub fn instrument(&self, id: &str) -> Option<&InstrumentDefinition> {
        self.instruments.iter().find(|inst| inst.id == id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const SAMPLE: &str = r#"
[application]
name = "bench"
log_level = "debug"

[timeouts]
read_timeout_ms = 2000

[[instruments]]
id = "dmm"
model = "hp34401a"
transport = { kind = "visa", resource = "GPIB0::22::INSTR" }

[[instruments]]
id = "siggen"
model = "orx_402a"
reset_after_connect = true
transport = { kind = "prologix", port = "/dev/ttyUSB0", gpib_address = 9 }

[[instruments]]
id = "psu"
model = "hp6632b"
enabled = false
transport = { kind = "telnet", host = "10.0.0.5:1234" }
"#;

    fn write_config(text: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(text.as_bytes()).unwrap();
        file
    }

    #[test]
    #[serial]
    fn loads_sample_file() {
        let file = write_config(SAMPLE);
        let settings = Settings::load_from(file.path()).unwrap();

        assert_eq!(settings.application.name, "bench");
        assert_eq!(settings.timeouts.read_timeout_ms, 2000);
        assert_eq!(settings.timeouts.gate_send_wait_ms, 100);
        assert_eq!(settings.timeouts.connect_settle(), Duration::from_secs(3));
        assert_eq!(settings.instruments.len(), 3);
        assert_eq!(settings.instruments[1].model, InstrumentModel::Orx402a);
        assert!(settings.instruments[1].reset_after_connect);
        assert_eq!(
            settings.instruments[1].transport,
            TransportConfig::Prologix {
                port: "/dev/ttyUSB0".into(),
                gpib_address: 9
            }
        );

        let enabled: Vec<_> = settings
            .enabled_instruments()
            .iter()
            .map(|i| i.id.as_str())
            .collect();
        assert_eq!(enabled, vec!["dmm", "siggen"]);
        assert!(settings.instrument("psu").is_some());
    }

    #[test]
    #[serial]
    fn missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings::load_from(dir.path().join("absent.toml")).unwrap();
        assert_eq!(settings.application.log_level, "info");
        assert!(settings.instruments.is_empty());
    }

    #[test]
    #[serial]
    fn environment_overrides_file() {
        let file = write_config(SAMPLE);
        std::env::set_var("RUSTINSTR_APPLICATION__LOG_LEVEL", "warn");
        std::env::set_var("RUSTINSTR_TIMEOUTS__GATE_SEND_WAIT_MS", "250");
        let result = Settings::load_from(file.path());
        std::env::remove_var("RUSTINSTR_APPLICATION__LOG_LEVEL");
        std::env::remove_var("RUSTINSTR_TIMEOUTS__GATE_SEND_WAIT_MS");

        let settings = result.unwrap();
        assert_eq!(settings.application.log_level, "warn");
        assert_eq!(settings.timeouts.gate_send_wait_ms, 250);
    }

    #[test]
    #[serial]
    fn unknown_model_is_a_load_error() {
        let file = write_config(
            r#"
[[instruments]]
id = "x"
model = "hp9999"
transport = { kind = "dummy" }
"#,
        );
        assert!(matches!(
            Settings::load_from(file.path()),
            Err(ConfigError::LoadError(_))
        ));
    }

    fn definition(id: &str, transport: TransportConfig) -> InstrumentDefinition {
        InstrumentDefinition {
            id: id.to_string(),
            model: InstrumentModel::Hp3457a,
            enabled: true,
            reset_after_connect: false,
            transport,
        }
    }

    fn validation_message(instruments: Vec<InstrumentDefinition>) -> String {
        let settings = Settings {
            instruments,
            ..Settings::default()
        };
        match settings.validate() {
            Err(ConfigError::ValidationError(msg)) => msg,
            other => panic!("expected validation error, got {:?}", other),
        }
    }

    #[test]
    fn rejects_invalid_log_level() {
        let mut settings = Settings::default();
        settings.application.log_level = "verbose".into();
        assert!(settings.validate().is_err());
    }

    #[test]
    fn log_level_accepts_whatever_the_subscriber_accepts() {
        let mut settings = Settings::default();
        for level in ["trace", "DEBUG", "Info", "warn", "error"] {
            settings.application.log_level = level.into();
            assert!(settings.validate().is_ok(), "{}", level);
            assert!(parse_level(level).is_ok());
        }
    }

    #[test]
    fn rejects_duplicate_ids() {
        let msg = validation_message(vec![
            definition("a", TransportConfig::Dummy),
            definition("a", TransportConfig::Dummy),
        ]);
        assert!(msg.contains("Duplicate instrument ID"));
    }

    #[test]
    fn rejects_incomplete_transports() {
        let msg = validation_message(vec![definition(
            "dmm",
            TransportConfig::Visa {
                resource: " ".into(),
            },
        )]);
        assert!(msg.contains("'resource' cannot be empty"));

        let msg = validation_message(vec![definition(
            "dmm",
            TransportConfig::Prologix {
                port: "/dev/ttyUSB0".into(),
                gpib_address: 31,
            },
        )]);
        assert!(msg.contains("GPIB address 31"));

        let msg = validation_message(vec![definition(
            "dmm",
            TransportConfig::Telnet {
                host: "10.0.0.5".into(),
            },
        )]);
        assert!(msg.contains("host:port"));
    }

    #[test]
    fn accepts_complete_transports() {
        let settings = Settings {
            instruments: vec![
                definition("a", TransportConfig::Dummy),
                definition(
                    "b",
                    TransportConfig::UsbTmc {
                        vendor_product: "03eb:2065".into(),
                        serial: "HP3457A".into(),
                    },
                ),
                definition(
                    "c",
                    TransportConfig::Telnet {
                        host: "bench-gpib:1234".into(),
                    },
                ),
            ],
            ..Settings::default()
        };
        settings.validate().unwrap();
    }
}

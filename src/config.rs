//! Connection and session settings
//!
//! ```rust
//! use solar_modbus::ClientConfig;
//!
//! let config = ClientConfig::from_json_str(r#"{ "host": "192.168.1.20", "max_batteries": 2 }"#).unwrap();
//! assert_eq!(config.port, 502);
//! assert_eq!(config.unit_id, 0x32);
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ModbusError, ModbusResult};
use crate::utils::validation::validate_unit_id;

/// Everything needed to open a session with one plant
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub host: String,
    pub port: u16,
    /// Unit id of the inverter; LV battery `i` answers on `unit_id + i`
    pub unit_id: u8,
    pub connect_timeout_ms: u64,
    pub request_timeout_ms: u64,
    pub max_batteries: usize,
    /// Hex dump every frame through `tracing`
    pub packet_logging: bool,
    pub inverter_model: String,
    /// `lv-battery`, `hv-bcu` or `hv-bmu`
    pub battery_model: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: crate::DEFAULT_TCP_PORT,
            unit_id: crate::DEFAULT_UNIT_ID,
            connect_timeout_ms: crate::DEFAULT_CONNECT_TIMEOUT_MS,
            request_timeout_ms: crate::DEFAULT_REQUEST_TIMEOUT_MS,
            max_batteries: crate::DEFAULT_MAX_BATTERIES,
            packet_logging: false,
            inverter_model: "hybrid-inverter".to_string(),
            battery_model: "lv-battery".to_string(),
        }
    }
}

impl ClientConfig {
    /// Defaults for everything but the address
    pub fn new(host: impl Into<String>, port: u16, unit_id: u8) -> Self {
        Self {
            host: host.into(),
            port,
            unit_id,
            ..Self::default()
        }
    }

    /// Parse and validate a JSON document; missing keys take their defaults
    pub fn from_json_str(json: &str) -> ModbusResult<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Read a JSON config file
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> ModbusResult<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .map_err(|e| ModbusError::configuration(format!("Cannot read {}: {}", path.display(), e)))?;
        Self::from_json_str(&json)
    }

    pub fn validate(&self) -> ModbusResult<()> {
        if self.host.trim().is_empty() {
            return Err(ModbusError::configuration("host must not be empty"));
        }
        validate_unit_id(self.unit_id)?;
        if self.connect_timeout_ms == 0 || self.request_timeout_ms == 0 {
            return Err(ModbusError::configuration("timeouts must be greater than zero"));
        }
        if self.max_batteries > crate::MAX_BATTERIES {
            return Err(ModbusError::configuration(format!(
                "max_batteries {} exceeds the limit of {}",
                self.max_batteries,
                crate::MAX_BATTERIES
            )));
        }
        if self.unit_id as usize + self.max_batteries > 248 {
            return Err(ModbusError::configuration("battery unit ids would run past 247"));
        }
        Ok(())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ClientConfig::default();
        assert_eq!(config.port, 502);
        assert_eq!(config.unit_id, 0x32);
        assert_eq!(config.request_timeout(), Duration::from_millis(1500));
        assert_eq!(config.max_batteries, 5);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_json() {
        let config = ClientConfig::from_json_str(r#"{"host": "inverter.local", "packet_logging": true}"#).unwrap();
        assert_eq!(config.host, "inverter.local");
        assert!(config.packet_logging);
        assert_eq!(config.inverter_model, "hybrid-inverter");
    }

    #[test]
    fn test_rejects_bad_values() {
        for json in [
            r#"{"unit_id": 0}"#,
            r#"{"request_timeout_ms": 0}"#,
            r#"{"max_batteries": 7}"#,
            r#"{"host": ""}"#,
            r#"{"port": "not a number"}"#,
        ] {
            assert!(
                matches!(ClientConfig::from_json_str(json), Err(ModbusError::Configuration { .. })),
                "{} was accepted",
                json
            );
        }
    }

    #[test]
    fn test_round_trip_json() {
        let config = ClientConfig::new("10.0.0.5", 8899, 0x11);
        let json = serde_json::to_string(&config).unwrap();
        assert_eq!(ClientConfig::from_json_str(&json).unwrap(), config);
    }
}

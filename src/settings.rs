use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::events::DEFAULT_QUEUE_CAPACITY;
use crate::io::framer::DEFAULT_MAX_LINE_LENGTH;
use crate::io::{BridgeError, LinkOptions, Parity, SerialLineConfig, DEFAULT_BAUD_RATE};

/// Longest poll interval allowed; disconnect latency is bounded by it
const MAX_POLL_INTERVAL_MS: u64 = 200;

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Settings {
    /// Port to connect to when none is given on the command line
    #[serde(default)]
    pub default_port: Option<String>,
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    #[serde(default = "default_data_bits")]
    pub data_bits: u8,
    #[serde(default = "default_stop_bits")]
    pub stop_bits: u8,
    #[serde(default = "default_parity")]
    pub parity: String, // "none" | "odd" | "even"
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_fault_backoff_ms")]
    pub fault_backoff_ms: u64,
    #[serde(default = "default_max_line_length")]
    pub max_line_length: usize,
    #[serde(default = "default_event_queue_capacity")]
    pub event_queue_capacity: usize,
    /// Directory for log files (None = stderr only)
    #[serde(default)]
    pub log_dir: Option<String>,
}

fn default_baud_rate() -> u32 {
    DEFAULT_BAUD_RATE
}
fn default_data_bits() -> u8 {
    8
}
fn default_stop_bits() -> u8 {
    1
}
fn default_parity() -> String {
    "none".to_string()
}
fn default_poll_interval_ms() -> u64 {
    50
}
fn default_fault_backoff_ms() -> u64 {
    100
}
fn default_max_line_length() -> usize {
    DEFAULT_MAX_LINE_LENGTH
}
fn default_event_queue_capacity() -> usize {
    DEFAULT_QUEUE_CAPACITY
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            default_port: None,
            baud_rate: default_baud_rate(),
            data_bits: default_data_bits(),
            stop_bits: default_stop_bits(),
            parity: default_parity(),
            poll_interval_ms: default_poll_interval_ms(),
            fault_backoff_ms: default_fault_backoff_ms(),
            max_line_length: default_max_line_length(),
            event_queue_capacity: default_event_queue_capacity(),
            log_dir: None,
        }
    }
}

impl Settings {
    pub fn validate(&self) -> Result<(), BridgeError> {
        if self.baud_rate == 0 {
            return Err(BridgeError::configuration("baud_rate must be greater than 0"));
        }
        if !(1..=MAX_POLL_INTERVAL_MS).contains(&self.poll_interval_ms) {
            return Err(BridgeError::configuration(format!(
                "poll_interval_ms must be between 1 and {}, got {}",
                MAX_POLL_INTERVAL_MS, self.poll_interval_ms
            )));
        }
        if self.max_line_length == 0 {
            return Err(BridgeError::configuration("max_line_length must be greater than 0"));
        }
        if self.event_queue_capacity == 0 {
            return Err(BridgeError::configuration(
                "event_queue_capacity must be greater than 0",
            ));
        }
        Ok(())
    }

    pub fn link_options(&self) -> LinkOptions {
        LinkOptions {
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            fault_backoff: Duration::from_millis(self.fault_backoff_ms),
            max_line_length: self.max_line_length,
        }
    }

    pub fn serial_line(&self) -> SerialLineConfig {
        SerialLineConfig {
            data_bits: self.data_bits,
            stop_bits: self.stop_bits,
            parity: Parity::from_name(&self.parity),
        }
    }
}

/// `<config dir>/pinbridge/settings.json`, if the platform has a config dir
pub fn default_settings_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("pinbridge").join("settings.json"))
}

fn is_toml(path: &Path) -> bool {
    path.extension().and_then(|s| s.to_str()) == Some("toml")
}

/// Load settings from `path`. A missing file yields defaults. Files ending in
/// `.toml` are parsed as TOML, anything else as JSON.
pub fn load_settings(path: &Path) -> Result<Settings, BridgeError> {
    if !path.exists() {
        return Ok(Settings::default());
    }

    let content = std::fs::read_to_string(path)
        .map_err(|e| BridgeError::configuration(format!("Failed to read settings: {}", e)))?;

    let settings: Settings = if is_toml(path) {
        toml::from_str(&content)
            .map_err(|e| BridgeError::configuration(format!("Failed to parse settings: {}", e)))?
    } else {
        serde_json::from_str(&content)
            .map_err(|e| BridgeError::configuration(format!("Failed to parse settings: {}", e)))?
    };

    settings.validate()?;
    Ok(settings)
}

pub fn save_settings(path: &Path, settings: &Settings) -> Result<(), BridgeError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| {
            BridgeError::configuration(format!("Failed to create settings dir: {}", e))
        })?;
    }

    let content = if is_toml(path) {
        toml::to_string_pretty(settings)
            .map_err(|e| BridgeError::configuration(format!("Failed to serialize settings: {}", e)))?
    } else {
        serde_json::to_string_pretty(settings)
            .map_err(|e| BridgeError::configuration(format!("Failed to serialize settings: {}", e)))?
    };

    std::fs::write(path, content)
        .map_err(|e| BridgeError::configuration(format!("Failed to write settings: {}", e)))
}

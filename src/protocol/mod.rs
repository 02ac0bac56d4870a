// src/protocol/mod.rs
//
// Line protocol spoken between the host and the bridge firmware.
// Pure functions only; no I/O happens here.

pub mod classify;
pub mod config;
pub mod status;

use serde::{Deserialize, Serialize};

pub use classify::{classify_line, ClassifiedEvent};
pub use config::{build_config_command, out_of_range_channels, ANALOG_CHANNELS, DIGITAL_CHANNELS};
pub use status::{parse_status, StatusSnapshot};

/// Which side of the link produced a message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Origin {
    /// Sent by this process
    Host,
    /// Output from the bridge or the device behind it
    DeviceToHost,
    /// The bridge reporting what it relayed to the downstream device
    BridgeToDevice,
}

impl Origin {
    pub fn as_str(&self) -> &'static str {
        match self {
            Origin::Host => "host",
            Origin::DeviceToHost => "device-to-host",
            Origin::BridgeToDevice => "bridge-to-device",
        }
    }
}

impl std::fmt::Display for Origin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// src/io/mod.rs
//
// Serial link abstraction for the pin bridge.
// The link manager owns one connection at a time and talks to it through a
// Transport, which is either a real serial port or the simulated firmware.

// Core modules
mod error;
pub mod framer;
pub mod link;
pub mod transport;

// Transports
pub mod serial;
pub mod simulated;

pub use error::BridgeError;
pub use link::{LinkManager, LinkOptions, LoopStats, TransmitOutcome};
pub use serial::{Parity, SerialLineConfig};
#[cfg(any(target_os = "windows", target_os = "macos", target_os = "linux"))]
pub use serial::SerialTransport;
pub use simulated::{SimulatedDevice, SimulatedTransport};
pub use transport::{LinkHandles, PortInfo, Transport};

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Default baud rate of the bridge firmware
pub const DEFAULT_BAUD_RATE: u32 = 9600;

/// Connection lifecycle state, owned by the link manager
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "message")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Error(String),
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Error(_) => "error",
        }
    }
}

/// Get current time in microseconds since UNIX epoch
pub fn now_us() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

// src/io/error.rs
//
// Typed errors for the serial bridge. Each local-recovery branch in the link
// manager and read loop maps to exactly one variant.

use thiserror::Error;

/// Errors produced by the serial bridge core.
///
/// None of these are fatal to the process: the link manager reports them via
/// return values and log events and carries on.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BridgeError {
    /// The port could not be opened.
    #[error("Failed to open {port}: {reason}")]
    ConnectionFailure { port: String, reason: String },

    /// An I/O error or end of stream while the read loop was running.
    #[error("Read error on {port}: {reason}")]
    TransientReadFault { port: String, reason: String },

    /// A `STATUS:` payload that could not be parsed.
    #[error("Malformed status frame: {0}")]
    MalformedStatusFrame(String),

    /// Writing a line to the port failed.
    #[error("Write error on {port}: {reason}")]
    WriteFailure { port: String, reason: String },

    /// A command needed an open link and there was none.
    #[error("Not connected")]
    NotConnected,

    /// Platform port enumeration failed.
    #[error("Failed to enumerate ports: {0}")]
    Enumeration(String),

    /// Invalid settings or parameters.
    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl BridgeError {
    pub fn connection(port: &str, reason: impl Into<String>) -> Self {
        Self::ConnectionFailure {
            port: port.to_string(),
            reason: reason.into(),
        }
    }

    pub fn read(port: &str, reason: impl Into<String>) -> Self {
        Self::TransientReadFault {
            port: port.to_string(),
            reason: reason.into(),
        }
    }

    pub fn write(port: &str, reason: impl Into<String>) -> Self {
        Self::WriteFailure {
            port: port.to_string(),
            reason: reason.into(),
        }
    }

    pub fn configuration(reason: impl Into<String>) -> Self {
        Self::Configuration(reason.into())
    }
}

impl From<BridgeError> for String {
    fn from(e: BridgeError) -> Self {
        e.to_string()
    }
}

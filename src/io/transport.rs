// src/io/transport.rs
//
// Byte-source capability used by the link manager. A transport enumerates
// ports and opens one as a pair of independent read and write handles, so
// the read loop and senders never contend for the same handle.

use serde::Serialize;
use std::io::{Read, Write};
use std::time::Duration;

use super::BridgeError;

/// Information about an available port
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct PortInfo {
    pub port_name: String,
    pub port_type: String,
    pub manufacturer: Option<String>,
    pub product: Option<String>,
    pub serial_number: Option<String>,
    pub vid: Option<u16>,
    pub pid: Option<u16>,
}

impl PortInfo {
    /// A port with nothing known beyond its name and kind.
    pub fn named(port_name: impl Into<String>, port_type: impl Into<String>) -> Self {
        PortInfo {
            port_name: port_name.into(),
            port_type: port_type.into(),
            manufacturer: None,
            product: None,
            serial_number: None,
            vid: None,
            pid: None,
        }
    }
}

/// An open link, split into its two directions.
///
/// `reader.read` must return within roughly the poll interval passed to
/// `Transport::open`, either with data or with `ErrorKind::TimedOut`, so the
/// read loop can observe cancellation.
pub struct LinkHandles {
    pub reader: Box<dyn Read + Send>,
    pub writer: Box<dyn Write + Send>,
}

/// Something that can enumerate and open line-oriented serial links.
pub trait Transport: Send + Sync {
    /// Short label for logs ("serial", "simulated")
    fn kind(&self) -> &'static str;

    /// Enumerate available ports.
    fn list_ports(&self) -> Result<Vec<PortInfo>, BridgeError>;

    /// Open a port. May block for as long as the platform open call does.
    fn open(
        &self,
        port: &str,
        baud_rate: u32,
        poll_interval: Duration,
    ) -> Result<LinkHandles, BridgeError>;
}

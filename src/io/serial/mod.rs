// src/io/serial/mod.rs
//
// Serial port transport for the pin bridge.
// Enumerates ports and opens them as split read/write handles.

mod line;
// serialport is only pulled in on desktop targets
#[cfg(any(target_os = "windows", target_os = "macos", target_os = "linux"))]
mod port;

pub use line::{Parity, SerialLineConfig};
#[cfg(any(target_os = "windows", target_os = "macos", target_os = "linux"))]
pub use port::SerialTransport;

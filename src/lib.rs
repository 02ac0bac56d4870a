// Must come first so `tlog!` is visible to every module below
#[macro_use]
mod logging;

mod cli;
pub mod events;
pub mod io;
pub mod protocol;
pub mod settings;

pub use events::{BridgeEvent, EventHub, EventListener, ListenerId};
pub use io::{
    BridgeError, ConnectionState, LinkManager, LinkOptions, PortInfo, SimulatedTransport,
    TransmitOutcome, Transport,
};
#[cfg(any(target_os = "windows", target_os = "macos", target_os = "linux"))]
pub use io::SerialTransport;
pub use protocol::{build_config_command, classify_line, parse_status, ClassifiedEvent, Origin, StatusSnapshot};

use clap::Parser;

/// Parse the command line and run it to completion.
pub fn run() -> Result<(), String> {
    let cli = cli::Cli::parse();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| format!("Failed to start async runtime: {}", e))?;

    runtime.block_on(cli::execute(cli))
}

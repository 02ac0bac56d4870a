// src/cli.rs
//
// Terminal monitor for the pin bridge. Lists ports, connects to a real or
// simulated bridge, prints every event and forwards typed lines.
//
// Interactive commands while monitoring:
//   /cfg D2 D3 A0        push pin monitoring config
//   /cfg all | none      monitor every pin, or none
//   /connect [port] [baud]
//   /disconnect
//   /ports
//   /quit
// Anything else is sent to the device as-is.

use clap::{Parser, Subcommand};
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};

use crate::events::{EventHub, EventListener};
use crate::io::simulated::MOCK_PORT;
use crate::io::{ConnectionState, LinkManager, PortInfo, SimulatedTransport, Transport};
use crate::protocol::{Origin, StatusSnapshot, ANALOG_CHANNELS, DIGITAL_CHANNELS};
use crate::settings::{self, Settings};

#[derive(Parser, Debug)]
#[command(name = "pinbridge", version, about = "Serial bridge monitor for pin-reporting firmware")]
pub struct Cli {
    /// Settings file (JSON, or TOML by extension)
    #[arg(long, global = true)]
    pub settings: Option<PathBuf>,

    /// Also write logs to this directory
    #[arg(long, global = true)]
    pub log_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Write a settings file with every default filled in
    InitSettings {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
    /// List available serial ports
    Ports {
        /// List the simulated port instead
        #[arg(long)]
        simulate: bool,
    },
    /// Connect and print events; typed lines are sent to the device
    Monitor {
        /// Port to open (defaults to the settings file's default_port)
        port: Option<String>,
        /// Baud rate (defaults to settings, 9600 out of the box)
        #[arg(short, long)]
        baud: Option<u32>,
        /// Talk to the built-in firmware simulator
        #[arg(long)]
        simulate: bool,
        /// Print events as JSON lines
        #[arg(long)]
        json: bool,
    },
}

// ============================================================================
// Console Output
// ============================================================================

fn format_time(timestamp_us: u64) -> String {
    chrono::DateTime::from_timestamp_micros(timestamp_us as i64)
        .map(|t| t.with_timezone(&chrono::Local).format("%H:%M:%S%.3f").to_string())
        .unwrap_or_else(|| "--:--:--.---".to_string())
}

fn format_status(status: &StatusSnapshot) -> String {
    status
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(" ")
}

fn format_port(port: &PortInfo) -> String {
    match (&port.manufacturer, &port.product) {
        (Some(m), Some(p)) => format!("{}  [{}] {} {}", port.port_name, port.port_type, m, p),
        (None, Some(p)) => format!("{}  [{}] {}", port.port_name, port.port_type, p),
        _ => format!("{}  [{}]", port.port_name, port.port_type),
    }
}

/// Human-readable event printer
struct ConsoleListener;

impl EventListener for ConsoleListener {
    fn on_message(&self, origin: Origin, content: &str, timestamp_us: u64) {
        println!("[{}] {:>16}: {}", format_time(timestamp_us), origin, content);
    }

    fn on_status(&self, status: &StatusSnapshot) {
        println!("[{}] {:>16}: {}", format_time(crate::io::now_us()), "status", format_status(status));
    }

    fn on_log(&self, text: &str) {
        println!("[{}] {:>16}: {}", format_time(crate::io::now_us()), "log", text);
    }

    fn on_state(&self, _previous: &ConnectionState, current: &ConnectionState) {
        let detail = match current {
            ConnectionState::Error(reason) => format!("{} ({})", current.as_str(), reason),
            _ => current.as_str().to_string(),
        };
        println!("[{}] {:>16}: {}", format_time(crate::io::now_us()), "state", detail);
    }
}

// ============================================================================
// Command Parsing
// ============================================================================

/// Parse pin names like "D2 d3 A0" into digital and analog index sets.
/// `all` selects every pin the firmware reports, `none` clears the set.
pub fn parse_pin_list<'a>(
    tokens: impl IntoIterator<Item = &'a str>,
) -> Result<(BTreeSet<u8>, BTreeSet<u8>), String> {
    let mut digital = BTreeSet::new();
    let mut analog = BTreeSet::new();

    for token in tokens {
        let token = token.trim_matches(',');
        if token.is_empty() {
            continue;
        }
        match token.to_ascii_lowercase().as_str() {
            "all" => {
                digital.extend(0..DIGITAL_CHANNELS);
                analog.extend(0..ANALOG_CHANNELS);
                continue;
            }
            "none" => {
                digital.clear();
                analog.clear();
                continue;
            }
            _ => {}
        }
        let invalid = || format!("Invalid pin '{}': expected D<n> or A<n>", token);
        let mut chars = token.chars();
        let kind = chars.next().ok_or_else(invalid)?;
        let index: u8 = chars.as_str().parse().map_err(|_| invalid())?;
        match kind {
            'D' | 'd' => digital.insert(index),
            'A' | 'a' => analog.insert(index),
            _ => return Err(invalid()),
        };
    }

    Ok((digital, analog))
}

#[derive(Debug, PartialEq)]
enum MonitorCommand {
    Send(String),
    Config(BTreeSet<u8>, BTreeSet<u8>),
    Connect(Option<String>, Option<u32>),
    Disconnect,
    Ports,
    Quit,
    Invalid(String),
    Empty,
}

fn parse_monitor_command(input: &str) -> MonitorCommand {
    let trimmed = input.trim_end_matches(['\r', '\n']);
    if trimmed.trim().is_empty() {
        return MonitorCommand::Empty;
    }
    if !trimmed.starts_with('/') {
        return MonitorCommand::Send(trimmed.to_string());
    }

    let mut words = trimmed.split_whitespace();
    match words.next() {
        Some("/cfg") => match parse_pin_list(words) {
            Ok((digital, analog)) => MonitorCommand::Config(digital, analog),
            Err(e) => MonitorCommand::Invalid(e),
        },
        Some("/connect") => {
            let port = words.next().map(str::to_string);
            match words.next().map(str::parse::<u32>) {
                None => MonitorCommand::Connect(port, None),
                Some(Ok(baud)) => MonitorCommand::Connect(port, Some(baud)),
                Some(Err(_)) => MonitorCommand::Invalid("Baud rate must be a number".to_string()),
            }
        }
        Some("/disconnect") => MonitorCommand::Disconnect,
        Some("/ports") => MonitorCommand::Ports,
        Some("/quit") | Some("/exit") => MonitorCommand::Quit,
        Some(other) => MonitorCommand::Invalid(format!("Unknown command {}", other)),
        None => MonitorCommand::Empty,
    }
}

// ============================================================================
// Entry Points
// ============================================================================

fn load_or_default(path: Option<&PathBuf>) -> Settings {
    let Some(path) = path.cloned().or_else(settings::default_settings_path) else {
        return Settings::default();
    };
    match settings::load_settings(&path) {
        Ok(s) => s,
        Err(e) => {
            tlog!("[cli] {} ({}), using defaults", e, path.display());
            Settings::default()
        }
    }
}

pub async fn execute(cli: Cli) -> Result<(), String> {
    let settings = load_or_default(cli.settings.as_ref());

    let log_dir = cli
        .log_dir
        .clone()
        .or_else(|| settings.log_dir.as_ref().map(PathBuf::from));
    if let Some(dir) = log_dir {
        if let Err(e) = crate::logging::init_file_logging(&dir) {
            tlog!("[cli] {}", e);
        }
    }

    let result = match cli.command {
        Command::InitSettings { force } => init_settings(cli.settings.as_ref(), &settings, force),
        Command::Ports { simulate } => list_ports(&settings, simulate),
        Command::Monitor {
            port,
            baud,
            simulate,
            json,
        } => monitor(&settings, port, baud, simulate, json).await,
    };

    crate::logging::stop_file_logging();
    result
}

/// Write `settings` (defaults merged with any existing file) so every knob is
/// visible for editing.
fn init_settings(path: Option<&PathBuf>, settings: &Settings, force: bool) -> Result<(), String> {
    let path = path
        .cloned()
        .or_else(settings::default_settings_path)
        .ok_or("No config directory on this platform; pass --settings")?;
    if path.exists() && !force {
        return Err(format!("{} already exists (use --force to overwrite)", path.display()));
    }
    settings::save_settings(&path, settings).map_err(String::from)?;
    println!("Wrote {}", path.display());
    Ok(())
}

#[cfg(any(target_os = "windows", target_os = "macos", target_os = "linux"))]
fn serial_transport(settings: &Settings) -> Result<Arc<dyn Transport>, String> {
    Ok(Arc::new(crate::io::SerialTransport::new(settings.serial_line())))
}

#[cfg(not(any(target_os = "windows", target_os = "macos", target_os = "linux")))]
fn serial_transport(_settings: &Settings) -> Result<Arc<dyn Transport>, String> {
    Err("Serial ports are not supported on this platform (try --simulate)".to_string())
}

fn list_ports(settings: &Settings, simulate: bool) -> Result<(), String> {
    let transport: Arc<dyn Transport> = if simulate {
        Arc::new(SimulatedTransport::default())
    } else {
        serial_transport(settings)?
    };
    let manager = LinkManager::new(transport, settings.link_options(), EventHub::new(16));
    let ports = manager.list_ports();
    if ports.is_empty() {
        println!("No serial ports found");
    }
    for port in ports {
        println!("{}", format_port(&port));
    }
    Ok(())
}

async fn monitor(
    settings: &Settings,
    port: Option<String>,
    baud: Option<u32>,
    simulate: bool,
    json: bool,
) -> Result<(), String> {
    let baud = baud.unwrap_or(settings.baud_rate);
    let hub = EventHub::new(settings.event_queue_capacity);

    // Simulator keeps reporting on its own until we stop it
    let autonomous_stop = Arc::new(AtomicBool::new(false));
    let (transport, port, autonomous): (Arc<dyn Transport>, String, _) = if simulate {
        let transport = SimulatedTransport::default();
        let handle = transport.device().spawn_autonomous(autonomous_stop.clone());
        (
            Arc::new(transport) as Arc<dyn Transport>,
            port.unwrap_or_else(|| MOCK_PORT.to_string()),
            Some(handle),
        )
    } else {
        let port = port
            .or_else(|| settings.default_port.clone())
            .ok_or("No port given and no default_port in settings (try `pinbridge ports`)")?;
        (serial_transport(settings)?, port, None)
    };

    let manager = LinkManager::new(transport, settings.link_options(), hub);

    let printer = if json {
        let (_id, mut rx) = manager.subscribe_channel(settings.event_queue_capacity);
        Some(tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                match serde_json::to_string(&event) {
                    Ok(line) => println!("{}", line),
                    Err(e) => tlog!("[cli] Failed to serialize event: {}", e),
                }
            }
        }))
    } else {
        manager.subscribe(Arc::new(ConsoleListener));
        None
    };

    let result = if manager.connect(&port, baud).await {
        run_console(&manager, &port, baud).await;
        Ok(())
    } else {
        Err(format!("Could not connect to {}", port))
    };

    manager.disconnect().await;
    manager.events().flush();

    autonomous_stop.store(true, Ordering::Relaxed);
    if let Some(handle) = autonomous {
        let _ = handle.join();
    }
    if let Some(printer) = printer {
        // Dropping the last hub handle stops dispatch and closes the channel
        drop(manager);
        let _ = printer.await;
    }
    result
}

/// Read stdin until EOF, ctrl-c or /quit
async fn run_console(manager: &LinkManager, port: &str, baud: u32) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let input = tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(e) => {
                    tlog!("[cli] stdin error: {}", e);
                    break;
                }
            },
            _ = tokio::signal::ctrl_c() => break,
        };

        match parse_monitor_command(&input) {
            MonitorCommand::Send(line) => {
                manager.send(&line);
            }
            MonitorCommand::Config(digital, analog) => {
                manager.send_config(&digital, &analog);
            }
            MonitorCommand::Connect(new_port, new_baud) => {
                let target = new_port.unwrap_or_else(|| port.to_string());
                manager.connect(&target, new_baud.unwrap_or(baud)).await;
            }
            MonitorCommand::Disconnect => manager.disconnect().await,
            MonitorCommand::Ports => {
                for p in manager.list_ports() {
                    println!("{}", format_port(&p));
                }
            }
            MonitorCommand::Quit => break,
            MonitorCommand::Invalid(msg) => eprintln!("{}", msg),
            MonitorCommand::Empty => {}
        }
    }
}

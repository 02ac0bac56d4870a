// src/io/simulated.rs
//
// In-memory stand-in for the bridge firmware, used by tests and by the
// monitor's --simulate mode.
//
// Behaviour follows the firmware:
//   CFG:Dn=v,...,An=v  -> updates monitor flags, replies CONFIG_UPDATED
//   other host lines   -> replies "<- <line>" (relayed downstream)
//   every report tick  -> STATUS:<enabled pins> (nothing if none enabled)
// Output lines end in \r\n like Serial.println.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Condvar, Mutex, MutexGuard,
};
use std::time::Duration;

use super::{BridgeError, LinkHandles, PortInfo, Transport};
use crate::protocol::config::CONFIG_PREFIX;
use crate::protocol::{ANALOG_CHANNELS, DIGITAL_CHANNELS};

/// Port name reported by the simulated transport unless told otherwise
pub const MOCK_PORT: &str = "MOCK_PORT";

/// Firmware status report interval
pub const REPORT_INTERVAL: Duration = Duration::from_millis(100);

/// Greeting the mock device sends every so often in autonomous mode
pub const MOCK_GREETING: &str = "Hello from Mock Device";

const DIGITAL: usize = DIGITAL_CHANNELS as usize;
const ANALOG: usize = ANALOG_CHANNELS as usize;

// ============================================================================
// Device Model
// ============================================================================

#[derive(Default)]
struct DeviceState {
    /// Device -> host bytes not yet read
    outgoing: VecDeque<u8>,
    /// Read errors to return before any further data
    read_faults: VecDeque<String>,
    unplugged: bool,
    /// Every chunk the host wrote, in order
    write_chunks: Vec<Vec<u8>>,
    write_fault: Option<String>,
    max_write_chunk: Option<usize>,
    /// Host bytes waiting for a newline
    rx_line: Vec<u8>,
    monitor_digital: [bool; DIGITAL],
    monitor_analog: [bool; ANALOG],
    digital: [u8; DIGITAL],
    analog: [u16; ANALOG],
}

impl DeviceState {
    fn println(&mut self, line: &str) {
        self.outgoing.extend(line.as_bytes());
        self.outgoing.extend(b"\r\n");
    }

    fn handle_host_line(&mut self, raw: &[u8]) {
        let line = String::from_utf8_lossy(raw).trim().to_string();
        if let Some(cfg) = line.strip_prefix(CONFIG_PREFIX) {
            self.apply_config(cfg);
            self.println("CONFIG_UPDATED");
        } else if !line.is_empty() {
            self.println("");
            self.println(&format!("<- {}", line));
        }
    }

    /// Firmware parser: unparseable numbers read as 0, so a bad value disables
    /// the pin and a bad index addresses pin 0.
    fn apply_config(&mut self, cfg: &str) {
        for pair in cfg.split(',') {
            let Some((pin, value)) = pair.split_once('=') else {
                continue;
            };
            let enabled = value.trim().parse::<i32>().unwrap_or(0) == 1;
            if let Some(index) = pin.strip_prefix('D') {
                let p = index.trim().parse::<i32>().unwrap_or(0);
                if (0..DIGITAL as i32).contains(&p) {
                    self.monitor_digital[p as usize] = enabled;
                }
            } else if let Some(index) = pin.strip_prefix('A') {
                let p = index.trim().parse::<i32>().unwrap_or(0);
                if (0..ANALOG as i32).contains(&p) {
                    self.monitor_analog[p as usize] = enabled;
                }
            }
        }
    }

    fn status_line(&self) -> Option<String> {
        let digital = (0..DIGITAL)
            .filter(|&i| self.monitor_digital[i])
            .map(|i| format!("D{}:{}", i, self.digital[i]));
        let analog = (0..ANALOG)
            .filter(|&i| self.monitor_analog[i])
            .map(|i| format!("A{}:{}", i, self.analog[i]));
        let parts: Vec<String> = digital.chain(analog).collect();
        if parts.is_empty() {
            None
        } else {
            Some(format!("STATUS:{}", parts.join(",")))
        }
    }
}

/// Shared state of the simulated bridge. Tests hold an `Arc` to drive it.
#[derive(Default)]
pub struct SimulatedDevice {
    state: Mutex<DeviceState>,
    data_ready: Condvar,
}

impl SimulatedDevice {
    fn lock(&self) -> MutexGuard<'_, DeviceState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Queue raw bytes as if the device had sent them.
    pub fn inject(&self, bytes: &[u8]) {
        self.lock().outgoing.extend(bytes);
        self.data_ready.notify_all();
    }

    /// Make the next read fail once with `reason`.
    pub fn inject_fault(&self, reason: &str) {
        self.lock().read_faults.push_back(reason.to_string());
        self.data_ready.notify_all();
    }

    /// While unplugged every read fails.
    pub fn set_unplugged(&self, unplugged: bool) {
        self.lock().unplugged = unplugged;
        self.data_ready.notify_all();
    }

    /// Make the next write fail with `reason`.
    pub fn fail_next_write(&self, reason: &str) {
        self.lock().write_fault = Some(reason.to_string());
    }

    /// Accept at most `max` bytes per write call.
    pub fn set_max_write_chunk(&self, max: usize) {
        self.lock().max_write_chunk = Some(max.max(1));
    }

    /// Every write call's bytes, in order
    pub fn write_chunks(&self) -> Vec<Vec<u8>> {
        self.lock().write_chunks.clone()
    }

    /// Everything the host wrote, concatenated
    pub fn written(&self) -> Vec<u8> {
        self.lock().write_chunks.concat()
    }

    /// Currently monitored (digital, analog) pins
    pub fn monitored(&self) -> (Vec<u8>, Vec<u8>) {
        let state = self.lock();
        let digital = (0..DIGITAL as u8)
            .filter(|&i| state.monitor_digital[i as usize])
            .collect();
        let analog = (0..ANALOG as u8)
            .filter(|&i| state.monitor_analog[i as usize])
            .collect();
        (digital, analog)
    }

    pub fn set_digital(&self, pin: u8, value: u8) {
        if let Some(slot) = self.lock().digital.get_mut(pin as usize) {
            *slot = value;
        }
    }

    pub fn set_analog(&self, pin: u8, value: u16) {
        if let Some(slot) = self.lock().analog.get_mut(pin as usize) {
            *slot = value.min(1023);
        }
    }

    /// Emit one status report, as the firmware does every report interval.
    pub fn tick(&self) {
        let mut state = self.lock();
        if let Some(line) = state.status_line() {
            state.println(&line);
            drop(state);
            self.data_ready.notify_all();
        }
    }

    /// Animate pins and report on the firmware's schedule until `stop` is set.
    /// Every 20th report is followed by a greeting line.
    pub fn spawn_autonomous(self: &Arc<Self>, stop: Arc<AtomicBool>) -> std::thread::JoinHandle<()> {
        let device = self.clone();
        std::thread::spawn(move || {
            let mut tick: u32 = 0;
            while !stop.load(Ordering::Relaxed) {
                std::thread::sleep(REPORT_INTERVAL);
                tick = tick.wrapping_add(1);
                {
                    let mut state = device.lock();
                    for pin in 0..DIGITAL {
                        state.digital[pin] = ((tick / (pin as u32 + 1)) % 2) as u8;
                    }
                    for pin in 0..ANALOG {
                        state.analog[pin] = ((tick * 37 + pin as u32 * 101) % 1024) as u16;
                    }
                }
                device.tick();
                if tick % 20 == 0 {
                    device.inject(format!("{}\r\n", MOCK_GREETING).as_bytes());
                }
            }
        })
    }

    fn read_into(&self, buf: &mut [u8], timeout: Duration) -> io::Result<usize> {
        let mut state = self.lock();
        if state.read_faults.is_empty() && !state.unplugged && state.outgoing.is_empty() {
            state = self
                .data_ready
                .wait_timeout(state, timeout)
                .map(|(guard, _)| guard)
                .unwrap_or_else(|p| p.into_inner().0);
        }

        if let Some(reason) = state.read_faults.pop_front() {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, reason));
        }
        if state.unplugged {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "device unplugged"));
        }
        if state.outgoing.is_empty() {
            return Err(io::Error::new(io::ErrorKind::TimedOut, "no data"));
        }

        let n = buf.len().min(state.outgoing.len());
        for (slot, byte) in buf.iter_mut().zip(state.outgoing.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }

    fn write_from(&self, buf: &[u8]) -> io::Result<usize> {
        let n = {
            let mut state = self.lock();
            if let Some(reason) = state.write_fault.take() {
                return Err(io::Error::new(io::ErrorKind::BrokenPipe, reason));
            }

            let n = state.max_write_chunk.map_or(buf.len(), |max| buf.len().min(max));
            let chunk = &buf[..n];
            state.write_chunks.push(chunk.to_vec());

            for &byte in chunk {
                if byte == b'\n' {
                    let line = std::mem::take(&mut state.rx_line);
                    state.handle_host_line(&line);
                } else {
                    state.rx_line.push(byte);
                }
            }
            n
        };
        self.data_ready.notify_all();
        // Give other writers a chance to get in between partial writes
        std::thread::yield_now();
        Ok(n)
    }
}

// ============================================================================
// Transport
// ============================================================================

struct SimReader {
    device: Arc<SimulatedDevice>,
    poll_interval: Duration,
}

impl Read for SimReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.device.read_into(buf, self.poll_interval)
    }
}

struct SimWriter {
    device: Arc<SimulatedDevice>,
}

impl Write for SimWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.device.write_from(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Transport exposing a single simulated bridge under one port name.
pub struct SimulatedTransport {
    port_name: String,
    device: Arc<SimulatedDevice>,
    fail_next_open: AtomicBool,
}

impl SimulatedTransport {
    pub fn new(port_name: impl Into<String>) -> Self {
        Self {
            port_name: port_name.into(),
            device: Arc::new(SimulatedDevice::default()),
            fail_next_open: AtomicBool::new(false),
        }
    }

    pub fn device(&self) -> Arc<SimulatedDevice> {
        self.device.clone()
    }

    /// Make the next open fail even for the right port name.
    pub fn fail_next_open(&self) {
        self.fail_next_open.store(true, Ordering::SeqCst);
    }
}

impl Default for SimulatedTransport {
    fn default() -> Self {
        SimulatedTransport::new(MOCK_PORT)
    }
}

impl Transport for SimulatedTransport {
    fn kind(&self) -> &'static str {
        "simulated"
    }

    fn list_ports(&self) -> Result<Vec<PortInfo>, BridgeError> {
        Ok(vec![PortInfo::named(self.port_name.clone(), "Simulated")])
    }

    fn open(
        &self,
        port: &str,
        _baud_rate: u32,
        poll_interval: Duration,
    ) -> Result<LinkHandles, BridgeError> {
        if port != self.port_name {
            return Err(BridgeError::connection(port, "No such device"));
        }
        if self.fail_next_open.swap(false, Ordering::SeqCst) {
            return Err(BridgeError::connection(port, "Device or resource busy"));
        }

        Ok(LinkHandles {
            reader: Box::new(SimReader {
                device: self.device.clone(),
                poll_interval,
            }),
            writer: Box::new(SimWriter {
                device: self.device.clone(),
            }),
        })
    }
}

// ============================================================================
// Tests
// ============================================================================

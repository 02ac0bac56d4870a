// src/io/link.rs
//
// Link manager: owns the serial connection lifecycle, the write path and the
// background read loop that frames, classifies and publishes incoming lines.
//
// Concurrency:
// - connect/disconnect serialize on an async lifecycle lock
// - the read loop runs on the blocking pool and is the only reader
// - send() writes through a separate handle behind a std Mutex, so lines
//   from concurrent callers never interleave on the wire
// - disconnect() sets the cancel flag and awaits the loop before the write
//   handle is dropped
// - the read loop never blocks on a full event queue past cancellation, and
//   lifecycle events wait for queue space off the async workers

use serde::Serialize;
use std::collections::BTreeSet;
use std::io::{ErrorKind, Read, Write};
use std::sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering},
    Arc, Mutex, RwLock,
};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

use super::framer::{LineFrame, LineFramer, DEFAULT_MAX_LINE_LENGTH, LINE_TERMINATOR};
use super::{BridgeError, ConnectionState, PortInfo, Transport, DEFAULT_BAUD_RATE};
use crate::events::{BridgeEvent, EventHub, EventListener, ListenerId};
use crate::protocol::{
    build_config_command, classify_line, out_of_range_channels, ClassifiedEvent, Origin,
};

// ============================================================================
// Types and Configuration
// ============================================================================

/// Read loop tuning
#[derive(Clone, Debug, PartialEq)]
pub struct LinkOptions {
    /// Upper bound on how long a read blocks before cancellation is checked
    pub poll_interval: Duration,
    /// Pause after a read fault before reading again
    pub fault_backoff: Duration,
    /// Longest line held while waiting for a terminator
    pub max_line_length: usize,
}

impl Default for LinkOptions {
    fn default() -> Self {
        LinkOptions {
            poll_interval: Duration::from_millis(50),
            fault_backoff: Duration::from_millis(100),
            max_line_length: DEFAULT_MAX_LINE_LENGTH,
        }
    }
}

/// What happened to a `send`. Purely informational; send never fails loudly.
#[derive(Clone, Debug, PartialEq)]
pub enum TransmitOutcome {
    Sent,
    NotConnected,
    Failed(String),
}

/// Read loop start/stop counters
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize)]
pub struct LoopStats {
    pub started: usize,
    pub stopped: usize,
    pub active: usize,
    /// Highest number of loops ever seen running at once (must stay <= 1)
    pub max_concurrent: usize,
}

#[derive(Default)]
struct LoopCounters {
    started: AtomicUsize,
    stopped: AtomicUsize,
    active: AtomicUsize,
    max_concurrent: AtomicUsize,
}

impl LoopCounters {
    fn loop_started(&self) {
        let previous = self.active.fetch_add(1, Ordering::SeqCst);
        debug_assert_eq!(previous, 0, "a second read loop started on the same link manager");
        self.max_concurrent.fetch_max(previous + 1, Ordering::SeqCst);
        self.started.fetch_add(1, Ordering::SeqCst);
    }

    fn loop_stopped(&self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
        self.stopped.fetch_add(1, Ordering::SeqCst);
    }

    fn snapshot(&self) -> LoopStats {
        LoopStats {
            started: self.started.load(Ordering::SeqCst),
            stopped: self.stopped.load(Ordering::SeqCst),
            active: self.active.load(Ordering::SeqCst),
            max_concurrent: self.max_concurrent.load(Ordering::SeqCst),
        }
    }
}

struct LinkWriter {
    port: String,
    inner: Box<dyn Write + Send>,
}

struct ActiveLink {
    port: String,
    cancel_flag: Arc<AtomicBool>,
    task_handle: tokio::task::JoinHandle<()>,
}

// ============================================================================
// Link Manager
// ============================================================================

/// Owns at most one serial connection and its read loop.
///
/// All methods take `&self`; wrap in an `Arc` to share between the tasks that
/// drive the UI or server layer.
pub struct LinkManager {
    transport: Arc<dyn Transport>,
    options: LinkOptions,
    hub: EventHub,
    state: Arc<RwLock<ConnectionState>>,
    lifecycle: tokio::sync::Mutex<Option<ActiveLink>>,
    writer: Arc<Mutex<Option<LinkWriter>>>,
    counters: Arc<LoopCounters>,
}

impl LinkManager {
    pub fn new(transport: Arc<dyn Transport>, options: LinkOptions, hub: EventHub) -> Self {
        Self {
            transport,
            options,
            hub,
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            lifecycle: tokio::sync::Mutex::new(None),
            writer: Arc::new(Mutex::new(None)),
            counters: Arc::new(LoopCounters::default()),
        }
    }

    /// Enumerate ports. Enumeration failures are logged and reported as an
    /// empty list.
    pub fn list_ports(&self) -> Vec<PortInfo> {
        match self.transport.list_ports() {
            Ok(ports) => ports,
            Err(e) => {
                self.hub.log(e.to_string());
                Vec::new()
            }
        }
    }

    /// Connect at the firmware's default baud rate.
    pub async fn connect_default(&self, port: &str) -> bool {
        self.connect(port, DEFAULT_BAUD_RATE).await
    }

    /// Open `port` and start the read loop. Any existing connection is torn
    /// down first. Returns false (and logs why) if the port can't be opened.
    pub async fn connect(&self, port: &str, baud_rate: u32) -> bool {
        let mut active = self.lifecycle.lock().await;
        self.teardown(&mut active).await;

        self.set_state(ConnectionState::Connecting).await;

        let transport = self.transport.clone();
        let port_name = port.to_string();
        let poll_interval = self.options.poll_interval;
        let opened = tokio::task::spawn_blocking(move || {
            transport.open(&port_name, baud_rate, poll_interval)
        })
        .await
        .unwrap_or_else(|e| Err(BridgeError::connection(port, format!("open task failed: {}", e))));

        let handles = match opened {
            Ok(handles) => handles,
            Err(e) => {
                self.set_state(ConnectionState::Error(e.to_string())).await;
                self.announce(format!("Error connecting: {}", e)).await;
                return false;
            }
        };

        {
            let mut writer = self.writer.lock().unwrap_or_else(|p| p.into_inner());
            *writer = Some(LinkWriter {
                port: port.to_string(),
                inner: handles.writer,
            });
        }

        self.set_state(ConnectionState::Connected).await;
        self.announce(format!(
            "Connected to {} at {} baud ({})",
            port,
            baud_rate,
            self.transport.kind()
        ))
        .await;

        let cancel_flag = Arc::new(AtomicBool::new(false));
        let read_loop = ReadLoop {
            port: port.to_string(),
            reader: handles.reader,
            cancel_flag: cancel_flag.clone(),
            hub: self.hub.clone(),
            counters: self.counters.clone(),
            options: self.options.clone(),
        };
        let task_handle = tokio::task::spawn_blocking(move || read_loop.run());

        *active = Some(ActiveLink {
            port: port.to_string(),
            cancel_flag,
            task_handle,
        });
        true
    }

    /// Stop the read loop, close the port and go to Disconnected.
    /// Does nothing when there is no connection.
    pub async fn disconnect(&self) {
        let mut active = self.lifecycle.lock().await;
        if !self.teardown(&mut active).await {
            // A failed connect leaves Error behind; clear it quietly
            if matches!(self.state(), ConnectionState::Error(_)) {
                self.set_state(ConnectionState::Disconnected).await;
            }
        }
    }

    /// Write `line` plus the protocol terminator. Failures are logged, never
    /// raised; the outcome is returned for callers that want it.
    pub fn send(&self, line: &str) -> TransmitOutcome {
        let mut data = Vec::with_capacity(line.len() + 1);
        data.extend_from_slice(line.as_bytes());
        data.push(LINE_TERMINATOR);

        let result = {
            let mut guard = self.writer.lock().unwrap_or_else(|p| p.into_inner());
            match guard.as_mut() {
                None => None,
                Some(writer) => Some(
                    writer
                        .inner
                        .write_all(&data)
                        .and_then(|_| writer.inner.flush())
                        .map_err(|e| BridgeError::write(&writer.port, e.to_string())),
                ),
            }
        };

        match result {
            None => {
                self.hub
                    .log(format!("{}, dropped outgoing line: {}", BridgeError::NotConnected, line));
                TransmitOutcome::NotConnected
            }
            Some(Ok(())) => {
                self.hub.publish(BridgeEvent::message(Origin::Host, line));
                TransmitOutcome::Sent
            }
            Some(Err(e)) => {
                self.hub.log(e.to_string());
                TransmitOutcome::Failed(e.to_string())
            }
        }
    }

    /// Push the full pin monitoring state to the firmware. Channels outside
    /// D0..D13 / A0..A5 are ignored with a log line.
    pub fn send_config(&self, digital: &BTreeSet<u8>, analog: &BTreeSet<u8>) -> TransmitOutcome {
        let ignored = out_of_range_channels(digital, analog);
        if !ignored.is_empty() {
            self.hub
                .log(format!("Ignoring unknown channels in config: {}", ignored.join(", ")));
        }
        self.send(&build_config_command(digital, analog))
    }

    pub fn state(&self) -> ConnectionState {
        self.state
            .read()
            .map(|s| s.clone())
            .unwrap_or_else(|p| p.into_inner().clone())
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Port of the current connection, if any
    pub fn port(&self) -> Option<String> {
        let guard = self.writer.lock().unwrap_or_else(|p| p.into_inner());
        guard.as_ref().map(|w| w.port.clone())
    }

    pub fn loop_stats(&self) -> LoopStats {
        self.counters.snapshot()
    }

    pub fn events(&self) -> &EventHub {
        &self.hub
    }

    pub fn subscribe(&self, listener: Arc<dyn EventListener>) -> ListenerId {
        self.hub.subscribe(listener)
    }

    pub fn subscribe_channel(&self, capacity: usize) -> (ListenerId, mpsc::Receiver<BridgeEvent>) {
        self.hub.subscribe_channel(capacity)
    }

    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        self.hub.unsubscribe(id)
    }

    /// Returns true if there was a link to tear down.
    async fn teardown(&self, active: &mut Option<ActiveLink>) -> bool {
        let Some(link) = active.take() else {
            return false;
        };

        link.cancel_flag.store(true, Ordering::SeqCst);
        if let Err(e) = link.task_handle.await {
            tlog!("[link] Read loop for {} ended abnormally: {:?}", link.port, e);
        }

        {
            let mut writer = self.writer.lock().unwrap_or_else(|p| p.into_inner());
            *writer = None;
        }

        self.set_state(ConnectionState::Disconnected).await;
        self.announce(format!("Disconnected from {}", link.port)).await;
        true
    }

    async fn set_state(&self, current: ConnectionState) {
        let previous = {
            let mut state = self.state.write().unwrap_or_else(|p| p.into_inner());
            if *state == current {
                return;
            }
            std::mem::replace(&mut *state, current.clone())
        };
        self.emit(BridgeEvent::State { previous, current }).await;
    }

    async fn announce(&self, text: String) {
        tlog!("[bridge] {}", text);
        self.emit(BridgeEvent::log(text)).await;
    }

    /// Publish from async context. A full queue is waited out on the
    /// blocking pool so a slow listener never stalls a runtime worker.
    async fn emit(&self, event: BridgeEvent) {
        if let Err(event) = self.hub.try_publish(event) {
            let hub = self.hub.clone();
            if let Err(e) = tokio::task::spawn_blocking(move || hub.publish(event)).await {
                tlog!("[link] Event publish task failed: {:?}", e);
            }
        }
    }
}

impl Drop for LinkManager {
    fn drop(&mut self) {
        // Can't await here; make sure a still-running loop winds down on its own
        if let Some(link) = self.lifecycle.get_mut().as_ref() {
            link.cancel_flag.store(true, Ordering::SeqCst);
        }
    }
}

// ============================================================================
// Read Loop
// ============================================================================

struct ReadLoop {
    port: String,
    reader: Box<dyn Read + Send>,
    cancel_flag: Arc<AtomicBool>,
    hub: EventHub,
    counters: Arc<LoopCounters>,
    options: LinkOptions,
}

impl ReadLoop {
    fn run(mut self) {
        self.counters.loop_started();
        tlog!("[link] Read loop started on {}", self.port);

        let mut framer = LineFramer::new(self.options.max_line_length);
        let mut buf = [0u8; 256];

        while !self.cancel_flag.load(Ordering::SeqCst) {
            match self.reader.read(&mut buf) {
                Ok(0) => self.fault(BridgeError::read(&self.port, "end of stream")),
                Ok(n) => {
                    for frame in framer.feed(&buf[..n]) {
                        self.dispatch(&frame);
                    }
                }
                Err(ref e)
                    if matches!(
                        e.kind(),
                        ErrorKind::TimedOut | ErrorKind::WouldBlock | ErrorKind::Interrupted
                    ) => {}
                Err(e) => self.fault(BridgeError::read(&self.port, e.to_string())),
            }
        }

        let dropped = framer.discard();
        if dropped > 0 {
            tlog!(
                "[link] Discarded {} bytes of unterminated input on {}",
                dropped,
                self.port
            );
        }
        tlog!("[link] Read loop stopped on {}", self.port);
        self.counters.loop_stopped();
    }

    fn dispatch(&self, frame: &LineFrame) {
        if frame.incomplete {
            tlog!(
                "[link] Line on {} exceeded {} bytes and was split",
                self.port,
                self.options.max_line_length
            );
        }

        match classify_line(&frame.text()) {
            Some(ClassifiedEvent::Status(channels)) => self.emit(BridgeEvent::status(channels)),
            Some(ClassifiedEvent::Message { origin, content }) => {
                self.emit(BridgeEvent::message(origin, content))
            }
            None => {}
        }
    }

    /// Publish, waiting for queue space only until the link is cancelled.
    fn emit(&self, event: BridgeEvent) {
        let retry = self.options.poll_interval;
        if !self.hub.publish_unless(event, &self.cancel_flag, retry) {
            tlog!("[link] Event queue full at disconnect of {}, event dropped", self.port);
        }
    }

    /// Log the fault and back off, waking every poll interval to check for
    /// cancellation.
    fn fault(&self, error: BridgeError) {
        tlog!("[bridge] {}", error);
        self.emit(BridgeEvent::log(error.to_string()));

        let deadline = Instant::now() + self.options.fault_backoff;
        while !self.cancel_flag.load(Ordering::SeqCst) {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            std::thread::sleep(self.options.poll_interval.min(deadline - now));
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::tests::RecordingListener;
    use crate::io::{LinkHandles, SimulatedDevice, SimulatedTransport};
    use crate::protocol::StatusSnapshot;
    use std::sync::{OnceLock, Weak};

    const PORT: &str = "MOCK_PORT";

    fn fast_options() -> LinkOptions {
        LinkOptions {
            poll_interval: Duration::from_millis(10),
            fault_backoff: Duration::from_millis(20),
            max_line_length: 64,
        }
    }

    fn setup() -> (Arc<LinkManager>, Arc<SimulatedDevice>, Arc<RecordingListener>) {
        let transport = SimulatedTransport::new(PORT);
        let device = transport.device();
        let manager = Arc::new(LinkManager::new(
            Arc::new(transport),
            fast_options(),
            EventHub::new(256),
        ));
        let recorder = Arc::new(RecordingListener::default());
        manager.subscribe(recorder.clone());
        (manager, device, recorder)
    }

    /// Poll until `check` passes or two seconds elapse.
    async fn wait_for(manager: &LinkManager, mut check: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(2);
        loop {
            manager.events().flush();
            if check() {
                return;
            }
            assert!(Instant::now() < deadline, "condition not met in time");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn test_connect_and_disconnect() {
        let (manager, _device, recorder) = setup();

        assert!(manager.connect_default(PORT).await);
        assert!(manager.is_connected());
        assert_eq!(manager.port().as_deref(), Some(PORT));

        manager.disconnect().await;
        manager.events().flush();

        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert_eq!(manager.port(), None);
        let stats = manager.loop_stats();
        assert_eq!(stats.started, 1);
        assert_eq!(stats.stopped, 1);
        assert_eq!(stats.active, 0);

        let logs = recorder.logs();
        assert!(logs.iter().any(|l| l.starts_with("Connected to MOCK_PORT at 9600 baud")));
        assert!(logs.iter().any(|l| l == "Disconnected from MOCK_PORT"));
        assert_eq!(
            recorder.states(),
            vec![
                ConnectionState::Connecting,
                ConnectionState::Connected,
                ConnectionState::Disconnected
            ]
        );
    }

    #[tokio::test]
    async fn test_connect_failure_reports_error() {
        let (manager, _device, recorder) = setup();

        assert!(!manager.connect("/dev/does-not-exist", 9600).await);
        manager.events().flush();

        assert!(matches!(manager.state(), ConnectionState::Error(_)));
        assert!(recorder
            .logs()
            .iter()
            .any(|l| l.starts_with("Error connecting: Failed to open /dev/does-not-exist")));
        assert_eq!(manager.loop_stats().started, 0);

        // A quiet disconnect clears the error without a log line
        let logs_before = recorder.logs().len();
        manager.disconnect().await;
        manager.events().flush();
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert_eq!(recorder.logs().len(), logs_before);
    }

    #[tokio::test]
    async fn test_double_disconnect_is_noop() {
        let (manager, _device, recorder) = setup();
        assert!(manager.connect_default(PORT).await);

        manager.disconnect().await;
        manager.disconnect().await;
        manager.events().flush();

        let disconnect_logs = recorder
            .logs()
            .iter()
            .filter(|l| l.starts_with("Disconnected"))
            .count();
        assert_eq!(disconnect_logs, 1);
        assert_eq!(manager.loop_stats().stopped, 1);
    }

    #[tokio::test]
    async fn test_disconnect_when_never_connected() {
        let (manager, _device, recorder) = setup();
        manager.disconnect().await;
        manager.events().flush();
        assert!(recorder.logs().is_empty());
        assert!(recorder.states().is_empty());
    }

    #[tokio::test]
    async fn test_reconnect_never_runs_two_loops() {
        let (manager, _device, _recorder) = setup();

        for _ in 0..5 {
            assert!(manager.connect_default(PORT).await);
        }
        manager.disconnect().await;

        let stats = manager.loop_stats();
        assert_eq!(stats.started, 5);
        assert_eq!(stats.stopped, 5);
        assert_eq!(stats.active, 0);
        assert_eq!(stats.max_concurrent, 1);
    }

    #[tokio::test]
    async fn test_disconnect_is_prompt() {
        let (manager, _device, _recorder) = setup();
        assert!(manager.connect_default(PORT).await);

        let started = Instant::now();
        manager.disconnect().await;
        assert!(started.elapsed() < Duration::from_millis(200));
    }

    #[tokio::test]
    async fn test_incoming_lines_are_classified() {
        let (manager, device, recorder) = setup();
        assert!(manager.connect_default(PORT).await);

        device.inject(b"Hello from Mock Device\r\n<- hello\r\nSTATUS:D2:1,D3:0,A0:512\r\n");
        device.inject(b"STATUS:D2:1,D3:\r\n\r\n");

        wait_for(&manager, || recorder.messages().len() >= 2 && !recorder.statuses().is_empty())
            .await;
        manager.disconnect().await;

        assert_eq!(
            recorder.messages(),
            vec![
                (Origin::DeviceToHost, "Hello from Mock Device".to_string()),
                (Origin::BridgeToDevice, "hello".to_string()),
            ]
        );
        let mut expected = StatusSnapshot::new();
        expected.insert("D2".to_string(), 1);
        expected.insert("D3".to_string(), 0);
        expected.insert("A0".to_string(), 512);
        // The malformed status line is dropped, not reported
        assert_eq!(recorder.statuses(), vec![expected]);
    }

    #[tokio::test]
    async fn test_partial_line_reassembled_across_reads() {
        let (manager, device, recorder) = setup();
        assert!(manager.connect_default(PORT).await);

        device.inject(b"STATUS:D");
        tokio::time::sleep(Duration::from_millis(30)).await;
        device.inject(b"2:1\n");

        wait_for(&manager, || !recorder.statuses().is_empty()).await;
        manager.disconnect().await;
        assert_eq!(recorder.statuses()[0]["D2"], 1);
    }

    #[tokio::test]
    async fn test_read_fault_is_logged_and_loop_continues() {
        let (manager, device, recorder) = setup();
        assert!(manager.connect_default(PORT).await);

        device.inject(b"before ");
        device.inject_fault("device unplugged");
        device.inject(b"fault\n");

        wait_for(&manager, || !recorder.messages().is_empty()).await;
        manager.disconnect().await;

        assert!(recorder
            .logs()
            .iter()
            .any(|l| l == "Read error on MOCK_PORT: device unplugged"));
        // The partial line survives the fault
        assert_eq!(
            recorder.messages(),
            vec![(Origin::DeviceToHost, "before fault".to_string())]
        );
        assert_eq!(manager.loop_stats().started, 1);
    }

    #[tokio::test]
    async fn test_sustained_fault_repeats_until_disconnect() {
        let (manager, device, recorder) = setup();
        assert!(manager.connect_default(PORT).await);

        device.set_unplugged(true);
        wait_for(&manager, || {
            recorder.logs().iter().filter(|l| l.starts_with("Read error")).count() >= 3
        })
        .await;
        assert!(manager.is_connected());

        let started = Instant::now();
        manager.disconnect().await;
        assert!(started.elapsed() < Duration::from_millis(200));
        assert_eq!(manager.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_send_echoes_host_message_and_writes_line() {
        let (manager, device, recorder) = setup();
        assert!(manager.connect_default(PORT).await);

        assert_eq!(manager.send("ping"), TransmitOutcome::Sent);
        wait_for(&manager, || recorder.messages().len() >= 2).await;
        manager.disconnect().await;

        assert_eq!(device.written(), b"ping\n".to_vec());
        let messages = recorder.messages();
        assert_eq!(messages.len(), 2);
        assert!(messages.contains(&(Origin::Host, "ping".to_string())));
        // The firmware relays the line and reports it back
        assert!(messages.contains(&(Origin::BridgeToDevice, "ping".to_string())));
    }

    #[tokio::test]
    async fn test_send_when_disconnected_is_logged() {
        let (manager, device, recorder) = setup();

        assert_eq!(manager.send("ping"), TransmitOutcome::NotConnected);
        manager.events().flush();

        assert!(device.written().is_empty());
        assert!(recorder.messages().is_empty());
        assert!(recorder.logs()[0].starts_with("Not connected"));
    }

    #[tokio::test]
    async fn test_write_failure_is_logged_not_raised() {
        let (manager, device, recorder) = setup();
        assert!(manager.connect_default(PORT).await);

        device.fail_next_write("broken pipe");
        match manager.send("ping") {
            TransmitOutcome::Failed(reason) => assert!(reason.contains("broken pipe")),
            other => panic!("Expected failure, got {:?}", other),
        }
        assert_eq!(manager.send("pong"), TransmitOutcome::Sent);
        manager.disconnect().await;
        manager.events().flush();

        assert!(recorder
            .logs()
            .iter()
            .any(|l| l.starts_with("Write error on MOCK_PORT")));
        assert!(!recorder.messages().contains(&(Origin::Host, "ping".to_string())));
        assert!(recorder.messages().contains(&(Origin::Host, "pong".to_string())));
    }

    #[tokio::test]
    async fn test_send_config_wire_format() {
        let (manager, device, _recorder) = setup();
        assert!(manager.connect_default(PORT).await);

        let digital: BTreeSet<u8> = [2, 3].into_iter().collect();
        let analog: BTreeSet<u8> = [0].into_iter().collect();
        assert_eq!(manager.send_config(&digital, &analog), TransmitOutcome::Sent);
        manager.disconnect().await;

        let written = String::from_utf8(device.written()).unwrap();
        assert_eq!(
            written,
            "CFG:D0=0,D1=0,D2=1,D3=1,D4=0,D5=0,D6=0,D7=0,D8=0,D9=0,D10=0,D11=0,D12=0,D13=0,\
             A0=1,A1=0,A2=0,A3=0,A4=0,A5=0\n"
        );
        assert_eq!(device.monitored(), (vec![2, 3], vec![0]));
    }

    #[tokio::test]
    async fn test_config_then_status_round_trip_through_firmware() {
        let (manager, device, recorder) = setup();
        assert!(manager.connect_default(PORT).await);

        manager.send_config(&[2].into_iter().collect(), &[0].into_iter().collect());
        wait_for(&manager, || {
            recorder
                .messages()
                .contains(&(Origin::DeviceToHost, "CONFIG_UPDATED".to_string()))
        })
        .await;

        device.set_digital(2, 1);
        device.set_analog(0, 700);
        device.tick();
        wait_for(&manager, || !recorder.statuses().is_empty()).await;
        manager.disconnect().await;

        let status = &recorder.statuses()[0];
        assert_eq!(status.len(), 2);
        assert_eq!(status["D2"], 1);
        assert_eq!(status["A0"], 700);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_sends_never_interleave() {
        let (manager, device, _recorder) = setup();
        // Force many partial writes per line
        device.set_max_write_chunk(3);
        assert!(manager.connect_default(PORT).await);

        let mut threads = Vec::new();
        for sender in 0..4 {
            let manager = manager.clone();
            threads.push(std::thread::spawn(move || {
                for i in 0..25 {
                    manager.send(&format!("sender{}-line{}-payload", sender, i));
                }
            }));
        }
        for t in threads {
            t.join().unwrap();
        }
        manager.disconnect().await;

        let written = String::from_utf8(device.written()).unwrap();
        let lines: Vec<&str> = written.lines().collect();
        assert_eq!(lines.len(), 100);
        for line in &lines {
            let parts: Vec<&str> = line.split('-').collect();
            assert_eq!(parts.len(), 3, "interleaved line: {:?}", line);
            assert!(parts[0].starts_with("sender"));
            assert!(parts[1].starts_with("line"));
            assert_eq!(parts[2], "payload");
        }
        // Chunking really happened
        assert!(device.write_chunks().iter().all(|c| c.len() <= 3));
    }

    #[tokio::test]
    async fn test_list_ports() {
        let (manager, _device, _recorder) = setup();
        let ports = manager.list_ports();
        assert_eq!(ports.len(), 1);
        assert_eq!(ports[0].port_name, PORT);
    }

    #[tokio::test]
    async fn test_connect_while_connected_switches_cleanly() {
        let (manager, device, recorder) = setup();
        assert!(manager.connect_default(PORT).await);
        assert!(manager.connect(PORT, 115200).await);
        manager.events().flush();

        let logs = recorder.logs();
        let disconnected = logs.iter().position(|l| l == "Disconnected from MOCK_PORT");
        let second_connect = logs.iter().rposition(|l| l.contains("115200 baud"));
        assert!(disconnected.is_some());
        assert!(disconnected < second_connect);

        device.inject(b"still here\n");
        wait_for(&manager, || !recorder.messages().is_empty()).await;
        manager.disconnect().await;

        // Exactly one loop saw the line
        assert_eq!(
            recorder.messages(),
            vec![(Origin::DeviceToHost, "still here".to_string())]
        );
        assert_eq!(manager.loop_stats().max_concurrent, 1);
    }

    #[tokio::test]
    async fn test_overlong_line_is_split() {
        let (manager, device, recorder) = setup();
        assert!(manager.connect_default(PORT).await);

        let long = "x".repeat(100);
        device.inject(format!("{}\n", long).as_bytes());
        wait_for(&manager, || recorder.messages().len() >= 2).await;
        manager.disconnect().await;

        let joined: String = recorder.messages().into_iter().map(|(_, c)| c).collect();
        assert_eq!(joined, long);
    }

    /// Transport whose enumeration always fails
    struct NoEnumeration;

    impl Transport for NoEnumeration {
        fn kind(&self) -> &'static str {
            "broken"
        }

        fn list_ports(&self) -> Result<Vec<PortInfo>, BridgeError> {
            Err(BridgeError::Enumeration("permission denied".to_string()))
        }

        fn open(&self, port: &str, _baud_rate: u32, _poll: Duration) -> Result<LinkHandles, BridgeError> {
            Err(BridgeError::connection(port, "unsupported"))
        }
    }

    #[tokio::test]
    async fn test_list_ports_failure_is_empty_list_and_log() {
        let manager = LinkManager::new(Arc::new(NoEnumeration), fast_options(), EventHub::new(16));
        let recorder = Arc::new(RecordingListener::default());
        manager.subscribe(recorder.clone());

        assert!(manager.list_ports().is_empty());
        manager.events().flush();

        assert_eq!(
            recorder.logs(),
            vec!["Failed to enumerate ports: permission denied".to_string()]
        );
    }

    /// Answers every device line with "ack" from inside the callback
    #[derive(Default)]
    struct AutoReply {
        manager: OnceLock<Weak<LinkManager>>,
        replies: AtomicUsize,
    }

    impl EventListener for AutoReply {
        fn on_message(&self, origin: Origin, _content: &str, _timestamp_us: u64) {
            if origin != Origin::DeviceToHost {
                return;
            }
            if let Some(manager) = self.manager.get().and_then(Weak::upgrade) {
                if manager.send("ack") == TransmitOutcome::Sent {
                    self.replies.fetch_add(1, Ordering::SeqCst);
                }
            }
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_listener_replying_from_callback_does_not_wedge_disconnect() {
        let transport = SimulatedTransport::new(PORT);
        let device = transport.device();
        let manager = Arc::new(LinkManager::new(
            Arc::new(transport),
            fast_options(),
            EventHub::new(4),
        ));
        let replier = Arc::new(AutoReply::default());
        let _ = replier.manager.set(Arc::downgrade(&manager));
        manager.subscribe(replier.clone());

        assert!(manager.connect_default(PORT).await);
        for i in 0..200 {
            device.inject(format!("line {}\r\n", i).as_bytes());
        }
        let deadline = Instant::now() + Duration::from_secs(2);
        while replier.replies.load(Ordering::SeqCst) < 20 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let finished = tokio::time::timeout(Duration::from_secs(3), manager.disconnect()).await;
        assert!(finished.is_ok(), "disconnect did not return");
        manager.events().flush();

        assert!(replier.replies.load(Ordering::SeqCst) >= 20);
        assert!(String::from_utf8_lossy(&device.written()).contains("ack\n"));
        assert_eq!(manager.state(), ConnectionState::Disconnected);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_slow_listener_does_not_delay_disconnect() {
        struct Sluggish;
        impl EventListener for Sluggish {
            fn on_message(&self, _origin: Origin, _content: &str, _timestamp_us: u64) {
                std::thread::sleep(Duration::from_millis(20));
            }
        }

        let transport = SimulatedTransport::new(PORT);
        let device = transport.device();
        let manager = LinkManager::new(Arc::new(transport), fast_options(), EventHub::new(4));
        manager.subscribe(Arc::new(Sluggish));

        assert!(manager.connect_default(PORT).await);
        for i in 0..200 {
            device.inject(format!("line {}\n", i).as_bytes());
        }
        // Let the queue fill and the read loop block on it
        tokio::time::sleep(Duration::from_millis(100)).await;

        let started = Instant::now();
        manager.disconnect().await;
        assert!(
            started.elapsed() < Duration::from_secs(1),
            "disconnect took {:?}",
            started.elapsed()
        );
        assert_eq!(manager.loop_stats().active, 0);
    }
}

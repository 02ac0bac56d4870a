// src/events.rs
//
// Event fan-out from the serial bridge to its observers.
//
// Publishers (the read loop, send, lifecycle changes) push onto a bounded
// queue. A single dispatch thread drains it and invokes subscribers in
// subscription order, so listener callbacks never run on the read loop.
// A slow listener delays the others and, once the queue is full, blocks the
// publisher rather than dropping events. Publishes made from inside a
// callback bypass the queue and are delivered right after the current event,
// so listeners may call back into the bridge.

use serde::Serialize;
use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc as std_mpsc;
use std::sync::{Arc, Mutex, RwLock};
use std::thread::ThreadId;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::io::{now_us, ConnectionState};
use crate::protocol::{Origin, StatusSnapshot};

/// Default capacity of the publish queue
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

// ============================================================================
// Event Types
// ============================================================================

/// Event delivered to subscribers. Serializes with a `type` tag so a push
/// layer can forward it verbatim.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BridgeEvent {
    /// A line sent by the host or received from the device
    Message {
        origin: Origin,
        content: String,
        timestamp_us: u64,
    },
    /// A parsed status report
    Status {
        channels: StatusSnapshot,
        timestamp_us: u64,
    },
    /// Human-readable lifecycle or fault message
    Log { text: String, timestamp_us: u64 },
    /// Connection state transition
    State {
        previous: ConnectionState,
        current: ConnectionState,
    },
}

impl BridgeEvent {
    pub fn message(origin: Origin, content: impl Into<String>) -> Self {
        BridgeEvent::Message {
            origin,
            content: content.into(),
            timestamp_us: now_us(),
        }
    }

    pub fn status(channels: StatusSnapshot) -> Self {
        BridgeEvent::Status {
            channels,
            timestamp_us: now_us(),
        }
    }

    pub fn log(text: impl Into<String>) -> Self {
        BridgeEvent::Log {
            text: text.into(),
            timestamp_us: now_us(),
        }
    }
}

/// Callback interface for observers. Every method has an empty default so
/// implementors only override what they care about.
///
/// Called from the hub's dispatch thread. Blocking here stalls delivery to
/// every other listener.
pub trait EventListener: Send + Sync {
    fn on_message(&self, _origin: Origin, _content: &str, _timestamp_us: u64) {}
    fn on_status(&self, _status: &StatusSnapshot) {}
    fn on_log(&self, _text: &str) {}
    fn on_state(&self, _previous: &ConnectionState, _current: &ConnectionState) {}
}

/// Handle returned by `subscribe`, used to unsubscribe.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

// ============================================================================
// Event Hub
// ============================================================================

#[derive(Clone)]
enum Subscriber {
    Listener(Arc<dyn EventListener>),
    Channel(mpsc::Sender<BridgeEvent>),
}

type SubscriberList = Arc<RwLock<Vec<(ListenerId, Subscriber)>>>;

/// Events published by listeners from the dispatch thread itself
type ReentrantQueue = Arc<Mutex<VecDeque<BridgeEvent>>>;

enum Dispatch {
    Event(BridgeEvent),
    Barrier(std_mpsc::SyncSender<()>),
}

struct HubInner {
    subscribers: SubscriberList,
    queue: std_mpsc::SyncSender<Dispatch>,
    reentrant: ReentrantQueue,
    dispatch_thread: Option<ThreadId>,
    next_id: AtomicU64,
}

/// Multi-subscriber event hub. Cheap to clone; clones share subscribers and
/// the dispatch thread, which exits once the last clone is dropped.
#[derive(Clone)]
pub struct EventHub {
    inner: Arc<HubInner>,
}

impl EventHub {
    pub fn new(capacity: usize) -> Self {
        let (queue, rx) = std_mpsc::sync_channel::<Dispatch>(capacity.max(1));
        let subscribers: SubscriberList = Arc::new(RwLock::new(Vec::new()));
        let reentrant: ReentrantQueue = Arc::new(Mutex::new(VecDeque::new()));

        let thread_subscribers = subscribers.clone();
        let thread_reentrant = reentrant.clone();
        let spawned = std::thread::Builder::new()
            .name("pinbridge-dispatch".to_string())
            .spawn(move || run_dispatch(rx, thread_subscribers, thread_reentrant));
        let dispatch_thread = match spawned {
            Ok(handle) => Some(handle.thread().id()),
            Err(e) => {
                // Without a dispatch thread the queue fills and publishers
                // block, so this is worth shouting about.
                tlog!("[events] Failed to spawn dispatch thread: {}", e);
                None
            }
        };

        Self {
            inner: Arc::new(HubInner {
                subscribers,
                queue,
                reentrant,
                dispatch_thread,
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Register a callback listener.
    pub fn subscribe(&self, listener: Arc<dyn EventListener>) -> ListenerId {
        self.add(Subscriber::Listener(listener))
    }

    /// Register a channel subscriber for async consumers. Events are dropped
    /// for this subscriber while its channel is full; a closed channel is
    /// removed on the next delivery.
    pub fn subscribe_channel(&self, capacity: usize) -> (ListenerId, mpsc::Receiver<BridgeEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (self.add(Subscriber::Channel(tx)), rx)
    }

    /// Remove a subscriber. Returns false if the id was unknown.
    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        match self.inner.subscribers.write() {
            Ok(mut subs) => {
                let before = subs.len();
                subs.retain(|(sid, _)| *sid != id);
                subs.len() != before
            }
            Err(e) => {
                tlog!("[events] Subscriber list poisoned: {}", e);
                false
            }
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.read().map(|s| s.len()).unwrap_or(0)
    }

    /// Queue an event for delivery. Blocks while the queue is full, except
    /// when called from a listener callback.
    pub fn publish(&self, event: BridgeEvent) {
        let Some(event) = self.publish_reentrant(event) else {
            return;
        };
        if self.inner.queue.send(Dispatch::Event(event)).is_err() {
            tlog!("[events] Dispatch thread is gone, event dropped");
        }
    }

    /// Queue an event without blocking. Hands the event back if the queue is
    /// full.
    pub fn try_publish(&self, event: BridgeEvent) -> Result<(), BridgeEvent> {
        let Some(event) = self.publish_reentrant(event) else {
            return Ok(());
        };
        match self.inner.queue.try_send(Dispatch::Event(event)) {
            Ok(()) => Ok(()),
            Err(std_mpsc::TrySendError::Full(Dispatch::Event(event))) => Err(event),
            Err(std_mpsc::TrySendError::Full(Dispatch::Barrier(_))) => Ok(()),
            Err(std_mpsc::TrySendError::Disconnected(_)) => {
                tlog!("[events] Dispatch thread is gone, event dropped");
                Ok(())
            }
        }
    }

    /// Queue an event, waiting in `retry` steps while the queue is full.
    /// Gives up and returns false once `cancel` is set.
    pub fn publish_unless(&self, event: BridgeEvent, cancel: &AtomicBool, retry: Duration) -> bool {
        let mut pending = event;
        loop {
            match self.try_publish(pending) {
                Ok(()) => return true,
                Err(event) => {
                    if cancel.load(Ordering::SeqCst) {
                        return false;
                    }
                    std::thread::sleep(retry);
                    pending = event;
                }
            }
        }
    }

    /// Queue a log event; the text is also written to the process log.
    pub fn log(&self, text: impl Into<String>) {
        let text = text.into();
        tlog!("[bridge] {}", text);
        self.publish(BridgeEvent::log(text));
    }

    /// Block until every event queued before this call has been delivered.
    /// Returns at once inside a listener callback, where waiting on the
    /// dispatch thread would wait on itself.
    pub fn flush(&self) {
        if self.on_dispatch_thread() {
            return;
        }
        let (ack_tx, ack_rx) = std_mpsc::sync_channel(1);
        if self.inner.queue.send(Dispatch::Barrier(ack_tx)).is_ok() {
            let _ = ack_rx.recv();
        }
    }

    fn on_dispatch_thread(&self) -> bool {
        self.inner.dispatch_thread == Some(std::thread::current().id())
    }

    /// Divert a publish made from a callback to the dispatcher's own queue.
    /// Returns the event untouched for any other caller.
    fn publish_reentrant(&self, event: BridgeEvent) -> Option<BridgeEvent> {
        if !self.on_dispatch_thread() {
            return Some(event);
        }
        self.inner
            .reentrant
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push_back(event);
        None
    }

    fn add(&self, subscriber: Subscriber) -> ListenerId {
        let id = ListenerId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        match self.inner.subscribers.write() {
            Ok(mut subs) => subs.push((id, subscriber)),
            Err(e) => tlog!("[events] Subscriber list poisoned: {}", e),
        }
        id
    }
}

impl Default for EventHub {
    fn default() -> Self {
        EventHub::new(DEFAULT_QUEUE_CAPACITY)
    }
}

fn run_dispatch(
    rx: std_mpsc::Receiver<Dispatch>,
    subscribers: SubscriberList,
    reentrant: ReentrantQueue,
) {
    while let Ok(item) = rx.recv() {
        let mut next = match item {
            Dispatch::Event(event) => Some(event),
            Dispatch::Barrier(ack) => {
                let _ = ack.send(());
                continue;
            }
        };

        // Events published by callbacks go out before anything queued later
        while let Some(event) = next {
            if !deliver_all(&subscribers, &event) {
                return;
            }
            next = reentrant
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .pop_front();
        }
    }
}

/// Deliver one event to a snapshot of the subscribers. No lock is held while
/// callbacks run, so they may subscribe or unsubscribe. Returns false if the
/// subscriber list is poisoned.
fn deliver_all(subscribers: &SubscriberList, event: &BridgeEvent) -> bool {
    let snapshot: Vec<(ListenerId, Subscriber)> = match subscribers.read() {
        Ok(subs) => subs.clone(),
        Err(e) => {
            eprintln!("[events] Subscriber list poisoned, dispatch stopped: {}", e);
            return false;
        }
    };

    let mut closed = Vec::new();
    for (id, subscriber) in &snapshot {
        match subscriber {
            Subscriber::Listener(listener) => {
                let delivered = catch_unwind(AssertUnwindSafe(|| deliver(listener.as_ref(), event)));
                if delivered.is_err() {
                    tlog!("[events] Listener {:?} panicked, continuing", id);
                }
            }
            Subscriber::Channel(tx) => match tx.try_send(event.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {}
                Err(mpsc::error::TrySendError::Closed(_)) => closed.push(*id),
            },
        }
    }

    if !closed.is_empty() {
        if let Ok(mut subs) = subscribers.write() {
            subs.retain(|(id, _)| !closed.contains(id));
        }
    }
    true
}

fn deliver(listener: &dyn EventListener, event: &BridgeEvent) {
    match event {
        BridgeEvent::Message {
            origin,
            content,
            timestamp_us,
        } => listener.on_message(*origin, content, *timestamp_us),
        BridgeEvent::Status { channels, .. } => listener.on_status(channels),
        BridgeEvent::Log { text, .. } => listener.on_log(text),
        BridgeEvent::State { previous, current } => listener.on_state(previous, current),
    }
}

// ============================================================================
// Tests
// ============================================================================

// src/protocol/classify.rs
//
// Line classification for incoming frames. Prefixes are checked in order:
//   STATUS:<payload>  -> status report
//   <- <content>      -> bridge echo (what the bridge relayed downstream)
//   anything else     -> device output

use super::status::{parse_status, StatusSnapshot};
use super::Origin;

pub const STATUS_PREFIX: &str = "STATUS:";
pub const BRIDGE_ECHO_PREFIX: &str = "<- ";

/// Result of classifying one decoded line.
#[derive(Debug, Clone, PartialEq)]
pub enum ClassifiedEvent {
    Status(StatusSnapshot),
    Message { origin: Origin, content: String },
}

/// Classify a decoded line. Surrounding whitespace is trimmed first.
///
/// Returns `None` for blank lines and for status lines that fail to parse;
/// malformed status frames are dropped without an event.
pub fn classify_line(line: &str) -> Option<ClassifiedEvent> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }

    if let Some(payload) = line.strip_prefix(STATUS_PREFIX) {
        return parse_status(payload).ok().map(ClassifiedEvent::Status);
    }

    if let Some(content) = line.strip_prefix(BRIDGE_ECHO_PREFIX) {
        return Some(ClassifiedEvent::Message {
            origin: Origin::BridgeToDevice,
            content: content.to_string(),
        });
    }

    Some(ClassifiedEvent::Message {
        origin: Origin::DeviceToHost,
        content: line.to_string(),
    })
}

// src/protocol/status.rs
//
// Status sub-protocol parser.
//
// Format (after the "STATUS:" prefix):
//   <key>:<value>(,<key>:<value>)*
//   e.g. D2:1,D3:0,A0:512

use std::collections::BTreeMap;

use crate::io::BridgeError;

/// Channel key -> value, rebuilt from scratch on every status frame.
pub type StatusSnapshot = BTreeMap<String, i64>;

/// Parse a status payload.
///
/// Empty candidates (trailing commas) and candidates without a colon are
/// skipped. A value that is not a base-10 integer rejects the whole line;
/// there is no partial result. Duplicate keys: last one wins.
pub fn parse_status(payload: &str) -> Result<StatusSnapshot, BridgeError> {
    let mut snapshot = StatusSnapshot::new();

    for candidate in payload.split(',') {
        if candidate.trim().is_empty() {
            continue;
        }

        let Some((key, value)) = candidate.split_once(':') else {
            continue;
        };

        let value: i64 = value.trim().parse().map_err(|_| {
            BridgeError::MalformedStatusFrame(format!(
                "invalid value {:?} for channel {:?}",
                value,
                key.trim()
            ))
        })?;

        snapshot.insert(key.trim().to_string(), value);
    }

    Ok(snapshot)
}

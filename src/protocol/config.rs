// src/protocol/config.rs
//
// Pin monitoring configuration command.
//
// Format: CFG:D0=0,D1=0,...,D13=1,A0=1,...,A5=0
//
// Every slot is always present. The firmware keeps enable bits between
// commands, so a partial update would leave stale enables active.

use std::collections::BTreeSet;

pub const CONFIG_PREFIX: &str = "CFG:";

/// Number of digital channel slots (D0..D13)
pub const DIGITAL_CHANNELS: u8 = 14;

/// Number of analog channel slots (A0..A5)
pub const ANALOG_CHANNELS: u8 = 6;

/// Build the full-state configuration line (without terminator).
/// Indices outside the protocol bounds are ignored.
pub fn build_config_command(digital: &BTreeSet<u8>, analog: &BTreeSet<u8>) -> String {
    let digital_slots = (0..DIGITAL_CHANNELS)
        .map(|i| format!("D{}={}", i, u8::from(digital.contains(&i))));
    let analog_slots =
        (0..ANALOG_CHANNELS).map(|i| format!("A{}={}", i, u8::from(analog.contains(&i))));

    let parts: Vec<String> = digital_slots.chain(analog_slots).collect();
    format!("{}{}", CONFIG_PREFIX, parts.join(","))
}

/// Channel names in the request that have no slot on the wire.
pub fn out_of_range_channels(digital: &BTreeSet<u8>, analog: &BTreeSet<u8>) -> Vec<String> {
    let digital = digital
        .iter()
        .filter(|&&i| i >= DIGITAL_CHANNELS)
        .map(|i| format!("D{}", i));
    let analog = analog
        .iter()
        .filter(|&&i| i >= ANALOG_CHANNELS)
        .map(|i| format!("A{}", i));
    digital.chain(analog).collect()
}

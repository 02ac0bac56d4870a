// src/io/serial/line.rs
//
// Serial line settings (data bits, stop bits, parity). Platform neutral; the
// mapping onto the serialport crate lives with the port code.

use serde::{Deserialize, Serialize};

/// Parity setting for serial port configuration
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Parity {
    #[default]
    None,
    Odd,
    Even,
}

impl Parity {
    /// Lenient parse: anything other than "odd"/"even" means none.
    pub fn from_name(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "odd" => Parity::Odd,
            "even" => Parity::Even,
            _ => Parity::None,
        }
    }

    fn letter(&self) -> char {
        match self {
            Parity::None => 'N',
            Parity::Odd => 'O',
            Parity::Even => 'E',
        }
    }
}

/// Framing of each character on the wire. The bridge firmware uses 8-N-1.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct SerialLineConfig {
    pub data_bits: u8,
    pub stop_bits: u8,
    pub parity: Parity,
}

impl Default for SerialLineConfig {
    fn default() -> Self {
        SerialLineConfig {
            data_bits: 8,
            stop_bits: 1,
            parity: Parity::None,
        }
    }
}

impl std::fmt::Display for SerialLineConfig {
    /// Conventional short form, e.g. "8-N-1"
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}-{}", self.data_bits, self.parity.letter(), self.stop_bits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line(data_bits: u8, stop_bits: u8, parity: Parity) -> SerialLineConfig {
        SerialLineConfig {
            data_bits,
            stop_bits,
            parity,
        }
    }

    #[test]
    fn test_default_is_8n1() {
        let cfg = SerialLineConfig::default();
        assert_eq!(cfg.to_string(), "8-N-1");
    }

    #[test]
    fn test_parity_from_name() {
        assert_eq!(Parity::from_name("ODD"), Parity::Odd);
        assert_eq!(Parity::from_name("even"), Parity::Even);
        assert_eq!(Parity::from_name("mark"), Parity::None);
    }

    #[test]
    fn test_display_short_form() {
        assert_eq!(line(7, 2, Parity::Even).to_string(), "7-E-2");
        assert_eq!(line(8, 1, Parity::Odd).to_string(), "8-O-1");
    }
}

// src/io/framer.rs
//
// Newline framing for the bridge protocol. Bytes arrive in arbitrary chunks
// from the port; complete lines come out. The pending buffer is bounded so a
// device that never sends a terminator cannot grow memory without limit.

/// Protocol line terminator.
pub const LINE_TERMINATOR: u8 = b'\n';

/// Default bound on a single pending line, in bytes.
pub const DEFAULT_MAX_LINE_LENGTH: usize = 1024;

/// A line extracted from the serial stream, terminator removed.
#[derive(Debug, Clone, PartialEq)]
pub struct LineFrame {
    /// Raw line bytes (not yet decoded)
    pub bytes: Vec<u8>,
    /// True when the frame was force-split at the length bound
    pub incomplete: bool,
}

impl LineFrame {
    /// Decode as UTF-8 with invalid sequences replaced, then trim the
    /// remaining line ending (`\r`) and surrounding whitespace.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.bytes).trim().to_string()
    }
}

/// Incremental line framer.
pub struct LineFramer {
    buffer: Vec<u8>,
    max_length: usize,
}

impl LineFramer {
    pub fn new(max_length: usize) -> Self {
        LineFramer {
            buffer: Vec::with_capacity(128),
            max_length: max_length.max(1),
        }
    }

    /// Feed a chunk and return every line it completes.
    pub fn feed(&mut self, data: &[u8]) -> Vec<LineFrame> {
        let mut frames = Vec::new();

        for &byte in data {
            if byte == LINE_TERMINATOR {
                let bytes: Vec<u8> = self.buffer.drain(..).collect();
                frames.push(LineFrame {
                    bytes,
                    incomplete: false,
                });
                continue;
            }

            self.buffer.push(byte);

            // Force split on max length
            if self.buffer.len() >= self.max_length {
                let bytes: Vec<u8> = self.buffer.drain(..).collect();
                frames.push(LineFrame {
                    bytes,
                    incomplete: true,
                });
            }
        }

        frames
    }

    /// Drop any partial line. Returns how many bytes were thrown away.
    pub fn discard(&mut self) -> usize {
        let dropped = self.buffer.len();
        self.buffer.clear();
        dropped
    }

    /// Number of bytes waiting for a terminator.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }
}

impl Default for LineFramer {
    fn default() -> Self {
        LineFramer::new(DEFAULT_MAX_LINE_LENGTH)
    }
}

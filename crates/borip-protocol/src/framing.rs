//! Newline framing for the control channel.
//!
//! TCP delivers the control stream in arbitrary chunks. [`LineBuffer`]
//! accumulates bytes and hands back one complete line at a time, keeping any
//! partial line (or further complete lines) buffered for the next call.

use bytes::{Buf, BytesMut};

/// Line terminator on the control channel.
pub const TERMINATOR: u8 = b'\n';

/// Maximum number of buffered bytes without a terminator before the buffer
/// is discarded. Control lines are short; a peer exceeding this is not
/// speaking BorIP.
pub const MAX_LINE_LEN: usize = 8192;

/// Append the terminator to a line.
pub fn encode_line(line: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(line.len() + 1);
    out.extend_from_slice(line.as_bytes());
    out.push(TERMINATOR);
    out
}

/// Reassembles newline-terminated lines from a byte stream.
#[derive(Debug, Default)]
pub struct LineBuffer {
    buf: BytesMut,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append received bytes.
    pub fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
        if self.buf.len() > MAX_LINE_LEN && !self.has_line() {
            tracing::warn!(
                buffered = self.buf.len(),
                "Discarding oversized control line"
            );
            self.buf.clear();
        }
    }

    /// Whether a complete line is buffered.
    pub fn has_line(&self) -> bool {
        self.buf.contains(&TERMINATOR)
    }

    /// Remove and return the next complete line, without its terminator.
    ///
    /// Invalid UTF-8 is replaced rather than rejected.
    pub fn next_line(&mut self) -> Option<String> {
        let pos = self.buf.iter().position(|&b| b == TERMINATOR)?;
        let line = self.buf.split_to(pos);
        self.buf.advance(1);
        Some(String::from_utf8_lossy(&line).into_owned())
    }

    /// Number of buffered bytes.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const COMMANDS: &[&str] = &[
        "GO",
        "FREQ 100000000",
        "DEVICE rtl name=\"two words\"",
        "",
        "DEST 10.0.0.1:28888",
        "HEADER OFF\r",
        "ANTENNA TX/RX",
    ];

    fn drain(buf: &mut LineBuffer) -> Vec<String> {
        let mut out = Vec::new();
        while let Some(line) = buf.next_line() {
            out.push(line);
        }
        out
    }

    #[test]
    fn partial_line_is_kept() {
        let mut buf = LineBuffer::new();
        buf.push(b"FREQ 1000");
        assert!(!buf.has_line());
        assert_eq!(buf.next_line(), None);
        buf.push(b"00\nGO");
        assert_eq!(buf.next_line().as_deref(), Some("FREQ 100000"));
        assert_eq!(buf.next_line(), None);
        assert_eq!(buf.len(), 2);
        buf.push(b"\n");
        assert_eq!(buf.next_line().as_deref(), Some("GO"));
        assert!(buf.is_empty());
    }

    #[test]
    fn multiple_lines_come_out_one_at_a_time() {
        let mut buf = LineBuffer::new();
        buf.push(b"GO\nSTOP\nPING\n");
        assert_eq!(buf.next_line().as_deref(), Some("GO"));
        assert!(buf.has_line());
        assert_eq!(buf.next_line().as_deref(), Some("STOP"));
        assert_eq!(buf.next_line().as_deref(), Some("PING"));
        assert_eq!(buf.next_line(), None);
    }

    #[test]
    fn round_trip_at_every_split_offset() {
        let stream: Vec<u8> = COMMANDS.iter().flat_map(|c| encode_line(c)).collect();
        for split in 0..=stream.len() {
            let mut buf = LineBuffer::new();
            buf.push(&stream[..split]);
            let mut lines = drain(&mut buf);
            buf.push(&stream[split..]);
            lines.extend(drain(&mut buf));
            assert_eq!(lines, COMMANDS, "split at {}", split);
            assert!(buf.is_empty());
        }
    }

    #[test]
    fn round_trip_byte_by_byte() {
        let stream: Vec<u8> = COMMANDS.iter().flat_map(|c| encode_line(c)).collect();
        let mut buf = LineBuffer::new();
        let mut lines = Vec::new();
        for b in stream {
            buf.push(&[b]);
            lines.extend(drain(&mut buf));
        }
        assert_eq!(lines, COMMANDS);
    }

    #[test]
    fn oversized_garbage_is_discarded() {
        let mut buf = LineBuffer::new();
        buf.push(&vec![b'x'; MAX_LINE_LEN + 1]);
        assert!(buf.is_empty());
        buf.push(b"GO\n");
        assert_eq!(buf.next_line().as_deref(), Some("GO"));
    }
}

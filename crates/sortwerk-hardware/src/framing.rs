// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Newline framing for the serial byte stream.

use tracing::warn;

/// Longest partial line held while waiting for its terminator.
pub const MAX_LINE_BYTES: usize = 4096;

/// Splits a byte stream into text lines.
///
/// Bytes after the last `\n` are held until the next `push`, so a line (or a
/// multi-byte UTF-8 character) split across two reads is reassembled intact.
/// A partial line longer than [`MAX_LINE_BYTES`] is discarded up to and
/// including its eventual terminator.
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
    /// Skipping the rest of an oversized line.
    discarding: bool,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `bytes` and return every completed, non-blank line, trimmed.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(bytes);

        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|&b| b == b'\n') {
            let raw: Vec<u8> = self.pending.drain(..=pos).collect();
            if std::mem::take(&mut self.discarding) {
                continue;
            }
            let text = String::from_utf8_lossy(&raw[..raw.len() - 1]);
            let text = text.trim();
            if !text.is_empty() {
                lines.push(text.to_string());
            }
        }

        if self.pending.len() > MAX_LINE_BYTES {
            if !self.discarding {
                warn!(bytes = self.pending.len(), "unterminated sorter line too long, discarding");
            }
            self.pending.clear();
            self.discarding = true;
        }
        lines
    }

    /// Number of buffered bytes still waiting for a terminator.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn clear(&mut self) {
        self.pending.clear();
        self.discarding = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_complete_lines() {
        let mut buf = LineBuffer::new();
        let lines = buf.push(b"{\"ok\":true}\n{\"ok\":false}\n");
        assert_eq!(lines, vec!["{\"ok\":true}", "{\"ok\":false}"]);
        assert_eq!(buf.pending_len(), 0);
    }

    #[test]
    fn partial_line_is_carried_over() {
        let mut buf = LineBuffer::new();
        assert!(buf.push(b"{\"ok\":").is_empty());
        assert_eq!(buf.pending_len(), 6);
        assert_eq!(buf.push(b"true}\r\nja"), vec!["{\"ok\":true}"]);
        assert_eq!(buf.push(b"m\n"), vec!["jam"]);
    }

    #[test]
    fn blank_lines_are_dropped() {
        let mut buf = LineBuffer::new();
        assert_eq!(buf.push(b"\n\r\n   \nready\n\n"), vec!["ready"]);
    }

    #[test]
    fn split_utf8_character_survives() {
        let mut buf = LineBuffer::new();
        let text = "zählt\n".as_bytes();
        // Split inside the two-byte 'ä'.
        assert!(buf.push(&text[..2]).is_empty());
        assert_eq!(buf.push(&text[2..]), vec!["zählt"]);
    }

    #[test]
    fn oversized_line_is_dropped_through_its_terminator() {
        let mut buf = LineBuffer::new();
        let noise = vec![b'x'; MAX_LINE_BYTES + 1];
        assert!(buf.push(&noise).is_empty());
        assert_eq!(buf.pending_len(), 0);

        // More of the same line, still unbounded by the buffer.
        assert!(buf.push(&noise).is_empty());
        assert_eq!(buf.pending_len(), 0);

        assert_eq!(buf.push(b"tail\n{\"ok\":true}\n"), vec!["{\"ok\":true}"]);
    }

    #[test]
    fn line_at_the_limit_is_kept() {
        let mut buf = LineBuffer::new();
        assert!(buf.push(&[b'a'; MAX_LINE_BYTES]).is_empty());
        let lines = buf.push(b"\n");
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].len(), MAX_LINE_BYTES);
    }

    #[test]
    fn clear_discards_partial_data() {
        let mut buf = LineBuffer::new();
        buf.push(b"half a li");
        buf.clear();
        assert_eq!(buf.push(b"ne\n"), vec!["ne"]);
    }
}

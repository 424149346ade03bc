/// Default cap on buffered bytes for a connection that never sends a
/// terminator.
pub const DEFAULT_MAX_BUFFER: usize = 1024 * 1024;

/// Errors from the line codec.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("inbound buffer exceeded {limit} bytes without a line terminator")]
    BufferOverflow { limit: usize },
}

/// Per-connection line decoder.
///
/// Raw bytes are appended to an internal buffer; each call splits off every
/// complete line, looking for `\r\n` first, then bare `\n`, then bare `\r`,
/// re-checking that priority order on every pass. Extracted lines are trimmed
/// and empty lines are dropped. Any unterminated remainder stays buffered for
/// the next feed.
pub struct LineCodec {
    buf: Vec<u8>,
    max_buffer: usize,
}

impl LineCodec {
    pub fn new() -> Self {
        Self::with_limit(DEFAULT_MAX_BUFFER)
    }

    pub fn with_limit(max_buffer: usize) -> Self {
        Self {
            buf: Vec::new(),
            max_buffer,
        }
    }

    /// Decode every complete line available after appending `bytes`.
    pub fn feed(&mut self, bytes: &[u8]) -> Result<Vec<String>, CodecError> {
        self.buf.extend_from_slice(bytes);

        let mut lines = Vec::new();
        while let Some((at, term_len)) = find_terminator(&self.buf) {
            let raw: Vec<u8> = self.buf.drain(..at + term_len).collect();
            let line = String::from_utf8_lossy(&raw[..at]).trim().to_string();
            if !line.is_empty() {
                lines.push(line);
            }
        }

        if self.buf.len() > self.max_buffer {
            self.buf.clear();
            return Err(CodecError::BufferOverflow {
                limit: self.max_buffer,
            });
        }
        Ok(lines)
    }

    /// Bytes currently waiting for a terminator.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }
}

impl Default for LineCodec {
    fn default() -> Self {
        Self::new()
    }
}

/// First terminator position and its length: `\r\n`, then `\n`, then `\r`.
fn find_terminator(buf: &[u8]) -> Option<(usize, usize)> {
    if let Some(i) = find_subslice(buf, b"\r\n") {
        return Some((i, 2));
    }
    if let Some(i) = buf.iter().position(|&b| b == b'\n') {
        return Some((i, 1));
    }
    if let Some(i) = buf.iter().position(|&b| b == b'\r') {
        return Some((i, 1));
    }
    None
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_line_lf() {
        let mut codec = LineCodec::new();
        let lines = codec.feed(b"hello\n").unwrap();
        assert_eq!(lines, vec!["hello"]);
        assert_eq!(codec.pending(), 0);
    }

    #[test]
    fn test_mixed_terminators() {
        let mut codec = LineCodec::new();
        let lines = codec.feed(b"one\r\ntwo\nthree\r").unwrap();
        assert_eq!(lines, vec!["one", "two", "three"]);
    }

    #[test]
    fn test_partial_line_stays_buffered() {
        let mut codec = LineCodec::new();
        assert!(codec.feed(b"incompl").unwrap().is_empty());
        assert_eq!(codec.pending(), 7);

        let lines = codec.feed(b"ete\n").unwrap();
        assert_eq!(lines, vec!["incomplete"]);
        assert_eq!(codec.pending(), 0);
    }

    #[test]
    fn test_terminator_split_across_feeds() {
        let mut codec = LineCodec::new();
        // \r arrives first; it is a valid terminator on its own, so the line
        // is extracted immediately and the following \n yields nothing.
        let lines = codec.feed(b"cmd\r").unwrap();
        assert_eq!(lines, vec!["cmd"]);
        assert!(codec.feed(b"\n").unwrap().is_empty());
    }

    #[test]
    fn test_crlf_priority_over_bare_newline() {
        let mut codec = LineCodec::new();
        // \r\n is searched before bare \n on every pass, so a bare \n ahead
        // of the first \r\n stays inside the extracted line.
        let lines = codec.feed(b"x\ny\r\nz\n").unwrap();
        assert_eq!(lines, vec!["x\ny", "z"]);
    }

    #[test]
    fn test_whitespace_trimmed_and_empty_dropped() {
        let mut codec = LineCodec::new();
        let lines = codec.feed(b"  spaced  \n\n   \n/quit\n").unwrap();
        assert_eq!(lines, vec!["spaced", "/quit"]);
    }

    #[test]
    fn test_arbitrary_chunking_loses_nothing() {
        let input = b"first line\r\nsecond\nthird one\rfourth\r\n";
        let expected = vec!["first line", "second", "third one", "fourth"];

        // Feed the same input in every possible two-chunk split.
        for split in 0..input.len() {
            let mut codec = LineCodec::new();
            let mut lines = codec.feed(&input[..split]).unwrap();
            lines.extend(codec.feed(&input[split..]).unwrap());
            assert_eq!(lines, expected, "split at {split}");
            assert_eq!(codec.pending(), 0, "split at {split}");
        }
    }

    #[test]
    fn test_byte_by_byte_feed() {
        let input = b"alpha\nbeta\r\ngamma\r";
        let mut codec = LineCodec::new();
        let mut lines = Vec::new();
        for b in input {
            lines.extend(codec.feed(&[*b]).unwrap());
        }
        assert_eq!(lines, vec!["alpha", "beta", "gamma"]);
    }

    #[test]
    fn test_buffer_overflow() {
        let mut codec = LineCodec::with_limit(16);
        let err = codec.feed(&[b'x'; 32]).unwrap_err();
        match err {
            CodecError::BufferOverflow { limit } => assert_eq!(limit, 16),
        }
        // Buffer was cleared so the connection owner can tear down cleanly.
        assert_eq!(codec.pending(), 0);
    }

    #[test]
    fn test_overflow_not_triggered_by_terminated_input() {
        let mut codec = LineCodec::with_limit(16);
        // Far more than 16 bytes total, but every line terminates.
        for _ in 0..10 {
            let lines = codec.feed(b"0123456789ab\n").unwrap();
            assert_eq!(lines.len(), 1);
        }
    }
}

use tracing::warn;

/// Upper bound on lines accumulated by one read cycle.
pub const AT_MESG_MAX_LINES: usize = 20;

/// Splits the raw serial byte stream into CR/LF terminated lines.
pub struct LineBuffer {
    buffer: Vec<u8>,
    max_buffer_size: usize
}
impl Default for LineBuffer {
    fn default() -> Self {
        Self::new()
    }
}
impl LineBuffer {
    pub fn new() -> Self {
        Self::with_max_size(4096)
    }

    pub fn with_max_size(size: usize) -> Self {
        Self {
            buffer: Vec::new(),
            max_buffer_size: size
        }
    }

    /// Drops any held-back partial line.
    pub fn clear(&mut self) {
        self.buffer.clear();
    }

    /// Consumes new data and returns every line it completed, in arrival order.
    /// Empty lines are skipped and the unterminated tail is kept for the next call.
    pub fn process_data(&mut self, data: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(data);

        let mut lines = Vec::new();
        let mut start = 0;
        for (i, byte) in self.buffer.iter().enumerate() {
            if *byte != b'\r' && *byte != b'\n' {
                continue;
            }
            if i > start {
                let line = String::from_utf8_lossy(&self.buffer[start..i]);
                let line = line.trim();
                if !line.is_empty() {
                    lines.push(line.to_string());
                }
            }
            start = i + 1;
        }
        self.buffer.drain(..start);

        // Prevent unbounded growth from a peer that never terminates its lines.
        if self.buffer.len() > self.max_buffer_size {
            warn!("Discarding {} bytes of unterminated serial data", self.buffer.len());
            self.buffer.clear();
        }
        lines
    }

    /// The unterminated tail currently held back.
    pub fn pending(&self) -> String {
        String::from_utf8_lossy(&self.buffer).into_owned()
    }

    /// Takes the unterminated tail as a line if it starts with `expected`, for prompt
    /// replies such as `"> "` that never receive a line terminator.
    pub fn take_pending_if(&mut self, expected: &str) -> Option<String> {
        if expected.is_empty() || !self.buffer.starts_with(expected.as_bytes()) {
            return None;
        }
        let line = self.pending();
        self.buffer.clear();
        Some(line)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const STREAM: &[u8] = b"\r\n+CREG: 0,1\r\n\r\nRING\r\n+CLIP: \"+447700900123\",145,,,\"Alice\",0\r\nOK\r\n";

    fn expected_lines() -> Vec<String> {
        vec![
            "+CREG: 0,1".to_string(),
            "RING".to_string(),
            "+CLIP: \"+447700900123\",145,,,\"Alice\",0".to_string(),
            "OK".to_string()
        ]
    }

    #[test]
    fn test_process_data() {
        let mut buffer = LineBuffer::new();
        assert_eq!(buffer.process_data(b"AT\rOK\r\n+CSQ: 1"), vec!["AT", "OK"]);
        assert_eq!(buffer.pending(), "+CSQ: 1");
        assert_eq!(buffer.process_data(b"5,99\r\n"), vec!["+CSQ: 15,99"]);
        assert_eq!(buffer.pending(), "");
    }

    #[test]
    fn test_chunking_invariance() {
        for chunk_size in 1..=STREAM.len() {
            let mut buffer = LineBuffer::new();
            let lines: Vec<String> = STREAM
                .chunks(chunk_size)
                .flat_map(|chunk| buffer.process_data(chunk))
                .collect();
            assert_eq!(lines, expected_lines(), "chunk size {}", chunk_size);
        }

        // Uneven splits, including one inside a multi-byte character.
        let data = "+CUSD: 0,\"Solde: 5€\",15\r\n".as_bytes();
        let euro = data.iter().position(|&b| b == 0xE2).unwrap();
        let mut buffer = LineBuffer::new();
        let mut lines = buffer.process_data(&data[..euro + 1]);
        lines.extend(buffer.process_data(&data[euro + 1..]));
        assert_eq!(lines, vec!["+CUSD: 0,\"Solde: 5€\",15"]);
    }

    #[test]
    fn test_take_pending_prompt() {
        let mut buffer = LineBuffer::new();
        assert!(buffer.process_data(b"\r\n> ").is_empty());
        assert_eq!(buffer.take_pending_if("+CMGS"), None);
        assert_eq!(buffer.take_pending_if("> ").as_deref(), Some("> "));
        assert_eq!(buffer.pending(), "");
    }

    #[test]
    fn test_overflow_discards_tail() {
        let mut buffer = LineBuffer::with_max_size(8);
        assert!(buffer.process_data(b"0123456789").is_empty());
        assert_eq!(buffer.pending(), "");
        assert_eq!(buffer.process_data(b"OK\r\n"), vec!["OK"]);
    }
}

//! Incremental server-sent-event decoder.
//!
//! Bytes arrive in arbitrary network-sized pieces. [`SseDecoder::push`] buffers them, splits
//! complete lines (`\n`, `\r\n` or `\r`) and returns the payload of every event terminated by a
//! blank line. Multiple `data:` lines of one event are joined with `\n`.
//!
//! Servers answer failed requests with a plain JSON body instead of an event stream, so a line
//! that starts with `{` is accepted as a bare payload. [`SseDecoder::finish`] drains whatever is
//! left once the connection closes.

use bytes::BytesMut;
use tracing::trace;

/// Line-oriented SSE decoder. Only the `data` field is surfaced.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buf: BytesMut,
    data: Option<String>,
    // A `\r` ended the previous push; a leading `\n` in the next one belongs to it.
    skip_lf: bool,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of buffered bytes not yet forming a complete line.
    pub fn pending_bytes(&self) -> usize {
        self.buf.len()
    }

    /// Feed bytes and collect the payloads of every completed event.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        let mut bytes = bytes;
        if self.skip_lf && !bytes.is_empty() {
            if let Some(rest) = bytes.strip_prefix(b"\n") {
                bytes = rest;
            }
            self.skip_lf = false;
        }
        self.buf.extend_from_slice(bytes);

        let mut events = Vec::new();
        while let Some(idx) = self.buf.iter().position(|b| *b == b'\n' || *b == b'\r') {
            let line = self.buf.split_to(idx);
            let terminator = self.buf.split_to(1);
            if terminator[0] == b'\r' {
                if self.buf.is_empty() {
                    self.skip_lf = true;
                } else if self.buf[0] == b'\n' {
                    let _ = self.buf.split_to(1);
                }
            }
            let line = String::from_utf8_lossy(&line);
            self.process_line(&line, &mut events);
        }
        events
    }

    /// Drain buffered input after the connection closed.
    ///
    /// Returns the payloads of unterminated trailing events, in order. The decoder is empty
    /// afterwards.
    pub fn finish(&mut self) -> Vec<String> {
        self.skip_lf = false;
        let mut events = Vec::new();
        if !self.buf.is_empty() {
            let rest = self.buf.split();
            let line = String::from_utf8_lossy(&rest);
            self.process_line(&line, &mut events);
        }
        events.extend(self.data.take());
        if !events.is_empty() {
            trace!("sse: drained {} trailing payload(s)", events.len());
        }
        events
    }

    fn process_line(&mut self, line: &str, out: &mut Vec<String>) {
        if line.is_empty() {
            out.extend(self.data.take());
            return;
        }
        if line.starts_with(':') {
            return;
        }
        if line.starts_with('{') {
            // Bare JSON body. Flush any pending event first so ordering is kept.
            out.extend(self.data.take());
            out.push(line.to_string());
            return;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "data" => match &mut self.data {
                Some(data) => {
                    data.push('\n');
                    data.push_str(value);
                }
                None => self.data = Some(value.to_string()),
            },
            other => trace!("sse: ignoring field '{}'", other),
        }
    }
}

use tracing::{trace, warn};

use crate::errors::ParseError;
use crate::wire::WireEvent;

/// Default bound for one pending SSE line.
pub const DEFAULT_MAX_LINE_BYTES: usize = 1024 * 1024;

/// Incremental SSE line decoder.
///
/// Bytes are buffered until a `\n` arrives, so an event may be split across
/// any number of `parse` calls. Splitting on the raw `\n` byte never cuts a
/// UTF-8 sequence, which keeps multi-byte characters intact across chunks.
#[derive(Debug)]
pub struct ChunkParser {
    buf: Vec<u8>,
    max_line_bytes: usize,
    // Set after an oversized line was dropped; bytes are skipped until `\n`.
    discarding: bool,
}

impl Default for ChunkParser {
    fn default() -> Self {
        Self::new()
    }
}

impl ChunkParser {
    pub fn new() -> Self {
        Self::with_max_line_bytes(DEFAULT_MAX_LINE_BYTES)
    }

    pub fn with_max_line_bytes(max_line_bytes: usize) -> Self {
        Self {
            buf: Vec::new(),
            max_line_bytes,
            discarding: false,
        }
    }

    /// Consumes one chunk and returns every event completed by it, in order.
    pub fn parse(&mut self, chunk: &[u8]) -> Vec<WireEvent> {
        let mut events = Vec::new();
        let mut rest = chunk;
        while let Some(idx) = rest.iter().position(|b| *b == b'\n') {
            let line = &rest[..idx];
            rest = &rest[idx + 1..];
            if self.discarding {
                self.discarding = false;
                continue;
            }
            if self.buf.len() + line.len() > self.max_line_bytes {
                self.drop_oversized(self.buf.len() + line.len());
                self.discarding = false;
                continue;
            }
            self.buf.extend_from_slice(line);
            if let Some(event) = decode_line(&self.buf) {
                events.push(event);
            }
            self.buf.clear();
        }

        if !self.discarding {
            if self.buf.len() + rest.len() > self.max_line_bytes {
                self.drop_oversized(self.buf.len() + rest.len());
            } else {
                self.buf.extend_from_slice(rest);
            }
        }
        events
    }

    /// Decodes whatever is still buffered as a final line. Used at end of
    /// stream, when the last frame may lack its trailing newline.
    pub fn flush(&mut self) -> Vec<WireEvent> {
        let event = if self.discarding {
            None
        } else {
            decode_line(&self.buf)
        };
        self.reset();
        event.into_iter().collect()
    }

    /// Number of bytes waiting for a line terminator.
    pub fn pending_bytes(&self) -> usize {
        self.buf.len()
    }

    pub fn reset(&mut self) {
        self.buf.clear();
        self.discarding = false;
    }

    fn drop_oversized(&mut self, len: usize) {
        let err = ParseError::LineTooLong {
            len,
            limit: self.max_line_bytes,
        };
        warn!(error = %err, "dropping oversized SSE line");
        self.buf.clear();
        self.discarding = true;
    }
}

fn decode_line(raw: &[u8]) -> Option<WireEvent> {
    let text = String::from_utf8_lossy(raw);
    let line = text.trim_end_matches('\r');
    if line.trim().is_empty() {
        return None;
    }
    let Some(payload) = line.strip_prefix("data:") else {
        trace!(line, "skipping non-data SSE line");
        return None;
    };
    let payload = payload.strip_prefix(' ').unwrap_or(payload);
    if payload.trim() == "[DONE]" {
        return None;
    }
    match serde_json::from_str::<WireEvent>(payload) {
        Ok(event) => Some(event),
        Err(e) => {
            let err = ParseError::malformed_event(e);
            warn!(error = %err, line_len = payload.len(), "dropping malformed SSE line");
            None
        }
    }
}

//! Incremental server-sent-events decoding.
//!
//! Provider bodies arrive in arbitrary byte chunks: a line, or a multi-byte
//! UTF-8 sequence, may be split across two reads. [`SseDecoder`] buffers
//! partial lines and only decodes complete ones.

use bytes::BytesMut;
use thiserror::Error;

/// Largest unterminated line or pending event the decoder will hold.
pub const MAX_EVENT_LEN: usize = 1024 * 1024;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("event exceeds {limit} bytes")]
pub struct EventTooLarge {
    pub limit: usize,
}

/// Decodes an SSE byte stream into event `data` payloads.
///
/// Only the `data` field matters here: `event`, `id`, `retry` and comment
/// lines are skipped. Multiple `data` lines of one event are joined with `\n`.
///
/// # Examples
///
/// ```
/// use buddy_relay::llm::sse::SseDecoder;
///
/// let mut decoder = SseDecoder::default();
/// assert!(decoder.push(b"data: {\"a\"")?.is_empty());
/// assert_eq!(decoder.push(b":1}\n\ndata: [DONE]\n\n")?, vec!["{\"a\":1}", "[DONE]"]);
/// # Ok::<(), buddy_relay::llm::sse::EventTooLarge>(())
/// ```
#[derive(Debug, Default)]
pub struct SseDecoder {
    buf: BytesMut,
    /// Bytes of `buf` already searched for a newline.
    scanned: usize,
    data: Option<String>,
}

impl SseDecoder {
    /// Feeds one chunk and returns every event completed by it.
    ///
    /// Fails once a line or an event grows past [`MAX_EVENT_LEN`]; the
    /// decoder should not be used after that.
    pub fn push(&mut self, chunk: &[u8]) -> Result<Vec<String>, EventTooLarge> {
        self.buf.extend_from_slice(chunk);
        let mut events = Vec::new();
        while let Some(pos) = self.buf[self.scanned..].iter().position(|&b| b == b'\n') {
            let end = self.scanned + pos;
            let line = self.buf.split_to(end + 1);
            self.scanned = 0;
            let line = &line[..end];
            self.process_line(line.strip_suffix(b"\r").unwrap_or(line), &mut events);
        }
        self.scanned = self.buf.len();

        let pending = self.data.as_ref().map_or(0, String::len);
        if self.buf.len() > MAX_EVENT_LEN || pending > MAX_EVENT_LEN {
            return Err(EventTooLarge {
                limit: MAX_EVENT_LEN,
            });
        }
        Ok(events)
    }

    /// Flushes an event left open when the body ended without a blank line.
    pub fn finish(&mut self) -> Option<String> {
        self.scanned = 0;
        let rest = self.buf.split();
        if !rest.is_empty() {
            let line = rest.strip_suffix(b"\r").unwrap_or(&rest[..]);
            self.process_line(line, &mut Vec::new());
        }
        self.data.take()
    }

    fn process_line(&mut self, line: &[u8], events: &mut Vec<String>) {
        if line.is_empty() {
            events.extend(self.data.take());
            return;
        }
        if line.starts_with(b":") {
            return;
        }

        let line = String::from_utf8_lossy(line);
        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line.as_ref(), ""),
        };
        if field != "data" {
            return;
        }
        match &mut self.data {
            Some(data) => {
                data.push('\n');
                data.push_str(value);
            }
            None => self.data = Some(value.to_owned()),
        }
    }
}

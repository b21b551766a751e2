//! HTTP/1.1 response builder and wire serialization.
//!
//! A [`Response`] is split by [`Response::into_wire`] into the serialized head
//! (plus the body, when it is buffered) and an optional [`BodyStream`] the
//! server writes fragment by fragment using the chosen [`Framing`].

use bytes::{BufMut, Bytes, BytesMut};

use super::{Body, BodyStream, Headers, StatusCode};

/// How a streamed body is delimited on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    /// `Transfer-Encoding: chunked` (HTTP/1.1 peers).
    Chunked,
    /// Body ends when the connection closes (HTTP/1.0 peers).
    CloseDelimited,
}

/// Terminating chunk of a chunked body.
pub const LAST_CHUNK: &[u8] = b"0\r\n\r\n";

/// An HTTP/1.1 response.
///
/// # Examples
///
/// ```
/// use buddy_relay::http::{Framing, Response, StatusCode};
///
/// let response = Response::new(StatusCode::InternalServerError)
///     .body("Server configuration error: missing OPENAI_API_KEY.");
///
/// let (head, stream) = response.into_wire(Framing::Chunked);
/// let text = std::str::from_utf8(&head).unwrap();
/// assert!(text.starts_with("HTTP/1.1 500 Internal Server Error\r\n"));
/// assert!(text.contains("Content-Length: 51\r\n"));
/// assert!(stream.is_none());
/// ```
#[derive(Debug)]
pub struct Response {
    status: StatusCode,
    headers: Headers,
    body: Body,
    keep_alive: bool,
}

impl Response {
    /// Creates a response with the given status and an empty body.
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: Headers::new(),
            body: Body::Empty,
            keep_alive: true,
        }
    }

    /// Appends a response header. Multiple calls with the same name are additive.
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Appends a header in place, for middleware decorating a downstream response.
    pub fn add_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.headers.insert(name, value);
    }

    /// Sets a buffered body.
    #[must_use]
    pub fn body(mut self, body: impl Into<Body>) -> Self {
        self.body = body.into();
        self
    }

    /// Sets a streamed body.
    #[must_use]
    pub fn stream(mut self, stream: BodyStream) -> Self {
        self.body = Body::Stream(stream);
        self
    }

    /// Controls whether `Connection: keep-alive` or `Connection: close` is written.
    #[must_use]
    pub fn keep_alive(mut self, keep_alive: bool) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// Returns `true` if the connection may be reused after this response.
    pub fn is_keep_alive(&self) -> bool {
        self.keep_alive
    }

    /// Consumes the response and returns its body.
    pub fn into_body(self) -> Body {
        self.body
    }

    /// Serializes the response head.
    ///
    /// Buffered bodies are appended to the returned buffer and written with a
    /// `Content-Length`. Streamed bodies are returned separately; the head
    /// then announces `framing` instead of a length. Close-delimited framing
    /// forces `Connection: close`.
    ///
    /// A `Content-Type: text/plain; charset=utf-8` header is added for
    /// non-empty bodies that do not set one.
    pub fn into_wire(mut self, framing: Framing) -> (BytesMut, Option<BodyStream>) {
        let (full, stream): (Option<Bytes>, Option<BodyStream>) = match self.body {
            Body::Empty => (None, None),
            Body::Full(bytes) => (Some(bytes), None),
            Body::Stream(stream) => (None, Some(stream)),
        };

        if (full.is_some() || stream.is_some()) && !self.headers.contains("content-type") {
            self.headers.insert("Content-Type", "text/plain; charset=utf-8");
        }

        let keep_alive = self.keep_alive && !(stream.is_some() && framing == Framing::CloseDelimited);
        self.headers
            .set("Connection", if keep_alive { "keep-alive" } else { "close" });

        match (&full, &stream, framing) {
            (_, Some(_), Framing::Chunked) => {
                self.headers.set("Transfer-Encoding", "chunked");
            }
            (_, Some(_), Framing::CloseDelimited) => {}
            (full, None, _) => {
                let length = full.as_ref().map_or(0, Bytes::len);
                self.headers.set("Content-Length", length.to_string());
            }
        }

        let body_len = full.as_ref().map_or(0, Bytes::len);
        let mut buf = BytesMut::with_capacity(128 + self.headers.len() * 64 + body_len);
        buf.put(
            format!(
                "HTTP/1.1 {} {}\r\n",
                self.status.as_u16(),
                self.status.canonical_reason()
            )
            .as_bytes(),
        );
        buf.put(self.headers.to_string().as_bytes());
        buf.put(&b"\r\n"[..]);
        if let Some(bytes) = full {
            buf.put(bytes);
        }

        (buf, stream)
    }
}

impl Default for Response {
    fn default() -> Self {
        Self::new(StatusCode::Ok)
    }
}

/// Encodes one body fragment for the given framing.
///
/// Returns `None` for empty fragments: a zero-length chunk would end a
/// chunked body early.
pub fn encode_fragment(fragment: &[u8], framing: Framing) -> Option<BytesMut> {
    if fragment.is_empty() {
        return None;
    }
    let mut buf = BytesMut::with_capacity(fragment.len() + 12);
    match framing {
        Framing::Chunked => {
            buf.put(format!("{:X}\r\n", fragment.len()).as_bytes());
            buf.put(fragment);
            buf.put(&b"\r\n"[..]);
        }
        Framing::CloseDelimited => buf.put(fragment),
    }
    Some(buf)
}

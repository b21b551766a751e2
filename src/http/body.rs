//! Response bodies.
//!
//! A body is either empty, a single buffer written with `Content-Length`, or a
//! stream of fragments the server writes one at a time as they are produced.

use std::fmt;
use std::pin::Pin;

use bytes::Bytes;
use futures::Stream;

/// A boxed stream of body fragments.
///
/// The stream ending is the only end-of-body signal; dropping it early (for
/// example when the peer disconnects) must release whatever produces the
/// fragments.
pub type BodyStream = Pin<Box<dyn Stream<Item = Bytes> + Send + 'static>>;

/// The payload of a [`Response`](super::Response).
pub enum Body {
    Empty,
    Full(Bytes),
    Stream(BodyStream),
}

impl Body {
    /// Wraps any `Send` stream of bytes-like fragments.
    pub fn from_stream<S, B>(stream: S) -> Self
    where
        S: Stream<Item = B> + Send + 'static,
        B: Into<Bytes> + 'static,
    {
        use futures::StreamExt;
        Self::Stream(Box::pin(stream.map(Into::into)))
    }

    /// Returns `true` if this body is streamed.
    pub fn is_stream(&self) -> bool {
        matches!(self, Self::Stream(_))
    }

    /// Returns the buffered length, or `None` for streamed bodies.
    pub fn len(&self) -> Option<usize> {
        match self {
            Self::Empty => Some(0),
            Self::Full(bytes) => Some(bytes.len()),
            Self::Stream(_) => None,
        }
    }

    /// Returns `true` if the body is known to be empty.
    pub fn is_empty(&self) -> bool {
        self.len() == Some(0)
    }
}

impl fmt::Debug for Body {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => f.write_str("Body::Empty"),
            Self::Full(bytes) => write!(f, "Body::Full({} bytes)", bytes.len()),
            Self::Stream(_) => f.write_str("Body::Stream(..)"),
        }
    }
}

impl From<String> for Body {
    fn from(s: String) -> Self {
        if s.is_empty() {
            Self::Empty
        } else {
            Self::Full(Bytes::from(s))
        }
    }
}

impl From<&'static str> for Body {
    fn from(s: &'static str) -> Self {
        if s.is_empty() {
            Self::Empty
        } else {
            Self::Full(Bytes::from_static(s.as_bytes()))
        }
    }
}

impl From<Vec<u8>> for Body {
    fn from(v: Vec<u8>) -> Self {
        if v.is_empty() {
            Self::Empty
        } else {
            Self::Full(Bytes::from(v))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[test]
    fn empty_string_is_empty_body() {
        assert!(Body::from(String::new()).is_empty());
        assert_eq!(Body::from("abc").len(), Some(3));
    }

    #[tokio::test]
    async fn stream_body_maps_items_to_bytes() {
        let body = Body::from_stream(futures::stream::iter(vec!["Hel", "lo"]));
        assert!(body.is_stream());
        assert_eq!(body.len(), None);
        let Body::Stream(stream) = body else {
            panic!("expected a stream body");
        };
        let parts: Vec<Bytes> = stream.collect().await;
        assert_eq!(parts, vec![Bytes::from("Hel"), Bytes::from("lo")]);
    }

    #[tokio::test]
    async fn stream_body_accepts_owned_fragments() {
        let fragments = vec!["I hear".to_owned(), " you".to_owned()];
        let Body::Stream(stream) = Body::from_stream(futures::stream::iter(fragments)) else {
            panic!("expected a stream body");
        };
        let parts: Vec<Bytes> = stream.collect().await;
        assert_eq!(parts.concat(), b"I hear you");
    }
}

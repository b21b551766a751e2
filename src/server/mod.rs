//! Async TCP server using Tokio.
//!
//! Accepts TCP connections and dispatches HTTP/1.1 requests to a handler
//! function. Connections are persistent (keep-alive) by default. Streamed
//! response bodies are written one fragment at a time, each flushed before the
//! next fragment is pulled, so a slow reader slows the producer instead of
//! growing a buffer. While a body streams the socket is also watched for the
//! peer going away; the body stream is dropped as soon as that happens.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::BytesMut;
use futures::StreamExt;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

use crate::http::{
    BodyStream, Framing, StatusCode,
    request::{Request, RequestError},
    response::{LAST_CHUNK, Response, encode_fragment},
};

/// Errors produced by the server.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to bind to {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
}

/// Maximum size of a complete HTTP request we will buffer before rejecting it (8 MiB).
const MAX_REQUEST_SIZE: usize = 8 * 1024 * 1024;

/// Initial read buffer capacity per connection.
const INITIAL_BUF_SIZE: usize = 4096;

const CONTINUE_LINE: &[u8] = b"HTTP/1.1 100 Continue\r\n\r\n";

/// The HTTP server.
///
/// # Examples
///
/// ```rust,no_run
/// use buddy_relay::server::Server;
/// use buddy_relay::http::{Request, Response, StatusCode};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let server = Server::bind("127.0.0.1:3000").await?;
///     server.run(|_req: Request| async {
///         Response::new(StatusCode::Ok).body("Hello!")
///     }).await?;
///     Ok(())
/// }
/// ```
pub struct Server {
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl Server {
    /// Binds the server to the given TCP address.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Bind`] if the address cannot be bound.
    pub async fn bind(addr: impl AsRef<str>) -> Result<Self, ServerError> {
        let addr = addr.as_ref();
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ServerError::Bind {
                addr: addr.to_owned(),
                source: e,
            })?;
        let local_addr = listener.local_addr()?;
        Ok(Self {
            listener,
            local_addr,
        })
    }

    /// Returns the local address the server is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accepts connections forever, dispatching requests to `handler`.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Io`] if the listener itself fails.
    pub async fn run<H, F>(self, handler: H) -> Result<(), ServerError>
    where
        H: Fn(Request) -> F + Send + Sync + 'static,
        F: Future<Output = Response> + Send + 'static,
    {
        self.run_until(handler, std::future::pending()).await
    }

    /// Accepts connections until `shutdown` resolves.
    ///
    /// Connections already accepted keep running to completion on their own
    /// tasks; only the accept loop stops.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Io`] if the listener itself fails.
    pub async fn run_until<H, F, S>(self, handler: H, shutdown: S) -> Result<(), ServerError>
    where
        H: Fn(Request) -> F + Send + Sync + 'static,
        F: Future<Output = Response> + Send + 'static,
        S: Future<Output = ()>,
    {
        let handler = Arc::new(handler);
        tokio::pin!(shutdown);
        info!(address = %self.local_addr, "buddy relay listening");

        loop {
            let (stream, peer_addr) = tokio::select! {
                () = &mut shutdown => {
                    info!(address = %self.local_addr, "shutdown requested, no longer accepting");
                    break;
                }
                accepted = self.listener.accept() => match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        error!(error = %e, "failed to accept connection");
                        continue;
                    }
                },
            };

            debug!(peer = %peer_addr, "connection accepted");
            let handler = Arc::clone(&handler);

            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, peer_addr, handler).await {
                    warn!(peer = %peer_addr, error = %e, "connection closed with error");
                }
            });
        }

        Ok(())
    }
}

/// How a streamed body ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BodyOutcome {
    Complete,
    PeerClosed,
}

enum StreamEvent {
    Fragment(Option<bytes::Bytes>),
    Read(std::io::Result<usize>),
}

/// Handles a single TCP connection over its lifetime.
///
/// Loops over requests until the peer closes the connection, asks for
/// `Connection: close`, or a framing error forces the connection shut.
async fn handle_connection<H, F>(
    mut stream: TcpStream,
    peer_addr: SocketAddr,
    handler: Arc<H>,
) -> Result<(), std::io::Error>
where
    H: Fn(Request) -> F + Send + Sync + 'static,
    F: Future<Output = Response> + Send + 'static,
{
    let mut buf = BytesMut::with_capacity(INITIAL_BUF_SIZE);
    let mut sent_continue = false;

    loop {
        let (head, body_offset) = match Request::parse(&buf) {
            Ok(pair) => pair,
            Err(RequestError::Incomplete) => {
                if buf.len() > MAX_REQUEST_SIZE {
                    warn!(peer = %peer_addr, "request head too large, sending 413");
                    reject(&mut stream, StatusCode::PayloadTooLarge, "Request entity too large")
                        .await?;
                    break;
                }
                if stream.read_buf(&mut buf).await? == 0 {
                    debug!(peer = %peer_addr, "connection closed by peer");
                    break;
                }
                continue;
            }
            Err(e) => {
                warn!(peer = %peer_addr, error = %e, "bad request, sending 400");
                reject(&mut stream, StatusCode::BadRequest, format!("Bad Request: {e}")).await?;
                break;
            }
        };

        if head.has_transfer_encoding() {
            warn!(peer = %peer_addr, "request transfer coding not supported, sending 501");
            reject(
                &mut stream,
                StatusCode::NotImplemented,
                "Request bodies must use Content-Length",
            )
            .await?;
            break;
        }

        let content_length = match head.content_length() {
            Ok(n) => n,
            Err(e) => {
                warn!(peer = %peer_addr, error = %e, "bad request, sending 400");
                reject(&mut stream, StatusCode::BadRequest, format!("Bad Request: {e}")).await?;
                break;
            }
        };

        let total_needed = body_offset.saturating_add(content_length);
        if total_needed > MAX_REQUEST_SIZE {
            warn!(peer = %peer_addr, content_length, "request body too large, sending 413");
            reject(&mut stream, StatusCode::PayloadTooLarge, "Request entity too large").await?;
            break;
        }

        if buf.len() < total_needed {
            if head.expects_continue() && !sent_continue {
                stream.write_all(CONTINUE_LINE).await?;
                stream.flush().await?;
                sent_continue = true;
            }
            if stream.read_buf(&mut buf).await? == 0 {
                debug!(peer = %peer_addr, "connection closed mid-body");
                break;
            }
            continue;
        }
        sent_continue = false;

        let mut frame = buf.split_to(total_needed);
        let body = frame.split_off(body_offset).freeze();
        let request = head.with_body(body);

        let keep_alive = request.is_keep_alive();
        let framing = if request.version() == 0 {
            Framing::CloseDelimited
        } else {
            Framing::Chunked
        };

        debug!(
            peer = %peer_addr,
            method = %request.method(),
            path = %request.path(),
            "dispatching request"
        );

        let response = handler(request).await;
        let keep_alive = keep_alive && response.is_keep_alive();
        let (head_bytes, body) = response.keep_alive(keep_alive).into_wire(framing);
        stream.write_all(&head_bytes).await?;

        match body {
            Some(body) => {
                let outcome = write_body(&mut stream, &mut buf, body, framing).await?;
                if outcome == BodyOutcome::PeerClosed {
                    debug!(peer = %peer_addr, "peer went away mid-stream, body dropped");
                    break;
                }
                if framing == Framing::CloseDelimited {
                    break;
                }
            }
            None => stream.flush().await?,
        }

        if !keep_alive {
            debug!(peer = %peer_addr, "Connection: close, shutting down");
            break;
        }
    }

    Ok(())
}

/// Writes a streamed body, one fragment per write + flush.
///
/// The socket is read concurrently so a closed peer is noticed even while
/// the body is waiting for its next fragment. Anything read in the meantime
/// (a pipelined request) stays in `buf`. A half-closed peer counts as gone.
async fn write_body(
    stream: &mut TcpStream,
    buf: &mut BytesMut,
    mut body: BodyStream,
    framing: Framing,
) -> Result<BodyOutcome, std::io::Error> {
    let mut fragments = 0usize;

    loop {
        let event = tokio::select! {
            next = body.next() => StreamEvent::Fragment(next),
            read = stream.read_buf(buf), if buf.len() <= MAX_REQUEST_SIZE => StreamEvent::Read(read),
        };

        match event {
            StreamEvent::Fragment(Some(fragment)) => {
                if let Some(encoded) = encode_fragment(&fragment, framing) {
                    stream.write_all(&encoded).await?;
                    stream.flush().await?;
                    fragments += 1;
                }
            }
            StreamEvent::Fragment(None) => {
                if framing == Framing::Chunked {
                    stream.write_all(LAST_CHUNK).await?;
                }
                stream.flush().await?;
                debug!(fragments, "streamed body complete");
                return Ok(BodyOutcome::Complete);
            }
            StreamEvent::Read(Ok(0)) => return Ok(BodyOutcome::PeerClosed),
            StreamEvent::Read(Ok(_)) => {}
            StreamEvent::Read(Err(e)) => return Err(e),
        }
    }
}

/// Writes a short error response and marks the connection for closing.
async fn reject(
    stream: &mut TcpStream,
    status: StatusCode,
    message: impl Into<String>,
) -> Result<(), std::io::Error> {
    let (bytes, _) = Response::new(status)
        .body(message.into())
        .keep_alive(false)
        .into_wire(Framing::Chunked);
    stream.write_all(&bytes).await?;
    stream.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::Body;

    async fn spawn<H, F>(handler: H) -> SocketAddr
    where
        H: Fn(Request) -> F + Send + Sync + 'static,
        F: Future<Output = Response> + Send + 'static,
    {
        let server = Server::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr();
        tokio::spawn(server.run(handler));
        addr
    }

    async fn exchange(addr: SocketAddr, raw: &[u8]) -> String {
        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(raw).await.unwrap();
        let mut out = Vec::new();
        client.read_to_end(&mut out).await.unwrap();
        String::from_utf8(out).unwrap()
    }

    #[tokio::test]
    async fn buffered_response_round_trip() {
        let addr = spawn(|req: Request| async move {
            Response::new(StatusCode::Ok).body(req.body().to_vec())
        })
        .await;
        let text = exchange(
            addr,
            b"POST /echo HTTP/1.1\r\nHost: x\r\nContent-Length: 4\r\nConnection: close\r\n\r\nping",
        )
        .await;
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.contains("Content-Length: 4\r\n"));
        assert!(text.ends_with("\r\n\r\nping"));
    }

    #[tokio::test]
    async fn streamed_response_is_chunked() {
        let addr = spawn(|_req: Request| async {
            Response::new(StatusCode::Ok).body(Body::from_stream(futures::stream::iter(vec![
                "Hel", "", "lo",
            ])))
        })
        .await;
        let text = exchange(addr, b"GET / HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n").await;
        assert!(text.contains("Transfer-Encoding: chunked\r\n"));
        assert!(text.ends_with("\r\n\r\n3\r\nHel\r\n2\r\nlo\r\n0\r\n\r\n"));
    }

    #[tokio::test]
    async fn http10_stream_is_close_delimited() {
        let addr = spawn(|_req: Request| async {
            Response::new(StatusCode::Ok)
                .body(Body::from_stream(futures::stream::iter(vec!["a", "b"])))
        })
        .await;
        let text = exchange(addr, b"GET / HTTP/1.0\r\n\r\n").await;
        assert!(text.contains("Connection: close\r\n"));
        assert!(text.ends_with("\r\n\r\nab"));
    }

    #[tokio::test]
    async fn split_body_is_reassembled() {
        let addr = spawn(|req: Request| async move {
            Response::new(StatusCode::Ok).body(req.body().to_vec())
        })
        .await;
        let mut client = TcpStream::connect(addr).await.unwrap();
        client
            .write_all(b"POST / HTTP/1.1\r\nContent-Length: 11\r\nConnection: close\r\n\r\nhello")
            .await
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        client.write_all(b" world").await.unwrap();
        let mut out = Vec::new();
        client.read_to_end(&mut out).await.unwrap();
        assert!(String::from_utf8(out).unwrap().ends_with("hello world"));
    }

    #[tokio::test]
    async fn expect_continue_gets_interim_response() {
        let addr = spawn(|req: Request| async move {
            Response::new(StatusCode::Ok).body(req.body().to_vec())
        })
        .await;
        let mut client = TcpStream::connect(addr).await.unwrap();
        client
            .write_all(b"POST / HTTP/1.1\r\nContent-Length: 2\r\nExpect: 100-continue\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let mut interim = vec![0u8; CONTINUE_LINE.len()];
        client.read_exact(&mut interim).await.unwrap();
        assert_eq!(interim, CONTINUE_LINE);
        client.write_all(b"{}").await.unwrap();
        let mut out = Vec::new();
        client.read_to_end(&mut out).await.unwrap();
        assert!(String::from_utf8(out).unwrap().ends_with("\r\n\r\n{}"));
    }

    #[tokio::test]
    async fn framing_errors_close_the_connection() {
        let addr = spawn(|_req: Request| async { Response::new(StatusCode::Ok) }).await;

        let text = exchange(addr, b"POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n").await;
        assert!(text.starts_with("HTTP/1.1 501 Not Implemented\r\n"));

        let text = exchange(addr, b"POST / HTTP/1.1\r\nContent-Length: 99999999999\r\n\r\n").await;
        assert!(text.starts_with("HTTP/1.1 413 Payload Too Large\r\n"));

        let text = exchange(addr, b"GARBAGE\x01 / HTTP/1.1\r\n\r\n").await;
        assert!(text.starts_with("HTTP/1.1 400 Bad Request\r\n"));
    }

    #[tokio::test]
    async fn keep_alive_serves_pipelined_requests() {
        let addr = spawn(|req: Request| async move {
            Response::new(StatusCode::Ok).body(req.path().to_owned())
        })
        .await;
        let text = exchange(
            addr,
            b"GET /one HTTP/1.1\r\nHost: x\r\n\r\nGET /two HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n",
        )
        .await;
        assert_eq!(text.matches("HTTP/1.1 200 OK").count(), 2);
        assert!(text.contains("/one"));
        assert!(text.ends_with("/two"));
    }

    #[tokio::test]
    async fn run_until_stops_accepting() {
        let server = Server::bind("127.0.0.1:0").await.unwrap();
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let task = tokio::spawn(server.run_until(
            |_req: Request| async { Response::new(StatusCode::Ok) },
            async {
                let _ = rx.await;
            },
        ));
        tx.send(()).unwrap();
        let result = tokio::time::timeout(std::time::Duration::from_secs(2), task)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
    }
}

//! Client side of a conversation with the relay.
//!
//! [`ChatSession`] keeps the visible history. Each [`send`](ChatSession::send)
//! appends the user's turn plus an empty assistant placeholder, posts the
//! history to the relay and folds every received chunk into the placeholder,
//! reporting one update per chunk. A finished, non-empty reply is spoken unless
//! it ends in the relay's error notice.

use async_stream::stream;
use futures::StreamExt;
use futures::stream::BoxStream;
use reqwest::Client;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, warn};

use crate::llm::{Message, Role};
use crate::relay;
use crate::voice::{RecognitionEvent, SpeechSynthesizer};

/// Placeholder text shown when the relay could not be reached.
pub const CONNECTION_ERROR_REPLY: &str = "Sorry, I ran into a connection issue.";

/// A turn as displayed locally. The id never leaves the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    pub id: u64,
    pub role: Role,
    pub content: String,
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("relay request failed: {0}")]
    Transport(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl From<reqwest::Error> for SessionError {
    fn from(e: reqwest::Error) -> Self {
        Self::Transport(Box::new(e))
    }
}

/// Text chunks of one relay reply, in arrival order.
pub type ChunkStream = BoxStream<'static, Result<String, SessionError>>;

/// Delivers a conversation to the relay and streams the reply back.
pub trait ChatTransport: Send + Sync {
    fn send(&self, history: Vec<Message>) -> ChunkStream;
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    messages: &'a [Message],
}

/// [`ChatTransport`] over HTTP: `POST {endpoint}` with `{ "messages": [...] }`.
#[derive(Clone)]
pub struct HttpTransport {
    http: Client,
    endpoint: String,
}

impl HttpTransport {
    pub fn new(endpoint: impl Into<String>) -> Result<Self, SessionError> {
        Ok(Self {
            http: Client::builder().build()?,
            endpoint: endpoint.into(),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

impl ChatTransport for HttpTransport {
    fn send(&self, history: Vec<Message>) -> ChunkStream {
        let http = self.http.clone();
        let endpoint = self.endpoint.clone();

        Box::pin(stream! {
            let request = http.post(&endpoint).json(&ChatRequest { messages: &history });
            let response = match request.send().await {
                Ok(response) => response,
                Err(e) => {
                    yield Err::<String, SessionError>(e.into());
                    return;
                }
            };
            // The relay reports configuration problems as a plain-text body,
            // which is shown to the user like any other reply.
            if !response.status().is_success() {
                warn!(status = response.status().as_u16(), "relay answered with an error status");
            }

            let mut body = Box::pin(response.bytes_stream());
            let mut decoder = Utf8Decoder::default();
            while let Some(chunk) = body.next().await {
                match chunk {
                    Ok(bytes) => {
                        let text = decoder.push(&bytes);
                        if !text.is_empty() {
                            yield Ok(text);
                        }
                    }
                    Err(e) => {
                        yield Err(e.into());
                        return;
                    }
                }
            }
            let tail = decoder.finish();
            if !tail.is_empty() {
                yield Ok(tail);
            }
        })
    }
}

/// Incremental UTF-8 decoding across chunk boundaries.
///
/// Incomplete trailing sequences are held back until the next chunk; invalid
/// bytes become U+FFFD.
#[derive(Debug, Default)]
struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    fn push(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);
        let mut out = String::new();
        let mut input = &self.pending[..];
        loop {
            match std::str::from_utf8(input) {
                Ok(valid) => {
                    out.push_str(valid);
                    input = &[];
                    break;
                }
                Err(e) => {
                    let (valid, rest) = input.split_at(e.valid_up_to());
                    out.push_str(&String::from_utf8_lossy(valid));
                    match e.error_len() {
                        Some(len) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            input = &rest[len..];
                        }
                        None => {
                            input = rest;
                            break;
                        }
                    }
                }
            }
        }
        let consumed = self.pending.len() - input.len();
        self.pending.drain(..consumed);
        out
    }

    fn finish(&mut self) -> String {
        let out = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        out
    }
}

/// A conversation as the user sees it.
pub struct ChatSession<T, S> {
    transport: T,
    synthesizer: S,
    messages: Vec<ChatMessage>,
    next_id: u64,
}

impl<T: ChatTransport, S: SpeechSynthesizer> ChatSession<T, S> {
    pub fn new(transport: T, synthesizer: S) -> Self {
        Self {
            transport,
            synthesizer,
            messages: Vec::new(),
            next_id: 1,
        }
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    fn push(&mut self, role: Role, content: String) -> usize {
        self.messages.push(ChatMessage {
            id: self.next_id,
            role,
            content,
        });
        self.next_id += 1;
        self.messages.len() - 1
    }

    /// Sends one user turn and streams the reply into the history.
    ///
    /// `on_update` sees the assistant message after every chunk. Returns the
    /// finished assistant message, or `None` if `text` is blank.
    pub async fn send<F>(&mut self, text: &str, mut on_update: F) -> Option<&ChatMessage>
    where
        F: FnMut(&ChatMessage),
    {
        let content = text.trim();
        if content.is_empty() {
            return None;
        }

        self.push(Role::User, content.to_owned());
        let history: Vec<Message> = self
            .messages
            .iter()
            .map(|m| Message::new(m.role, m.content.clone()))
            .collect();
        let reply = self.push(Role::Assistant, String::new());

        let mut chunks = self.transport.send(history);
        let mut failed = false;
        while let Some(chunk) = chunks.next().await {
            match chunk {
                Ok(text) => {
                    let message = &mut self.messages[reply];
                    message.content.push_str(&text);
                    on_update(&*message);
                }
                Err(e) => {
                    warn!(error = %e, "lost connection to the relay");
                    failed = true;
                    break;
                }
            }
        }

        let message = &mut self.messages[reply];
        if failed {
            if message.content.is_empty() {
                message.content = CONNECTION_ERROR_REPLY.to_owned();
                on_update(&*message);
            }
        } else if relay::is_error_reply(&message.content) {
            warn!("relay reported an upstream failure");
        } else if !message.content.is_empty() {
            if let Err(e) = self.synthesizer.speak(&message.content) {
                warn!(error = %e, "could not speak reply");
            }
        }
        Some(&self.messages[reply])
    }

    /// Handles a speech recognizer event. Transcripts are sent like typed text.
    pub async fn handle_recognition<F>(
        &mut self,
        event: RecognitionEvent,
        on_update: F,
    ) -> Option<&ChatMessage>
    where
        F: FnMut(&ChatMessage),
    {
        match event {
            RecognitionEvent::Result(transcript) => self.send(&transcript, on_update).await,
            RecognitionEvent::Error(description) => {
                warn!(%description, "speech recognition failed");
                None
            }
            RecognitionEvent::End => {
                debug!("speech recognition ended");
                None
            }
        }
    }
}

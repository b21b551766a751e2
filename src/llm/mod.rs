//! Chat-completion provider access.
//!
//! [`ChatCompletion`] is the seam the relay depends on: one call opens one
//! upstream streaming completion and yields its text deltas as a lazy
//! [`FragmentStream`]. [`CompletionClient`] implements it against an
//! OpenAI-compatible `/chat/completions` endpoint.

use std::time::Duration;

use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use thiserror::Error;

mod config;
mod openai;
pub mod sse;

pub use config::{
    CompletionConfig, DEFAULT_BASE_URL, DEFAULT_IDLE_TIMEOUT, DEFAULT_MODEL, DEFAULT_TEMPERATURE,
};
pub use openai::CompletionClient;

/// Author of a conversation turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    /// Parses a caller-supplied role; unknown roles yield `None`.
    pub fn parse(role: &str) -> Option<Self> {
        match role {
            "system" => Some(Self::System),
            "user" => Some(Self::User),
            "assistant" => Some(Self::Assistant),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

/// One conversation turn as sent upstream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }
}

/// Lazily produced text fragments of one completion, in arrival order.
///
/// An `Err` item is terminal: the stream yields nothing after it.
pub type FragmentStream = BoxStream<'static, Result<String, CompletionError>>;

/// Errors from constructing a client or streaming a completion.
#[derive(Debug, Error)]
pub enum CompletionError {
    #[error("missing provider API key")]
    MissingApiKey,

    #[error("invalid provider configuration: {0}")]
    InvalidConfig(String),

    #[error("{status} {message}")]
    Status { status: u16, message: String },

    #[error("provider error: {0}")]
    Provider(String),

    #[error("upstream request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("malformed completion chunk: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("malformed event stream: {0}")]
    EventStream(#[from] sse::EventTooLarge),

    #[error("upstream sent nothing for {0:?}")]
    IdleTimeout(Duration),
}

/// A provider able to stream one chat completion per call.
pub trait ChatCompletion: Send + Sync {
    /// Opens a new streaming completion for `messages`.
    ///
    /// Nothing is sent until the returned stream is first polled, and every
    /// call opens a fresh upstream request. Empty deltas are never yielded.
    /// Dropping the stream cancels the upstream request.
    fn stream_chat(&self, messages: Vec<Message>) -> FragmentStream;
}

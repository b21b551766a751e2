//! The chat relay: `POST /api/chat`.
//!
//! Accepts `{ "messages": [{ "role", "content" }] }`, prepends the fixed
//! [`SYSTEM_PROMPT`], opens one streaming completion and pipes every text
//! fragment to the caller as it arrives. Upstream failures are reported
//! in-band: the `200` head is already on the wire, so the body ends with
//! `"\n[Error] {description}"` instead.

use std::sync::Arc;

use async_stream::stream;
use bytes::Bytes;
use futures::StreamExt;
use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::context::Context;
use crate::http::BodyStream;
use crate::llm::{
    ChatCompletion, CompletionClient, CompletionConfig, CompletionError, FragmentStream, Message,
    Role,
};
use crate::middleware::{App, LoggerMiddleware};
use crate::router::Router;
use crate::security::CorsMiddleware;
use crate::{Response, StatusCode};

/// Path the relay is mounted on.
pub const CHAT_PATH: &str = "/api/chat";

/// Persona and guardrails sent as the first message of every completion.
pub const SYSTEM_PROMPT: &str = "You are \"Therapy Buddy\", a supportive, compassionate, voice-based CBT-informed companion.
- You are not a licensed therapist. Provide general emotional support and coping strategies.
- Encourage reflection, name emotions, validate feelings, and offer gentle, practical suggestions (CBT/DBT/ACT-inspired).
- Keep responses concise, warm, and spoken-friendly (short sentences, natural cadence).
- Avoid diagnoses or medical advice. If there is risk of harm, advise contacting local emergency services or a trusted person.
";

/// Body of the `500` answered when no provider credential is configured.
pub const CONFIG_ERROR_MESSAGE: &str = "Server configuration error: missing OPENAI_API_KEY.";

/// Tag that opens the in-band error notice.
pub const ERROR_MARKER: &str = "[Error]";

/// The notice appended to a reply when the upstream completion fails.
pub fn error_notice(description: impl std::fmt::Display) -> String {
    format!("\n{ERROR_MARKER} {description}")
}

/// Whether a received reply ends in an upstream failure notice.
pub fn is_error_reply(reply: &str) -> bool {
    reply.contains(&format!("\n{ERROR_MARKER} "))
}

/// Extracts the caller's messages from a parsed request body.
///
/// Anything that is not an object with a `messages` array yields an empty
/// conversation. Array elements without a string `role` and a string
/// `content`, or with an unknown role, are skipped. Extra fields such as a
/// display `id` are ignored.
pub fn parse_conversation(body: &Value) -> Vec<Message> {
    let Some(items) = body.get("messages").and_then(Value::as_array) else {
        return Vec::new();
    };
    items
        .iter()
        .filter_map(|item| {
            let role = Role::parse(item.get("role")?.as_str()?)?;
            let content = item.get("content")?.as_str()?;
            Some(Message::new(role, content))
        })
        .collect()
}

/// Builds the upstream conversation: the system prompt, then the caller's
/// `user` and `assistant` messages in their original order.
///
/// Caller-supplied `system` messages are dropped.
pub fn build_conversation(caller: Vec<Message>) -> Vec<Message> {
    let mut conversation = Vec::with_capacity(caller.len() + 1);
    conversation.push(Message::system(SYSTEM_PROMPT));
    conversation.extend(
        caller
            .into_iter()
            .filter(|m| matches!(m.role, Role::User | Role::Assistant)),
    );
    conversation
}

/// The relay handler.
///
/// Holds the completion backend, or nothing when the credential is missing.
/// Cheap to clone; every request gets its own upstream stream.
#[derive(Clone)]
pub struct ChatRelay {
    backend: Option<Arc<dyn ChatCompletion>>,
}

impl ChatRelay {
    pub fn new(backend: impl ChatCompletion + 'static) -> Self {
        Self {
            backend: Some(Arc::new(backend)),
        }
    }

    /// A relay that answers every call with the configuration error.
    pub fn unconfigured() -> Self {
        Self { backend: None }
    }

    /// Builds a relay backed by a [`CompletionClient`].
    ///
    /// A missing credential is not fatal: the relay starts unconfigured and
    /// reports the problem per request.
    ///
    /// # Errors
    ///
    /// Any other [`CompletionError`] from building the client.
    pub fn from_config(config: CompletionConfig) -> Result<Self, CompletionError> {
        match CompletionClient::new(config) {
            Ok(client) => Ok(Self::new(client)),
            Err(CompletionError::MissingApiKey) => {
                warn!("OPENAI_API_KEY is not set; {CHAT_PATH} will answer 500");
                Ok(Self::unconfigured())
            }
            Err(e) => Err(e),
        }
    }

    pub fn is_configured(&self) -> bool {
        self.backend.is_some()
    }

    /// Serves one relay call.
    pub async fn handle(&self, ctx: Context) -> Response {
        let request_id = ctx.request_id();
        let Some(backend) = &self.backend else {
            warn!(request_id, "relay called without a provider credential");
            return Response::new(StatusCode::InternalServerError).body(CONFIG_ERROR_MESSAGE);
        };

        let body: Value = ctx.json_or_default();
        let conversation = build_conversation(parse_conversation(&body));
        debug!(request_id, messages = conversation.len(), "relaying conversation");

        Response::new(StatusCode::Ok)
            .header("Content-Type", "text/plain; charset=utf-8")
            .header("Cache-Control", "no-cache, no-transform")
            .header("X-Accel-Buffering", "no")
            .stream(relay_body(backend.stream_chat(conversation), request_id))
    }
}

/// Turns completion fragments into response body chunks.
///
/// Ends after the upstream finishes or after the error notice. Dropping the
/// returned stream drops `fragments`, which cancels the upstream request.
fn relay_body(mut fragments: FragmentStream, request_id: u64) -> BodyStream {
    Box::pin(stream! {
        let mut relayed = 0usize;
        while let Some(item) = fragments.next().await {
            match item {
                Ok(text) if text.is_empty() => {}
                Ok(text) => {
                    relayed += 1;
                    yield Bytes::from(text);
                }
                Err(e) => {
                    warn!(request_id, relayed, error = %e, "upstream completion failed");
                    yield Bytes::from(error_notice(&e));
                    break;
                }
            }
        }
        debug!(request_id, relayed, "relay stream closed");
    })
}

/// Assembles the relay application: `POST /api/chat`, `GET /health`, request
/// logging, and CORS when `cors_origins` is non-empty.
pub fn app(relay: ChatRelay, cors_origins: Vec<String>) -> App {
    let configured = relay.is_configured();
    let mut router = Router::new();
    router.post(CHAT_PATH, move |ctx| {
        let relay = relay.clone();
        async move { relay.handle(ctx).await }
    });
    router.get("/health", move |_ctx| async move {
        Response::new(StatusCode::Ok)
            .header("Content-Type", "application/json")
            .body(json!({ "status": "ok", "provider_configured": configured }).to_string())
    });

    let app = App::new(router).layer(LoggerMiddleware);
    if cors_origins.is_empty() {
        app
    } else {
        app.layer(CorsMiddleware::new(cors_origins))
    }
}

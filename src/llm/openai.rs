//! OpenAI-compatible streaming chat-completion client.

use std::sync::Arc;
use std::time::Duration;

use async_stream::stream;
use futures::StreamExt;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::sse::SseDecoder;
use super::{ChatCompletion, CompletionConfig, CompletionError, FragmentStream, Message};

/// Streaming client for `POST {base_url}/chat/completions`.
///
/// Cheap to clone; clones share one connection pool. Holds no state beyond
/// its configuration.
///
/// # Examples
///
/// ```
/// use buddy_relay::llm::{CompletionClient, CompletionConfig, CompletionError};
///
/// assert!(matches!(
///     CompletionClient::new(CompletionConfig::default()),
///     Err(CompletionError::MissingApiKey)
/// ));
///
/// let client = CompletionClient::new(CompletionConfig::default().with_api_key("sk-test")).unwrap();
/// assert_eq!(client.model(), "gpt-4o-mini");
/// ```
#[derive(Clone)]
pub struct CompletionClient {
    inner: Arc<Inner>,
}

struct Inner {
    http: Client,
    api_key: SecretString,
    model: String,
    temperature: f32,
    endpoint: String,
    idle_timeout: Duration,
}

#[derive(Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    temperature: f32,
    messages: &'a [Message],
    stream: bool,
}

#[derive(Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
    #[serde(default)]
    error: Option<ApiError>,
}

#[derive(Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: Delta,
}

#[derive(Deserialize, Default)]
struct Delta {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
struct ApiError {
    #[serde(default)]
    message: String,
}

#[derive(Deserialize)]
struct ErrorBody {
    error: ApiError,
}

#[derive(Debug, PartialEq)]
enum ChunkEvent {
    Delta(String),
    Done,
}

impl CompletionClient {
    /// Builds a client. No network call is made.
    ///
    /// # Errors
    ///
    /// - [`CompletionError::MissingApiKey`] if the key is absent or blank.
    /// - [`CompletionError::InvalidConfig`] for a temperature outside
    ///   `0.0..=2.0` or a zero idle timeout.
    /// - [`CompletionError::Transport`] if the HTTP client cannot be built.
    pub fn new(config: CompletionConfig) -> Result<Self, CompletionError> {
        let api_key = config
            .api_key
            .filter(|key| !key.expose_secret().trim().is_empty())
            .ok_or(CompletionError::MissingApiKey)?;

        if !(0.0..=2.0).contains(&config.temperature) {
            return Err(CompletionError::InvalidConfig(format!(
                "temperature must be within 0.0..=2.0, got {}",
                config.temperature
            )));
        }
        if config.idle_timeout.is_zero() {
            return Err(CompletionError::InvalidConfig(
                "idle timeout must be non-zero".to_owned(),
            ));
        }

        let http = Client::builder()
            .connect_timeout(config.idle_timeout)
            .build()?;

        Ok(Self {
            inner: Arc::new(Inner {
                http,
                api_key,
                endpoint: format!("{}/chat/completions", config.base_url.trim_end_matches('/')),
                model: config.model,
                temperature: config.temperature,
                idle_timeout: config.idle_timeout,
            }),
        })
    }

    pub fn model(&self) -> &str {
        &self.inner.model
    }

    pub fn temperature(&self) -> f32 {
        self.inner.temperature
    }
}

impl Inner {
    /// Sends the request and waits for a successful response head.
    async fn open(&self, messages: &[Message]) -> Result<reqwest::Response, CompletionError> {
        let body = ChatCompletionRequest {
            model: &self.model,
            temperature: self.temperature,
            messages,
            stream: true,
        };
        let send = self
            .http
            .post(&self.endpoint)
            .bearer_auth(self.api_key.expose_secret())
            .json(&body)
            .send();

        let response = tokio::time::timeout(self.idle_timeout, send)
            .await
            .map_err(|_| CompletionError::IdleTimeout(self.idle_timeout))??;

        if !response.status().is_success() {
            return Err(self.status_error(response).await);
        }
        Ok(response)
    }

    /// Maps a non-2xx response to [`CompletionError::Status`], preferring the
    /// provider's `error.message`.
    async fn status_error(&self, response: reqwest::Response) -> CompletionError {
        let status = response.status();
        let body = tokio::time::timeout(self.idle_timeout, response.text())
            .await
            .ok()
            .and_then(Result::ok)
            .unwrap_or_default();

        let message = serde_json::from_str::<ErrorBody>(&body)
            .ok()
            .map(|b| b.error.message)
            .filter(|m| !m.is_empty())
            .unwrap_or_else(|| match body.trim() {
                "" => status.canonical_reason().unwrap_or("upstream error").to_owned(),
                text => text.to_owned(),
            });

        warn!(status = status.as_u16(), %message, "provider rejected completion request");
        CompletionError::Status {
            status: status.as_u16(),
            message,
        }
    }
}

fn parse_event(data: &str) -> Result<ChunkEvent, CompletionError> {
    if data.trim() == "[DONE]" {
        return Ok(ChunkEvent::Done);
    }
    let chunk: StreamChunk = serde_json::from_str(data)?;
    if let Some(error) = chunk.error {
        return Err(CompletionError::Provider(error.message));
    }
    Ok(ChunkEvent::Delta(
        chunk
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.delta.content)
            .unwrap_or_default(),
    ))
}

impl ChatCompletion for CompletionClient {
    fn stream_chat(&self, messages: Vec<Message>) -> FragmentStream {
        let inner = Arc::clone(&self.inner);

        Box::pin(stream! {
            let idle = inner.idle_timeout;
            debug!(model = %inner.model, messages = messages.len(), "opening upstream completion");

            let response = match inner.open(&messages).await {
                Ok(response) => response,
                Err(e) => {
                    yield Err::<String, CompletionError>(e);
                    return;
                }
            };

            let mut body = Box::pin(response.bytes_stream());
            let mut decoder = SseDecoder::default();
            let mut fragments = 0usize;

            loop {
                let chunk = match tokio::time::timeout(idle, body.next()).await {
                    Err(_) => {
                        warn!(?idle, fragments, "upstream went idle");
                        yield Err(CompletionError::IdleTimeout(idle));
                        return;
                    }
                    Ok(None) => break,
                    Ok(Some(Err(e))) => {
                        yield Err(CompletionError::Transport(e));
                        return;
                    }
                    Ok(Some(Ok(chunk))) => chunk,
                };

                let events = match decoder.push(&chunk) {
                    Ok(events) => events,
                    Err(e) => {
                        warn!(fragments, error = %e, "upstream event stream overflowed");
                        yield Err(e.into());
                        return;
                    }
                };
                for data in events {
                    match parse_event(&data) {
                        Ok(ChunkEvent::Done) => {
                            debug!(fragments, "upstream completion done");
                            return;
                        }
                        Ok(ChunkEvent::Delta(text)) => {
                            if !text.is_empty() {
                                fragments += 1;
                                yield Ok(text);
                            }
                        }
                        Err(e) => {
                            yield Err(e);
                            return;
                        }
                    }
                }
            }

            if let Some(data) = decoder.finish() {
                match parse_event(&data) {
                    Ok(ChunkEvent::Delta(text)) if !text.is_empty() => yield Ok(text),
                    Ok(_) => {}
                    Err(e) => {
                        yield Err(e);
                        return;
                    }
                }
            }
            debug!(fragments, "upstream body ended without [DONE]");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::Method::POST;
    use httpmock::MockServer;
    use serde_json::json;

    fn sse(deltas: &[&str]) -> String {
        let mut body = String::new();
        for delta in deltas {
            let chunk = json!({
                "id": "chatcmpl-test",
                "object": "chat.completion.chunk",
                "choices": [{ "index": 0, "delta": { "content": delta } }]
            });
            body.push_str(&format!("data: {chunk}\n\n"));
        }
        body
    }

    fn client(server: &MockServer) -> CompletionClient {
        CompletionClient::new(
            CompletionConfig::default()
                .with_api_key("sk-test")
                .with_base_url(server.url("/v1"))
                .with_idle_timeout(Duration::from_secs(5)),
        )
        .unwrap()
    }

    async fn collect(stream: FragmentStream) -> Vec<Result<String, CompletionError>> {
        stream.collect().await
    }

    #[test]
    fn parse_event_variants() {
        assert_eq!(parse_event("[DONE]").unwrap(), ChunkEvent::Done);
        assert_eq!(
            parse_event(r#"{"choices":[{"delta":{"role":"assistant"}}]}"#).unwrap(),
            ChunkEvent::Delta(String::new())
        );
        assert_eq!(
            parse_event(r#"{"choices":[{"delta":{"content":null}}]}"#).unwrap(),
            ChunkEvent::Delta(String::new())
        );
        assert!(matches!(
            parse_event(r#"{"error":{"message":"overloaded"}}"#),
            Err(CompletionError::Provider(m)) if m == "overloaded"
        ));
        assert!(matches!(parse_event("{oops"), Err(CompletionError::Decode(_))));
    }

    #[test]
    fn request_body_wire_format() {
        let messages = [Message::system("be kind"), Message::user("hi")];
        let body = ChatCompletionRequest {
            model: "gpt-4o-mini",
            temperature: 0.5,
            messages: &messages,
            stream: true,
        };
        assert_eq!(
            serde_json::to_value(&body).unwrap(),
            json!({
                "model": "gpt-4o-mini",
                "temperature": 0.5,
                "messages": [
                    { "role": "system", "content": "be kind" },
                    { "role": "user", "content": "hi" }
                ],
                "stream": true
            })
        );
    }

    #[test]
    fn construction_validates_config() {
        assert!(matches!(
            CompletionClient::new(CompletionConfig::default().with_api_key("   ")),
            Err(CompletionError::MissingApiKey)
        ));
        let mut config = CompletionConfig::default().with_api_key("sk");
        config.temperature = 3.0;
        assert!(matches!(
            CompletionClient::new(config),
            Err(CompletionError::InvalidConfig(_))
        ));
        let config = CompletionConfig::default()
            .with_api_key("sk")
            .with_idle_timeout(Duration::ZERO);
        assert!(matches!(
            CompletionClient::new(config),
            Err(CompletionError::InvalidConfig(_))
        ));
    }

    #[tokio::test]
    async fn streams_deltas_in_order_and_skips_empty_ones() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/v1/chat/completions")
                    .header("authorization", "Bearer sk-test");
                then.status(200)
                    .header("content-type", "text/event-stream")
                    .body(sse(&["Hel", "", "lo", " there"]) + "data: [DONE]\n\n");
            })
            .await;

        let items = collect(client(&server).stream_chat(vec![Message::user("hi")])).await;
        let fragments: Vec<String> = items.into_iter().map(Result::unwrap).collect();
        assert_eq!(fragments, vec!["Hel", "lo", " there"]);
        assert_eq!(fragments.concat(), "Hello there");
        mock.assert_calls(1);
    }

    #[tokio::test]
    async fn stream_is_lazy_and_each_call_opens_a_new_request() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST).path("/v1/chat/completions");
                then.status(200).body(sse(&["ok"]) + "data: [DONE]\n\n");
            })
            .await;

        let client = client(&server);
        drop(client.stream_chat(vec![Message::user("hi")]));
        mock.assert_calls(0);

        collect(client.stream_chat(vec![Message::user("a")])).await;
        collect(client.stream_chat(vec![Message::user("b")])).await;
        mock.assert_calls(2);
    }

    #[tokio::test]
    async fn events_after_done_are_ignored() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/v1/chat/completions");
                then.status(200)
                    .body(sse(&["one"]) + "data: [DONE]\n\n" + &sse(&["two"]));
            })
            .await;

        let items = collect(client(&server).stream_chat(vec![])).await;
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].as_ref().unwrap(), "one");
    }

    #[tokio::test]
    async fn body_end_without_done_finishes_normally() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/v1/chat/completions");
                then.status(200).body(sse(&["I hear", " you"]));
            })
            .await;

        let items = collect(client(&server).stream_chat(vec![])).await;
        let text: String = items.into_iter().map(Result::unwrap).collect();
        assert_eq!(text, "I hear you");
    }

    #[tokio::test]
    async fn provider_error_mid_stream_is_terminal() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/v1/chat/completions");
                then.status(200).body(
                    sse(&["I hear", " you"])
                        + "data: {\"error\":{\"message\":\"server overloaded\"}}\n\n"
                        + &sse(&["never"]),
                );
            })
            .await;

        let items = collect(client(&server).stream_chat(vec![])).await;
        assert_eq!(items.len(), 3);
        assert_eq!(items[0].as_ref().unwrap(), "I hear");
        assert_eq!(items[1].as_ref().unwrap(), " you");
        assert!(matches!(&items[2], Err(CompletionError::Provider(m)) if m == "server overloaded"));
    }

    #[tokio::test]
    async fn non_success_status_carries_provider_message() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/v1/chat/completions");
                then.status(401).json_body(json!({
                    "error": { "message": "Incorrect API key provided", "type": "invalid_request_error" }
                }));
            })
            .await;

        let items = collect(client(&server).stream_chat(vec![])).await;
        assert_eq!(items.len(), 1);
        let err = items.into_iter().next().unwrap().unwrap_err();
        assert_eq!(err.to_string(), "401 Incorrect API key provided");
    }

    #[tokio::test]
    async fn slow_upstream_hits_idle_timeout() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/v1/chat/completions");
                then.status(200)
                    .delay(Duration::from_secs(3))
                    .body(sse(&["late"]));
            })
            .await;

        let client = CompletionClient::new(
            CompletionConfig::default()
                .with_api_key("sk-test")
                .with_base_url(server.url("/v1"))
                .with_idle_timeout(Duration::from_millis(200)),
        )
        .unwrap();
        let items = collect(client.stream_chat(vec![])).await;
        assert_eq!(items.len(), 1);
        assert!(matches!(items[0], Err(CompletionError::IdleTimeout(_))));
    }

    #[tokio::test]
    async fn stalled_body_hits_idle_timeout() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        use tokio::net::TcpListener;
        use tokio::sync::oneshot;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (release, held) = oneshot::channel::<()>();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 4096];
            while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                let n = socket.read(&mut buf).await.unwrap();
                if n == 0 {
                    return;
                }
                request.extend_from_slice(&buf[..n]);
            }
            let event = sse(&["I hear"]);
            let response = format!(
                "HTTP/1.1 200 OK\r\nContent-Type: text/event-stream\r\n\
                 Transfer-Encoding: chunked\r\n\r\n{:X}\r\n{event}\r\n",
                event.len()
            );
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.flush().await.unwrap();
            // Keep the connection open with no further bytes.
            let _ = held.await;
        });

        let client = CompletionClient::new(
            CompletionConfig::default()
                .with_api_key("sk-test")
                .with_base_url(format!("http://{addr}/v1"))
                .with_idle_timeout(Duration::from_millis(300)),
        )
        .unwrap();
        let items = collect(client.stream_chat(vec![Message::user("hi")])).await;
        drop(release);

        assert_eq!(items.len(), 2);
        assert!(matches!(&items[0], Ok(text) if text == "I hear"));
        assert!(matches!(items[1], Err(CompletionError::IdleTimeout(_))));
    }

    #[tokio::test]
    async fn unreachable_provider_is_a_transport_error() {
        let client = CompletionClient::new(
            CompletionConfig::default()
                .with_api_key("sk-test")
                .with_base_url("http://127.0.0.1:1/v1"),
        )
        .unwrap();
        let items = collect(client.stream_chat(vec![Message::user("hi")])).await;
        assert_eq!(items.len(), 1);
        assert!(matches!(items[0], Err(CompletionError::Transport(_))));
    }
}

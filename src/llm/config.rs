use std::time::Duration;

use secrecy::SecretString;

pub const DEFAULT_MODEL: &str = "gpt-4o-mini";
pub const DEFAULT_TEMPERATURE: f32 = 0.8;
pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Settings for [`CompletionClient`](super::CompletionClient).
///
/// # Examples
///
/// ```
/// use buddy_relay::llm::CompletionConfig;
///
/// let config = CompletionConfig::default().with_api_key("sk-test");
/// assert_eq!(config.model, "gpt-4o-mini");
/// assert!(config.api_key.is_some());
/// ```
#[derive(Debug)]
pub struct CompletionConfig {
    /// Provider credential. Required to build a client.
    pub api_key: Option<SecretString>,
    pub model: String,
    pub temperature: f32,
    /// Base URL of an OpenAI-compatible API, without the `/chat/completions` suffix.
    pub base_url: String,
    /// Longest wait for upstream response headers or for the next body bytes.
    pub idle_timeout: Duration,
}

impl Default for CompletionConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            model: DEFAULT_MODEL.to_owned(),
            temperature: DEFAULT_TEMPERATURE,
            base_url: DEFAULT_BASE_URL.to_owned(),
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
        }
    }
}

impl CompletionConfig {
    #[must_use]
    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(SecretString::from(api_key.into()));
        self
    }

    #[must_use]
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    #[must_use]
    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }
}

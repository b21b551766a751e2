//! Command-line and environment configuration.

use std::time::Duration;

use clap::{ArgAction, Args, Parser, Subcommand};
use secrecy::SecretString;

use crate::llm::{CompletionConfig, DEFAULT_BASE_URL, DEFAULT_MODEL, DEFAULT_TEMPERATURE};

/// Buddy - a voice-friendly companion relay for chat-completion providers
#[derive(Parser)]
#[command(name = "buddy", version, about)]
pub struct Cli {
    /// Increase log verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Serve the chat relay over HTTP
    Serve(ServeArgs),
    /// Talk to a running relay from the terminal
    Chat(ChatArgs),
}

#[derive(Args)]
pub struct ServeArgs {
    /// Address to listen on
    #[arg(long, env = "BUDDY_BIND", default_value = "127.0.0.1:3000")]
    pub bind: String,

    /// Provider API key; without it the relay answers 500
    #[arg(long, env = "OPENAI_API_KEY", hide_env_values = true)]
    pub api_key: Option<String>,

    /// Model identifier
    #[arg(long, env = "BUDDY_MODEL", default_value = DEFAULT_MODEL)]
    pub model: String,

    /// Sampling temperature
    #[arg(long, env = "BUDDY_TEMPERATURE", default_value_t = DEFAULT_TEMPERATURE)]
    pub temperature: f32,

    /// Base URL of an OpenAI-compatible API
    #[arg(long, env = "OPENAI_BASE_URL", default_value = DEFAULT_BASE_URL)]
    pub base_url: String,

    /// Seconds to wait for upstream headers or the next upstream bytes
    #[arg(long, env = "BUDDY_IDLE_TIMEOUT_SECS", default_value_t = 60)]
    pub idle_timeout_secs: u64,

    /// Browser origin allowed to call the relay (repeatable)
    #[arg(long = "cors-origin", env = "BUDDY_CORS_ORIGINS", value_delimiter = ',')]
    pub cors_origins: Vec<String>,
}

#[derive(Args)]
pub struct ChatArgs {
    /// Relay URL
    #[arg(long, env = "BUDDY_ENDPOINT", default_value = "http://127.0.0.1:3000/api/chat")]
    pub endpoint: String,

    /// Program used to speak replies, e.g. "espeak" or "say"
    #[arg(long, env = "BUDDY_SPEAK")]
    pub speak_command: Option<String>,
}

impl Cli {
    /// Log filter used when neither `BUDDY_LOG` nor `RUST_LOG` is set.
    pub fn default_log_directive(&self) -> &'static str {
        match self.verbose {
            0 => "info",
            1 => "info,buddy_relay=debug",
            2 => "debug",
            _ => "trace",
        }
    }
}

impl ServeArgs {
    pub fn completion_config(&self) -> CompletionConfig {
        CompletionConfig {
            api_key: self.api_key.clone().map(SecretString::from),
            model: self.model.clone(),
            temperature: self.temperature,
            base_url: self.base_url.clone(),
            idle_timeout: Duration::from_secs(self.idle_timeout_secs),
        }
    }

    /// Configured origins with blanks removed.
    pub fn cors_origins(&self) -> Vec<String> {
        self.cors_origins
            .iter()
            .map(|o| o.trim())
            .filter(|o| !o.is_empty())
            .map(str::to_owned)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;

    fn serve(args: &[&str]) -> ServeArgs {
        let cli = Cli::try_parse_from(["buddy", "serve"].iter().chain(args)).unwrap();
        match cli.command {
            Command::Serve(args) => args,
            Command::Chat(_) => panic!("expected serve"),
        }
    }

    #[test]
    fn serve_flags_build_completion_config() {
        let args = serve(&[
            "--api-key",
            "sk-test",
            "--model",
            "gpt-4o",
            "--temperature",
            "0.2",
            "--base-url",
            "http://localhost:8080/v1",
            "--idle-timeout-secs",
            "5",
        ]);
        let config = args.completion_config();
        assert_eq!(config.api_key.unwrap().expose_secret(), "sk-test");
        assert_eq!(config.model, "gpt-4o");
        assert!((config.temperature - 0.2).abs() < f32::EPSILON);
        assert_eq!(config.base_url, "http://localhost:8080/v1");
        assert_eq!(config.idle_timeout, Duration::from_secs(5));
    }

    #[test]
    fn cors_origins_accept_repeats_and_commas() {
        let args = serve(&[
            "--cors-origin",
            "https://a.test,https://b.test",
            "--cors-origin",
            " ",
            "--cors-origin",
            "https://c.test",
        ]);
        assert_eq!(
            args.cors_origins(),
            vec!["https://a.test", "https://b.test", "https://c.test"]
        );
    }

    #[test]
    fn chat_flags_and_global_verbosity() {
        let cli = Cli::try_parse_from(["buddy", "-vv", "chat", "--speak-command", "espeak"]).unwrap();
        assert_eq!(cli.default_log_directive(), "debug");
        let Command::Chat(args) = cli.command else {
            panic!("expected chat");
        };
        assert_eq!(args.speak_command.as_deref(), Some("espeak"));
    }

    #[test]
    fn subcommand_is_required() {
        assert!(Cli::try_parse_from(["buddy"]).is_err());
        assert!(Cli::try_parse_from(["buddy", "serve", "--temperature", "warm"]).is_err());
    }
}

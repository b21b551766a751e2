//! # buddy-relay
//!
//! A voice-friendly chat companion built on a small async HTTP/1.1 server.
//!
//! The server exposes one streaming operation, `POST /api/chat`: it prepends
//! a fixed system prompt to the caller's conversation, opens a streaming
//! completion against an OpenAI-compatible provider and forwards every text
//! fragment to the caller as it arrives.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use buddy_relay::llm::CompletionConfig;
//! use buddy_relay::relay::{self, ChatRelay};
//! use buddy_relay::server::Server;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let relay = ChatRelay::from_config(CompletionConfig::default().with_api_key("sk-..."))?;
//!     let app = relay::app(relay, Vec::new()).into_handler();
//!
//!     let server = Server::bind("127.0.0.1:3000").await?;
//!     server
//!         .run(move |req| {
//!             let app = app.clone();
//!             async move { app.handle(req).await }
//!         })
//!         .await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod context;
pub mod http;
pub mod llm;
pub mod middleware;
pub mod relay;
pub mod router;
pub mod security;
pub mod server;
pub mod session;
pub mod voice;

pub use http::{Headers, Method, Request, Response, StatusCode};
pub use middleware::App;
pub use router::Router;
pub use server::{Server, ServerError};

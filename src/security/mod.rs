//! Cross-origin access for browser clients served from another origin.
//!
//! The relay is same-origin by default. [`CorsMiddleware`] is only installed
//! when at least one origin is configured.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::{
    Method, Response, StatusCode,
    context::Context,
    middleware::{Middleware, Next},
};

/// CORS middleware. Validates the `Origin` header, answers preflight
/// requests, and adds `Access-Control-*` headers to actual responses.
///
/// # Behavior
///
/// - No `Origin` header, or an origin not in the allow-list: the request
///   passes through unmodified.
/// - `OPTIONS` preflight from an allowed origin: `204 No Content` with the
///   allow headers; the router is not called.
/// - Anything else from an allowed origin: the response is decorated.
/// - `Vary: Origin` is added unless the allow-list is the wildcard `*`.
///
/// # Examples
///
/// ```rust
/// use buddy_relay::security::CorsMiddleware;
///
/// let cors = CorsMiddleware::new(["https://buddy.example.com"]);
/// assert!(cors.allows("https://buddy.example.com"));
/// assert!(!cors.allows("https://evil.example.com"));
/// ```
pub struct CorsMiddleware {
    allowed_origins: Arc<[String]>,
    allowed_methods: &'static str,
    allowed_headers: &'static str,
}

impl CorsMiddleware {
    /// Creates a policy allowing `origins` to `POST` JSON to the relay.
    pub fn new<I, S>(origins: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            allowed_origins: origins.into_iter().map(Into::into).collect(),
            allowed_methods: "POST, OPTIONS",
            allowed_headers: "Content-Type",
        }
    }

    /// Returns `true` if `origin` may access the relay.
    pub fn allows(&self, origin: &str) -> bool {
        self.allowed_origins.iter().any(|o| o == "*" || o == origin)
    }

    fn is_wildcard(&self) -> bool {
        self.allowed_origins.iter().any(|o| o == "*")
    }
}

impl Middleware for CorsMiddleware {
    fn handle(&self, ctx: Context, next: Next) -> Pin<Box<dyn Future<Output = Response> + Send>> {
        let origin = ctx
            .request()
            .headers()
            .get("origin")
            .filter(|origin| self.allows(origin))
            .map(str::to_owned);
        let is_preflight = ctx.request().method() == &Method::Options;
        let wildcard = self.is_wildcard();
        let methods = self.allowed_methods;
        let headers = self.allowed_headers;

        Box::pin(async move {
            let Some(origin) = origin else {
                return next.run(ctx).await;
            };
            let allow_origin = if wildcard { "*".to_owned() } else { origin };

            let mut resp = if is_preflight {
                Response::new(StatusCode::NoContent).header("Access-Control-Max-Age", "3600")
            } else {
                next.run(ctx).await
            };
            resp.add_header("Access-Control-Allow-Origin", allow_origin);
            resp.add_header("Access-Control-Allow-Methods", methods);
            resp.add_header("Access-Control-Allow-Headers", headers);
            if !wildcard {
                resp.add_header("Vary", "Origin");
            }
            resp
        })
    }
}

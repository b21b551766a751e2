//! Middleware pipeline: composable before/after request handler logic.
//!
//! ## Core types
//!
//! - [`Middleware`]: trait implemented by all middleware.
//! - [`Next`]: cursor into the remaining chain; [`Next::run`] advances it and
//!   dispatches to the [`Router`] once every middleware has run.
//! - [`App`]: a router wrapped in an ordered middleware stack; the entry point
//!   the server calls for every request.
//! - [`LoggerMiddleware`]: built-in request logger.

use std::{future::Future, pin::Pin, sync::Arc};
use tokio::time::Instant;

use crate::{Request, Response, context::Context, router::Router};

/// A type-erased, reference-counted middleware.
pub type MiddlewareHandler = Arc<dyn Middleware>;

/// A cursor into the remaining middleware chain for a single request.
///
/// `Next` is consumed by [`run`](Self::run), so a middleware can forward a
/// request at most once.
pub struct Next {
    middlewares: Arc<[MiddlewareHandler]>,
    router: Arc<Router>,
    // Tracks which middleware to invoke on the next `run` call.
    index: usize,
}

impl Next {
    /// Invokes the next middleware, or the router once the chain is exhausted.
    pub async fn run(mut self, ctx: Context) -> Response {
        match self.middlewares.get(self.index).cloned() {
            Some(middleware) => {
                self.index += 1;
                middleware.handle(ctx, self).await
            }
            None => self.router.route(ctx).await,
        }
    }
}

/// The core trait for all middleware.
///
/// Implementors may pass the request through (`next.run(ctx).await`),
/// short-circuit with their own [`Response`], or decorate the downstream
/// response. A decorated streaming response keeps its body stream untouched;
/// middleware only sees the status and headers.
pub trait Middleware: Send + Sync {
    fn handle(&self, ctx: Context, next: Next) -> Pin<Box<dyn Future<Output = Response> + Send>>;
}

/// A router wrapped in an ordered middleware stack.
///
/// Middleware registered first runs outermost.
///
/// # Examples
///
/// ```rust,no_run
/// use buddy_relay::{App, Router, Response, StatusCode};
/// use buddy_relay::middleware::LoggerMiddleware;
///
/// let mut router = Router::new();
/// router.get("/health", |_ctx| async { Response::new(StatusCode::Ok).body("ok") });
/// let app = App::new(router).layer(LoggerMiddleware);
/// ```
pub struct App {
    middlewares: Vec<MiddlewareHandler>,
    router: Router,
}

impl App {
    pub fn new(router: Router) -> Self {
        Self {
            middlewares: Vec::new(),
            router,
        }
    }

    /// Appends a middleware to the stack.
    #[must_use]
    pub fn layer(mut self, middleware: impl Middleware + 'static) -> Self {
        self.middlewares.push(Arc::new(middleware));
        self
    }

    /// Freezes the stack into a cheaply cloneable request handler.
    pub fn into_handler(self) -> AppHandler {
        AppHandler {
            middlewares: self.middlewares.into(),
            router: Arc::new(self.router),
        }
    }
}

/// A frozen [`App`], shared by every connection task.
#[derive(Clone)]
pub struct AppHandler {
    middlewares: Arc<[MiddlewareHandler]>,
    router: Arc<Router>,
}

impl AppHandler {
    /// Runs `request` through the middleware stack and the router.
    pub async fn handle(&self, request: Request) -> Response {
        let next = Next {
            middlewares: Arc::clone(&self.middlewares),
            router: Arc::clone(&self.router),
            index: 0,
        };
        next.run(Context::new(request)).await
    }
}

/// Logs each request's id, method, path, status, and time to response head.
///
/// For streamed bodies the logged duration covers only the time until the
/// response head was produced; the body keeps streaming afterwards.
pub struct LoggerMiddleware;

impl Middleware for LoggerMiddleware {
    fn handle(&self, ctx: Context, next: Next) -> Pin<Box<dyn Future<Output = Response> + Send>> {
        Box::pin(async move {
            let start = Instant::now();
            let request_id = ctx.request_id();
            let method = ctx.request().method().as_str().to_owned();
            let path = ctx.request().path().to_owned();

            let response = next.run(ctx).await;

            tracing::info!(
                request_id,
                %method,
                %path,
                status = response.status().as_u16(),
                elapsed = ?start.elapsed(),
                "request served"
            );

            response
        })
    }
}

//! Request routing: map exact paths and HTTP methods to handler functions.
//!
//! Routes are matched on the path without its query string. Trailing slashes
//! are normalized on both patterns and incoming paths, so `/api/chat/` and
//! `/api/chat` are equivalent.
//!
//! A path that is registered for other methods answers `405 Method Not
//! Allowed` with an `Allow` header; an unknown path answers `404 Not Found`.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::context::Context;
use crate::{Method, Response, StatusCode};

/// Type-erased, heap-allocated async handler.
pub type Handler =
    Arc<dyn Fn(Context) -> Pin<Box<dyn Future<Output = Response> + Send>> + Send + Sync + 'static>;

/// Conversion trait for async handler functions.
///
/// Any `Fn(Context) -> impl Future<Output = Response> + Send` that is also
/// `Send + Sync + 'static` implements this trait via the blanket impl below.
pub trait IntoHandler: Send + Sync + 'static {
    /// Call the handler with the given context, boxing the returned future.
    fn call(&self, ctx: Context) -> Pin<Box<dyn Future<Output = Response> + Send>>;
}

impl<T, F> IntoHandler for T
where
    T: Fn(Context) -> F + Send + Sync + 'static,
    F: Future<Output = Response> + Send + 'static,
{
    fn call(&self, ctx: Context) -> Pin<Box<dyn Future<Output = Response> + Send>> {
        Box::pin((self)(ctx))
    }
}

fn normalize(path: &str) -> &str {
    if path != "/" && path.ends_with('/') {
        &path[..path.len() - 1]
    } else {
        path
    }
}

struct Route {
    method: Method,
    path: String,
    handler: Handler,
}

/// HTTP request router.
///
/// Routes are evaluated in registration order; the first route whose method
/// and path both match wins.
///
/// # Examples
///
/// ```rust,no_run
/// use buddy_relay::{Router, Response, StatusCode};
///
/// let mut router = Router::new();
/// router.post("/api/chat", |_ctx| async { Response::new(StatusCode::Ok) });
/// assert_eq!(router.len(), 1);
/// ```
pub struct Router {
    routes: Vec<Route>,
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}

impl Router {
    pub fn new() -> Self {
        Self { routes: Vec::new() }
    }

    /// Register a handler for `GET` requests on `path`.
    pub fn get(&mut self, path: &str, handler: impl IntoHandler) {
        self.add_route(Method::Get, path, handler);
    }

    /// Register a handler for `POST` requests on `path`.
    pub fn post(&mut self, path: &str, handler: impl IntoHandler) {
        self.add_route(Method::Post, path, handler);
    }

    // Erase the concrete handler type and store it as a `Handler` trait object.
    fn add_route(&mut self, method: Method, path: &str, handler: impl IntoHandler) {
        let handler: Handler = Arc::new(move |ctx| handler.call(ctx));
        self.routes.push(Route {
            method,
            path: normalize(path).to_owned(),
            handler,
        });
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Dispatch `ctx` to the first matching route.
    pub async fn route(&self, ctx: Context) -> Response {
        let path = normalize(ctx.request().path());
        let method = ctx.request().method();

        if let Some(route) = self
            .routes
            .iter()
            .find(|r| r.path == path && &r.method == method)
        {
            let handler = Arc::clone(&route.handler);
            return handler(ctx).await;
        }

        let allowed: Vec<&str> = self
            .routes
            .iter()
            .filter(|r| r.path == path)
            .map(|r| r.method.as_str())
            .collect();

        if allowed.is_empty() {
            Response::new(StatusCode::NotFound).body("Not Found")
        } else {
            Response::new(StatusCode::MethodNotAllowed)
                .header("Allow", allowed.join(", "))
                .body("Method Not Allowed")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::request::Request;

    fn make_ctx(method: &str, path: &str) -> Context {
        let raw = format!("{method} {path} HTTP/1.1\r\nHost: localhost\r\n\r\n");
        let (req, _) = Request::parse(raw.as_bytes()).unwrap();
        Context::new(req)
    }

    fn router() -> Router {
        let mut router = Router::new();
        router.post("/api/chat", |_ctx| async { Response::new(StatusCode::Ok) });
        router.get("/api/chat", |_ctx| async { Response::new(StatusCode::NoContent) });
        router
    }

    #[test]
    fn router_starts_empty() {
        assert!(Router::default().is_empty());
        assert_eq!(router().len(), 2);
    }

    #[tokio::test]
    async fn exact_match_dispatches_by_method() {
        let router = router();
        assert_eq!(router.route(make_ctx("POST", "/api/chat")).await.status(), StatusCode::Ok);
        assert_eq!(
            router.route(make_ctx("GET", "/api/chat")).await.status(),
            StatusCode::NoContent
        );
    }

    #[tokio::test]
    async fn trailing_slash_and_query_are_ignored() {
        let router = router();
        let res = router.route(make_ctx("POST", "/api/chat/?stream=1")).await;
        assert_eq!(res.status(), StatusCode::Ok);
    }

    #[tokio::test]
    async fn unknown_path_is_404() {
        let res = router().route(make_ctx("POST", "/api/other")).await;
        assert_eq!(res.status(), StatusCode::NotFound);
    }

    #[tokio::test]
    async fn wrong_method_is_405_with_allow() {
        let res = router().route(make_ctx("DELETE", "/api/chat")).await;
        assert_eq!(res.status(), StatusCode::MethodNotAllowed);
        assert_eq!(res.headers().get("allow"), Some("POST, GET"));
    }

    #[tokio::test]
    async fn first_matching_route_wins() {
        let mut router = Router::new();
        router.post("/p", |_ctx| async { Response::new(StatusCode::Ok) });
        router.post("/p", |_ctx| async { Response::new(StatusCode::NoContent) });
        assert_eq!(router.route(make_ctx("POST", "/p")).await.status(), StatusCode::Ok);
    }
}

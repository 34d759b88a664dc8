//! Request middleware chain.
//!
//! User middlewares run in registration order, each behind its own skip
//! check. The built-in request logger and panic recovery wrap the whole
//! chain.

pub mod recovery;
pub mod request_log;

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::{ConnectInfo, Request, State};
use axum::middleware::{from_fn_with_state, Next};
use axum::response::Response;
use axum::Router;

pub use recovery::recover;
pub use request_log::log_requests;

// ---------------------------------------------------------------------------
// Middleware trait
// ---------------------------------------------------------------------------

/// A request interceptor registered with the web host builder.
///
/// `handle` receives the request and the rest of the chain; calling
/// `next.run(request)` continues it. A middleware may also answer without
/// calling `next`.
#[async_trait]
pub trait Middleware: Send + Sync + 'static {
    async fn handle(&self, request: Request, next: Next) -> Response;

    /// Paths this middleware does not run for. Checked before `handle`.
    fn should_skip(&self, _path: &str) -> bool {
        false
    }
}

async fn run_middleware(
    State(middleware): State<Arc<dyn Middleware>>,
    request: Request,
    next: Next,
) -> Response {
    if middleware.should_skip(request.uri().path()) {
        return next.run(request).await;
    }
    middleware.handle(request, next).await
}

/// Wraps `router` so that `middlewares` run in the given order, first outermost.
pub fn apply_middlewares(mut router: Router, middlewares: &[Arc<dyn Middleware>]) -> Router {
    for middleware in middlewares.iter().rev() {
        router = router.layer(from_fn_with_state(Arc::clone(middleware), run_middleware));
    }
    router
}

// ---------------------------------------------------------------------------
// SkipPaths
// ---------------------------------------------------------------------------

/// Exact, case-sensitive path set for [`Middleware::should_skip`].
///
/// `/hello` matches only `/hello`; not `/hello/`, `/Hello` or `/hello/world`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SkipPaths {
    paths: HashSet<String>,
}

impl SkipPaths {
    #[must_use]
    pub fn new<I, S>(paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            paths: paths.into_iter().map(Into::into).collect(),
        }
    }

    #[must_use]
    pub fn contains(&self, path: &str) -> bool {
        self.paths.contains(path)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.paths.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }
}

/// Best-effort client address: `X-Forwarded-For`, then `X-Real-Ip`, then the peer address.
#[must_use]
pub fn client_ip(request: &Request) -> String {
    let headers = request.headers();
    if let Some(forwarded) = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty())
    {
        return forwarded.to_string();
    }
    if let Some(real) = headers
        .get("x-real-ip")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
    {
        return real.to_string();
    }
    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map_or_else(|| "-".to_string(), |ConnectInfo(addr)| addr.ip().to_string())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::{HeaderValue, StatusCode};
    use axum::routing::get;
    use parking_lot::Mutex;
    use tower::ServiceExt;

    use super::*;

    /// Records its name on every request it handles.
    struct Tagger {
        name: &'static str,
        skip: SkipPaths,
        log: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl Middleware for Tagger {
        async fn handle(&self, request: Request, next: Next) -> Response {
            self.log
                .lock()
                .push(format!("{}:{}", self.name, request.uri().path()));
            let mut response = next.run(request).await;
            response
                .headers_mut()
                .append("x-seen-by", HeaderValue::from_static(self.name));
            response
        }

        fn should_skip(&self, path: &str) -> bool {
            self.skip.contains(path)
        }
    }

    /// Answers 401 without calling the rest of the chain.
    struct Deny;

    #[async_trait]
    impl Middleware for Deny {
        async fn handle(&self, _request: Request, _next: Next) -> Response {
            Response::builder()
                .status(StatusCode::UNAUTHORIZED)
                .body(Body::empty())
                .unwrap_or_default()
        }

        fn should_skip(&self, path: &str) -> bool {
            path == "/public"
        }
    }

    fn router() -> Router {
        Router::new()
            .route("/hello", get(|| async { "hi" }))
            .route("/hello/", get(|| async { "hi/" }))
            .route("/Hello", get(|| async { "Hi" }))
            .route("/public", get(|| async { "public" }))
    }

    async fn call(app: &Router, path: &str) -> Response {
        app.clone()
            .oneshot(Request::builder().uri(path).body(Body::empty()).unwrap())
            .await
            .unwrap()
    }

    #[test]
    fn skip_paths_match_exactly() {
        let skip = SkipPaths::new(["/hello"]);
        assert!(skip.contains("/hello"));
        assert!(!skip.contains("/hello/"));
        assert!(!skip.contains("/Hello"));
        assert!(!skip.contains("/hello/world"));
        assert_eq!(skip.len(), 1);
    }

    #[tokio::test]
    async fn skipped_path_bypasses_only_that_middleware() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let middlewares: Vec<Arc<dyn Middleware>> = vec![Arc::new(Tagger {
            name: "auth",
            skip: SkipPaths::new(["/hello"]),
            log: Arc::clone(&log),
        })];
        let app = apply_middlewares(router(), &middlewares);

        for path in ["/hello", "/hello/", "/Hello"] {
            let response = call(&app, path).await;
            assert_eq!(response.status(), StatusCode::OK);
        }
        assert_eq!(*log.lock(), vec!["auth:/hello/", "auth:/Hello"]);
    }

    #[tokio::test]
    async fn middlewares_run_in_registration_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let tagger = |name| -> Arc<dyn Middleware> {
            Arc::new(Tagger {
                name,
                skip: SkipPaths::default(),
                log: Arc::clone(&log),
            })
        };
        let app = apply_middlewares(router(), &[tagger("first"), tagger("second")]);

        let response = call(&app, "/hello").await;
        let seen: Vec<_> = response
            .headers()
            .get_all("x-seen-by")
            .iter()
            .map(|v| v.to_str().unwrap().to_string())
            .collect();
        assert_eq!(*log.lock(), vec!["first:/hello", "second:/hello"]);
        // Responses travel back through the chain in reverse.
        assert_eq!(seen, vec!["second", "first"]);
    }

    #[tokio::test]
    async fn middleware_can_short_circuit() {
        let app = apply_middlewares(router(), &[Arc::new(Deny) as Arc<dyn Middleware>]);
        assert_eq!(call(&app, "/hello").await.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(call(&app, "/public").await.status(), StatusCode::OK);
    }

    #[test]
    fn client_ip_prefers_forwarded_headers() {
        let request = Request::builder()
            .header("x-forwarded-for", "203.0.113.7, 10.0.0.1")
            .body(Body::empty())
            .unwrap();
        assert_eq!(client_ip(&request), "203.0.113.7");

        let request = Request::builder()
            .header("x-real-ip", "198.51.100.2")
            .body(Body::empty())
            .unwrap();
        assert_eq!(client_ip(&request), "198.51.100.2");

        let mut request = Request::builder().body(Body::empty()).unwrap();
        assert_eq!(client_ip(&request), "-");
        request
            .extensions_mut()
            .insert(ConnectInfo(SocketAddr::from(([127, 0, 0, 1], 4000))));
        assert_eq!(client_ip(&request), "127.0.0.1");
    }
}

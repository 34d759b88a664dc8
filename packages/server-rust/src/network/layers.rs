//! Transport-level Tower layers applied to every request.
//!
//! Ordering follows the outer-to-inner convention: the first layer listed is
//! the outermost (processes the request first on the way in, and the
//! response last on the way out).

use std::time::Duration;

use axum::http::header::HeaderName;
use axum::http::{Method, Request, StatusCode};
use tower::ServiceBuilder;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::timeout::{RequestBodyTimeoutLayer, TimeoutLayer};
use tower_http::trace::{DefaultOnResponse, TraceLayer};
use tracing::{Level, Span};

/// Header carrying the per-request id.
pub const REQUEST_ID_HEADER: &str = "x-request-id";

type MakeRequestSpan = fn(&Request<axum::body::Body>) -> Span;

/// The composed Tower layer type produced by [`build_http_layers`].
type HttpLayers = tower::layer::util::Stack<
    PropagateRequestIdLayer,
    tower::layer::util::Stack<
        TraceLayer<
            tower_http::classify::SharedClassifier<tower_http::classify::ServerErrorsAsFailures>,
            MakeRequestSpan,
            tower_http::trace::DefaultOnRequest,
            DefaultOnResponse,
        >,
        tower::layer::util::Stack<SetRequestIdLayer<MakeRequestUuid>, tower::layer::util::Identity>,
    >,
>;

/// The composed timeout layers produced by [`build_timeout_layers`].
type TimeoutLayers = tower::layer::util::Stack<
    RequestBodyTimeoutLayer,
    tower::layer::util::Stack<TimeoutLayer, tower::layer::util::Identity>,
>;

/// Builds the outer transport stack.
///
/// **Middleware ordering (outermost to innermost):**
/// 1. `SetRequestId` -- assigns a UUID v4 `X-Request-Id` to every incoming request
/// 2. `Tracing` -- opens a `request` span carrying method, path and request id
/// 3. `PropagateRequestId` -- copies `X-Request-Id` from the request to the response
#[must_use]
pub fn build_http_layers() -> HttpLayers {
    let x_request_id = HeaderName::from_static(REQUEST_ID_HEADER);

    ServiceBuilder::new()
        .layer(SetRequestIdLayer::new(x_request_id.clone(), MakeRequestUuid))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(request_span as MakeRequestSpan)
                .on_response(DefaultOnResponse::new().level(Level::DEBUG)),
        )
        .layer(PropagateRequestIdLayer::new(x_request_id))
        .into_inner()
}

/// Builds the per-request time bounds.
///
/// 1. `Timeout` -- requests still being processed after `write` get 408
/// 2. `RequestBodyTimeout` -- bounds reading the request body to `read`
#[must_use]
pub fn build_timeout_layers(read: Duration, write: Duration) -> TimeoutLayers {
    ServiceBuilder::new()
        .layer(TimeoutLayer::with_status_code(StatusCode::REQUEST_TIMEOUT, write))
        .layer(RequestBodyTimeoutLayer::new(read))
        .into_inner()
}

fn request_span(request: &Request<axum::body::Body>) -> Span {
    let request_id = request
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("-");
    tracing::info_span!(
        "request",
        method = %request.method(),
        path = %request.uri().path(),
        request_id = %request_id,
    )
}

/// Builds the CORS layer from the configured list of allowed origins.
///
/// A wildcard `"*"` in the origins list allows any origin. Otherwise,
/// each origin string is parsed and added to an explicit allowlist.
#[must_use]
pub fn build_cors_layer(origins: &[String]) -> CorsLayer {
    let allow_origin = if origins.is_empty() || origins.iter().any(|o| o == "*") {
        AllowOrigin::any()
    } else {
        let parsed: Vec<_> = origins.iter().filter_map(|o| o.parse().ok()).collect();
        AllowOrigin::list(parsed)
    };

    CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::PATCH,
            Method::DELETE,
            Method::HEAD,
            Method::OPTIONS,
        ])
        .allow_headers(Any)
}

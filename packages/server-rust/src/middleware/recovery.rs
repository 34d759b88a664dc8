//! Panic recovery: a panicking handler yields a 500 response instead of
//! taking down the connection task.

use std::any::Any;
use std::backtrace::Backtrace;
use std::cell::{Cell, RefCell};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Once;

use axum::extract::Request;
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use futures_util::FutureExt;
use tracing::error;

use super::client_ip;
use crate::response::ApiError;

thread_local! {
    static LAST_PANIC_TRACE: RefCell<Option<String>> = const { RefCell::new(None) };
    static REQUEST_DEPTH: Cell<u32> = const { Cell::new(0) };
}

static INSTALL_HOOK: Once = Once::new();

/// Marks the current thread as polling a request handler.
struct RequestScope;

impl RequestScope {
    fn enter() -> Self {
        REQUEST_DEPTH.with(|depth| depth.set(depth.get() + 1));
        Self
    }
}

impl Drop for RequestScope {
    fn drop(&mut self) {
        REQUEST_DEPTH.with(|depth| depth.set(depth.get().saturating_sub(1)));
    }
}

/// Chains a panic hook that records the stack trace of a panicking request
/// handler. Panics outside [`recover`] go straight to the previous hook.
fn install_trace_hook() {
    INSTALL_HOOK.call_once(|| {
        let previous = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            if REQUEST_DEPTH.with(Cell::get) > 0 {
                let trace = Backtrace::force_capture().to_string();
                LAST_PANIC_TRACE.with(|slot| *slot.borrow_mut() = Some(trace));
            }
            previous(info);
        }));
    });
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Runs the rest of the chain and converts a panic into a 500 JSON response.
///
/// The first call chains a process-wide panic hook; it captures a stack
/// trace only for panics raised while a request is polled here.
pub async fn recover(request: Request, next: Next) -> Response {
    install_trace_hook();

    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let client = client_ip(&request);

    let mut inner = Box::pin(next.run(request));
    let scoped = std::future::poll_fn(move |cx| {
        let _scope = RequestScope::enter();
        inner.as_mut().poll(cx)
    });

    match AssertUnwindSafe(scoped).catch_unwind().await {
        Ok(response) => response,
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            let stack = LAST_PANIC_TRACE
                .with(|slot| slot.borrow_mut().take())
                .unwrap_or_default();
            error!(
                panic = %message,
                method = %method,
                path = %path,
                client = %client,
                stack = %stack,
                "recovered from panic in request handler"
            );
            ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, "internal server error").into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::middleware::from_fn;
    use axum::routing::get;
    use axum::Router;
    use tower::ServiceExt;

    use super::*;

    #[allow(clippy::unused_async)]
    async fn boom() -> &'static str {
        panic!("handler exploded");
    }

    fn app() -> Router {
        Router::new()
            .route("/boom", get(boom))
            .route("/fine", get(|| async { "fine" }))
            .layer(from_fn(recover))
    }

    #[tokio::test]
    async fn panic_becomes_internal_server_error() {
        let response = app()
            .oneshot(Request::builder().uri("/boom").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["code"], 500);
        assert_eq!(json["message"], "internal server error");
    }

    #[tokio::test]
    async fn router_keeps_serving_after_a_panic() {
        let app = app();
        let first = app
            .clone()
            .oneshot(Request::builder().uri("/boom").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(first.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let second = app
            .oneshot(Request::builder().uri("/fine").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(second.status(), StatusCode::OK);
    }

    #[test]
    fn trace_is_only_captured_inside_a_request() {
        install_trace_hook();
        LAST_PANIC_TRACE.with(|slot| slot.borrow_mut().take());

        let outside = std::panic::catch_unwind(|| panic!("outside"));
        assert!(outside.is_err());
        assert!(LAST_PANIC_TRACE.with(|slot| slot.borrow().is_none()));

        let inside = std::panic::catch_unwind(|| {
            let _scope = RequestScope::enter();
            panic!("inside");
        });
        assert!(inside.is_err());
        assert_eq!(REQUEST_DEPTH.with(Cell::get), 0);
        assert!(LAST_PANIC_TRACE.with(|slot| slot.borrow_mut().take()).is_some());
    }

    #[test]
    fn panic_messages_are_extracted() {
        let payload: Box<dyn Any + Send> = Box::new("static");
        assert_eq!(panic_message(payload.as_ref()), "static");
        let payload: Box<dyn Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(payload.as_ref()), "owned");
        let payload: Box<dyn Any + Send> = Box::new(7_u8);
        assert_eq!(panic_message(payload.as_ref()), "unknown panic payload");
    }
}

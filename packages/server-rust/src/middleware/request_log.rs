//! Access log for every request, or only failed ones outside debug mode.

use std::time::Instant;

use axum::extract::{Request, State};
use axum::http::header::USER_AGENT;
use axum::middleware::Next;
use axum::response::Response;
use tracing::{error, info, warn};

use super::client_ip;
use crate::network::config::ServeMode;
use crate::network::layers::REQUEST_ID_HEADER;

/// Which responses the access log records.
#[must_use]
pub fn should_log(mode: ServeMode, status: u16) -> bool {
    mode.logs_every_request() || status >= 400
}

/// Logs status, method, path, client, latency and request id after the response is produced.
pub async fn log_requests(State(mode): State<ServeMode>, request: Request, next: Next) -> Response {
    let started = Instant::now();
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let query = request.uri().query().unwrap_or_default().to_string();
    let client = client_ip(&request);
    let user_agent = request
        .headers()
        .get(USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    let request_id = request
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();

    let response = next.run(request).await;

    let status = response.status().as_u16();
    if !should_log(mode, status) {
        return response;
    }
    let latency_ms = started.elapsed().as_secs_f64() * 1000.0;

    macro_rules! access_log {
        ($level:ident) => {
            $level!(
                status,
                method = %method,
                path = %path,
                query = %query,
                client = %client,
                user_agent = %user_agent,
                latency_ms,
                request_id = %request_id,
                "request completed"
            )
        };
    }

    if status >= 500 {
        access_log!(error);
    } else if status >= 400 {
        access_log!(warn);
    } else {
        access_log!(info);
    }
    response
}

//! `GET /health`.

use axum::Json;
use serde_json::{json, Value};

/// Always `200 {"status":"ok"}` while the listener is serving.
pub async fn health_handler() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reports_ok() {
        let Json(body) = health_handler().await;
        assert_eq!(body, json!({ "status": "ok" }));
    }
}

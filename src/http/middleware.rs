//! Cross-cutting request handling: request-id assignment, access logging,
//! and the internal API key gate.

use std::time::Instant;

use axum::extract::{Request, State};
use axum::http::{HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::Response;
use uuid::Uuid;

use crate::http::AppState;

const REQUEST_ID_HEADER: &str = "x-request-id";

/// Ensures every request carries an `x-request-id` (generating one if the
/// caller didn't send it), mirrors it onto the response, and logs request
/// metadata — method, url, status, user id, env — but never the body: the
/// body is never read by this layer, so there is nothing to log.
pub async fn observe(mut req: Request, next: Next) -> Response {
    let request_id = req
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    if let Ok(value) = HeaderValue::from_str(&request_id) {
        req.headers_mut().insert(REQUEST_ID_HEADER, value.clone());
    }

    let method = req.method().clone();
    let uri = req.uri().clone();
    let user_id = req
        .headers()
        .get("x-user-id")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("-")
        .to_string();
    let env = req
        .headers()
        .get("x-ctrader-env")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("-")
        .to_string();

    let start = Instant::now();
    let mut response = next.run(req).await;
    let elapsed_ms = start.elapsed().as_millis();
    let status = response.status().as_u16();

    if status >= 500 {
        tracing::error!(request_id = %request_id, method = %method, url = %uri, status, user_id = %user_id, env = %env, elapsed_ms, "request");
    } else if status >= 400 {
        tracing::warn!(request_id = %request_id, method = %method, url = %uri, status, user_id = %user_id, env = %env, elapsed_ms, "request");
    } else {
        tracing::info!(request_id = %request_id, method = %method, url = %uri, status, user_id = %user_id, env = %env, elapsed_ms, "request");
    }

    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    response
}

/// Rejects requests that don't carry a matching `x-internal-key` header,
/// when `INTERNAL_API_KEY` is configured. A no-op when it isn't — the
/// operator has chosen not to require one.
pub async fn require_internal_key(
    State(state): State<AppState>,
    req: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    let Some(expected) = state.config.internal_api_key.as_deref() else {
        return Ok(next.run(req).await);
    };

    let provided = req
        .headers()
        .get("x-internal-key")
        .and_then(|v| v.to_str().ok());

    if provided == Some(expected) {
        Ok(next.run(req).await)
    } else {
        Err(StatusCode::UNAUTHORIZED)
    }
}

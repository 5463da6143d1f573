//! Structured, leveled logging, initialized exactly once before any other
//! component starts.
//!
//! Request-scoped context (request id, user id, environment) is attached via
//! structured fields (`tracing::info!(request_id = %id, ...)`), never
//! interpolated into the message string — this is what lets "bodies are
//! never logged" hold even under a broad call site: the body is simply never
//! passed as a field.

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// `level` is the configured `LOG_LEVEL` value; falls back to `info` if it
/// isn't a filter directive tracing-subscriber understands.
pub fn init(level: &str) {
    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(true))
        .with(filter)
        .init();
}

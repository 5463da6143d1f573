//! Error taxonomy for the gateway.
//!
//! `GatewayError` is the one error type every fallible library-level call in
//! this crate returns. The HTTP layer (`crate::http`) maps each variant to a
//! status code exactly once, at the edge — nothing below `crate::http`
//! should know about HTTP status codes.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    AuthMissing(String),

    #[error("internal key mismatch")]
    InternalAuthFail,

    #[error("upstream error: {0}")]
    Upstream(String),

    #[error("request timeout ({payload}) clientMsgId={client_msg_id}")]
    Timeout { payload: String, client_msg_id: u64 },

    #[error("disconnected")]
    Disconnected,

    #[error("shutting down")]
    ShuttingDown,

    #[error("QUOTE_TIMEOUT")]
    QuoteTimeout,

    #[error("malformed frame: {0}")]
    Decode(String),

    #[error("crypto error: {0}")]
    Crypto(String),

    #[error("symbol not found: {0}")]
    SymbolNotFound(String),

    #[error("protobuf schema error: {0}")]
    Schema(String),

    #[error(transparent)]
    Other(#[from] eyre::Report),
}

impl GatewayError {
    /// True when the upstream's own error description indicates the
    /// condition the caller wanted is already satisfied (cTrader replies
    /// with "already authorized" for an account that authorized earlier
    /// on this same channel — that's success, not failure).
    pub fn upstream_description(&self) -> Option<&str> {
        match self {
            GatewayError::Upstream(desc) => Some(desc),
            _ => None,
        }
    }
}

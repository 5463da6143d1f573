//! Request-context extraction from headers, and query-string parameter
//! coercion shared by more than one route.

use axum::extract::FromRequestParts;
use axum::http::request::Parts;

use crate::http::error::HttpError;
use crate::types::Environment;

/// `{userId, env?, tokenOverride?}`, extracted once per request. Absent
/// optional fields stay `None`, never an empty string.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    pub user_id: Option<String>,
    pub env: Option<Environment>,
    pub token_override: Option<String>,
    pub request_id: String,
}

impl RequestContext {
    pub fn require_user_id(&self) -> Result<&str, HttpError> {
        self.user_id
            .as_deref()
            .ok_or_else(|| HttpError::bad_request("x-user-id header is required"))
    }

    /// Converts any error into an `HttpError` stamped with this request's id,
    /// so the error body and the access log line agree on it.
    pub fn err(&self, err: impl Into<HttpError>) -> HttpError {
        err.into().with_request_id(self.request_id.clone())
    }
}

impl<S> FromRequestParts<S> for RequestContext
where
    S: Send + Sync,
{
    type Rejection = HttpError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let user_id = header_value(parts, "x-user-id");

        let env = match header_value(parts, "x-ctrader-env") {
            Some(raw) => Some(
                Environment::parse(&raw)
                    .ok_or_else(|| HttpError::bad_request(format!("invalid x-ctrader-env '{raw}'")))?,
            ),
            None => None,
        };

        let token_override = header_value(parts, "x-ctrader-access-token");
        let request_id = header_value(parts, "x-request-id").unwrap_or_default();

        Ok(Self {
            user_id,
            env,
            token_override,
            request_id,
        })
    }
}

fn header_value(parts: &Parts, name: &str) -> Option<String> {
    parts
        .headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// `?limit=` query parameter, clamped to `[1, 2000]`, defaulting to `default`.
pub fn clamp_limit(raw: Option<usize>, default: usize) -> usize {
    raw.unwrap_or(default).clamp(1, 2000)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clamp_limit_uses_default_when_absent() {
        assert_eq!(clamp_limit(None, 200), 200);
    }

    #[test]
    fn clamp_limit_clamps_to_bounds() {
        assert_eq!(clamp_limit(Some(0), 200), 1);
        assert_eq!(clamp_limit(Some(5000), 200), 2000);
        assert_eq!(clamp_limit(Some(50), 200), 50);
    }
}

//! Maps the library's `GatewayError` taxonomy to the one HTTP error shape
//! every route returns: `{error, details, requestId}`.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use serde_json::Value;

use crate::error::GatewayError;

#[derive(Debug, Clone)]
pub struct HttpError {
    pub status: StatusCode,
    pub message: String,
    pub details: Option<Value>,
    pub request_id: String,
}

impl HttpError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
            details: None,
            request_id: String::new(),
        }
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::UNAUTHORIZED,
            message: message.into(),
            details: None,
            request_id: String::new(),
        }
    }

    /// Stamps the request id that correlates this error with the access log
    /// line the observability middleware already emitted for this request.
    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = request_id.into();
        self
    }
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    error: &'a str,
    details: &'a Option<Value>,
    #[serde(rename = "requestId")]
    request_id: &'a str,
}

impl From<GatewayError> for HttpError {
    fn from(err: GatewayError) -> Self {
        let status = match &err {
            GatewayError::Validation(_) => StatusCode::BAD_REQUEST,
            GatewayError::AuthMissing(_) => StatusCode::BAD_REQUEST,
            GatewayError::InternalAuthFail => StatusCode::UNAUTHORIZED,
            GatewayError::SymbolNotFound(_) => StatusCode::NOT_FOUND,
            GatewayError::QuoteTimeout => StatusCode::REQUEST_TIMEOUT,
            GatewayError::Timeout { .. } => StatusCode::REQUEST_TIMEOUT,
            GatewayError::Disconnected => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::Upstream(_) => StatusCode::BAD_GATEWAY,
            GatewayError::Decode(_) => StatusCode::INTERNAL_SERVER_ERROR,
            GatewayError::Crypto(_) => StatusCode::INTERNAL_SERVER_ERROR,
            GatewayError::Schema(_) => StatusCode::INTERNAL_SERVER_ERROR,
            GatewayError::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            message: err.to_string(),
            details: None,
            request_id: String::new(),
        }
    }
}

impl From<eyre::Report> for HttpError {
    fn from(err: eyre::Report) -> Self {
        GatewayError::Other(err).into()
    }
}

impl IntoResponse for HttpError {
    fn into_response(self) -> Response {
        if self.status.as_u16() >= 500 {
            tracing::error!(request_id = %self.request_id, status = self.status.as_u16(), error = %self.message, "request failed");
        } else {
            tracing::warn!(request_id = %self.request_id, status = self.status.as_u16(), error = %self.message, "request rejected");
        }
        let body = ErrorBody {
            error: &self.message,
            details: &self.details,
            request_id: &self.request_id,
        };
        (self.status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_maps_to_bad_request() {
        let err: HttpError = GatewayError::Validation("bad".to_string()).into();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
    }

    #[test]
    fn internal_auth_fail_maps_to_unauthorized() {
        let err: HttpError = GatewayError::InternalAuthFail.into();
        assert_eq!(err.status, StatusCode::UNAUTHORIZED);
    }

    #[test]
    fn symbol_not_found_maps_to_not_found() {
        let err: HttpError = GatewayError::SymbolNotFound("XYZ".to_string()).into();
        assert_eq!(err.status, StatusCode::NOT_FOUND);
    }

    #[test]
    fn disconnected_and_shutting_down_map_to_service_unavailable() {
        let a: HttpError = GatewayError::Disconnected.into();
        let b: HttpError = GatewayError::ShuttingDown.into();
        assert_eq!(a.status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(b.status, StatusCode::SERVICE_UNAVAILABLE);
    }
}

//! HTTP client for the venue's OAuth token endpoint: authorization-code
//! exchange and refresh-token renewal, with response field normalization.

use serde::Deserialize;
use std::time::Duration;

use crate::config::Config;
use crate::error::GatewayError;

const TOKEN_URL: &str = "https://openapi.ctrader.com/apps/token";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// Normalized token response, regardless of which field-name casing the
/// venue happened to reply with.
#[derive(Debug, Clone)]
pub struct TokenResponse {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_in: u64,
}

/// Mirrors the raw JSON shape, accepting both casings the venue is known to
/// use (see SPEC_FULL.md §4.9).
#[derive(Debug, Deserialize)]
struct TokenResponseRaw {
    #[serde(alias = "accessToken")]
    access_token: Option<String>,
    #[serde(alias = "refreshToken")]
    refresh_token: Option<String>,
    #[serde(alias = "expiresIn")]
    expires_in: Option<u64>,
}

impl TryFrom<TokenResponseRaw> for TokenResponse {
    type Error = GatewayError;

    fn try_from(raw: TokenResponseRaw) -> Result<Self, Self::Error> {
        let access_token = raw
            .access_token
            .ok_or_else(|| GatewayError::Upstream("oauth response missing access token".to_string()))?;
        Ok(TokenResponse {
            access_token,
            refresh_token: raw.refresh_token,
            expires_in: raw.expires_in.unwrap_or(0),
        })
    }
}

#[derive(Clone)]
pub struct OAuthClient {
    http: reqwest::Client,
    client_id: String,
    client_secret: String,
    redirect_uri: String,
}

impl OAuthClient {
    pub fn new(config: &Config) -> Self {
        Self {
            http: reqwest::Client::builder()
                .timeout(REQUEST_TIMEOUT)
                .build()
                .expect("reqwest client builder should not fail with default settings"),
            client_id: config.ctrader_client_id.clone(),
            client_secret: config.ctrader_client_secret.clone(),
            redirect_uri: config.ctrader_redirect_uri.clone(),
        }
    }

    /// Exchange an authorization `code` for a fresh access/refresh token pair.
    pub async fn exchange_code(&self, code: &str) -> Result<TokenResponse, GatewayError> {
        self.post_form(&[
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", &self.redirect_uri),
            ("client_id", &self.client_id),
            ("client_secret", &self.client_secret),
        ])
        .await
    }

    /// Exchange a `refresh_token` for a renewed access token.
    pub async fn refresh(&self, refresh_token: &str) -> Result<TokenResponse, GatewayError> {
        self.post_form(&[
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("client_id", &self.client_id),
            ("client_secret", &self.client_secret),
        ])
        .await
    }

    async fn post_form(&self, params: &[(&str, &str)]) -> Result<TokenResponse, GatewayError> {
        let response = self
            .http
            .post(TOKEN_URL)
            .form(params)
            .send()
            .await
            .map_err(|e| GatewayError::Upstream(format!("oauth request failed: {e}")))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| GatewayError::Upstream(format!("failed to read oauth response body: {e}")))?;

        if !status.is_success() {
            return Err(GatewayError::Upstream(format!(
                "oauth token endpoint returned {status}: {body}"
            )));
        }

        let raw: TokenResponseRaw = serde_json::from_str(&body)
            .map_err(|e| GatewayError::Upstream(format!("oauth response is not valid json: {e}")))?;
        raw.try_into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_snake_case_field_names() {
        let raw: TokenResponseRaw = serde_json::from_str(
            r#"{"access_token":"a","refresh_token":"r","expires_in":3600}"#,
        )
        .unwrap();
        let token: TokenResponse = raw.try_into().unwrap();
        assert_eq!(token.access_token, "a");
        assert_eq!(token.refresh_token, Some("r".to_string()));
        assert_eq!(token.expires_in, 3600);
    }

    #[test]
    fn accepts_camel_case_field_names() {
        let raw: TokenResponseRaw = serde_json::from_str(
            r#"{"accessToken":"a","refreshToken":"r","expiresIn":3600}"#,
        )
        .unwrap();
        let token: TokenResponse = raw.try_into().unwrap();
        assert_eq!(token.access_token, "a");
        assert_eq!(token.refresh_token, Some("r".to_string()));
        assert_eq!(token.expires_in, 3600);
    }

    #[test]
    fn missing_access_token_is_an_error() {
        let raw: TokenResponseRaw = serde_json::from_str(r#"{"expires_in":3600}"#).unwrap();
        let result: Result<TokenResponse, GatewayError> = raw.try_into();
        assert!(result.is_err());
    }

    #[test]
    fn missing_refresh_token_and_expires_in_default_gracefully() {
        let raw: TokenResponseRaw = serde_json::from_str(r#"{"access_token":"a"}"#).unwrap();
        let token: TokenResponse = raw.try_into().unwrap();
        assert_eq!(token.refresh_token, None);
        assert_eq!(token.expires_in, 0);
    }
}

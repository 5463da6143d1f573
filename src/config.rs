//! Process configuration, loaded once at boot.
//!
//! An optional `.env` file is read first (non-fatal if absent), then every
//! field is parsed from the process environment into a single immutable
//! `Config`, validated as a unit. Fields holding secrets redact themselves
//! in `Debug` so a stray `{:?}` never leaks one into a log line.

use eyre::{eyre, Result, WrapErr};
use std::env;
use std::fmt;
use std::path::Path;

use crate::types::Environment;

#[derive(Clone)]
pub struct Config {
    pub port: u16,
    pub ctrader_client_id: String,
    pub ctrader_client_secret: String,
    pub ctrader_redirect_uri: String,
    pub ctrader_env: Environment,
    pub ctrader_demo_host: String,
    pub ctrader_live_host: String,
    pub ctrader_port: u16,
    pub ctrader_proto_dir: String,
    pub redis_url: String,
    pub token_encryption_key: String,
    pub internal_api_key: Option<String>,
    pub log_level: String,
    pub symbol_cache_ttl_secs: u64,
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("port", &self.port)
            .field("ctrader_client_id", &self.ctrader_client_id)
            .field("ctrader_client_secret", &"<redacted>")
            .field("ctrader_redirect_uri", &self.ctrader_redirect_uri)
            .field("ctrader_env", &self.ctrader_env)
            .field("ctrader_demo_host", &self.ctrader_demo_host)
            .field("ctrader_live_host", &self.ctrader_live_host)
            .field("ctrader_port", &self.ctrader_port)
            .field("ctrader_proto_dir", &self.ctrader_proto_dir)
            .field("redis_url", &self.redis_url)
            .field("token_encryption_key", &"<redacted>")
            .field(
                "internal_api_key",
                &self.internal_api_key.as_ref().map(|_| "<redacted>"),
            )
            .field("log_level", &self.log_level)
            .field("symbol_cache_ttl_secs", &self.symbol_cache_ttl_secs)
            .finish()
    }
}

fn default_demo_host() -> String {
    "demo.ctraderapi.com".to_string()
}

fn default_live_host() -> String {
    "live.ctraderapi.com".to_string()
}

fn default_ctrader_port() -> u16 {
    5035
}

fn default_http_port() -> u16 {
    8088
}

fn default_symbol_cache_ttl_secs() -> u64 {
    86_400
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    /// Load `.env` if present, then read from the process environment.
    pub fn load() -> Result<Self> {
        if Path::new(".env").exists() {
            dotenvy::from_filename(".env").wrap_err("failed to load .env file")?;
        }
        Self::load_from_env()
    }

    fn load_from_env() -> Result<Self> {
        let port = env::var("PORT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(default_http_port());

        let ctrader_client_id = env::var("CTRADER_CLIENT_ID")
            .map_err(|_| eyre!("CTRADER_CLIENT_ID environment variable is required"))?;
        let ctrader_client_secret = env::var("CTRADER_CLIENT_SECRET")
            .map_err(|_| eyre!("CTRADER_CLIENT_SECRET environment variable is required"))?;
        let ctrader_redirect_uri = env::var("CTRADER_REDIRECT_URI")
            .map_err(|_| eyre!("CTRADER_REDIRECT_URI environment variable is required"))?;

        let ctrader_env = match env::var("CTRADER_ENV").as_deref() {
            Ok("live") => Environment::Live,
            Ok("demo") | Err(_) => Environment::Demo,
            Ok(other) => return Err(eyre!("CTRADER_ENV must be 'demo' or 'live', got '{other}'")),
        };

        let ctrader_demo_host = env::var("CTRADER_DEMO_HOST").unwrap_or_else(|_| default_demo_host());
        let ctrader_live_host = env::var("CTRADER_LIVE_HOST").unwrap_or_else(|_| default_live_host());
        let ctrader_port = env::var("CTRADER_PORT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(default_ctrader_port());

        let ctrader_proto_dir = env::var("CTRADER_PROTO_DIR")
            .map_err(|_| eyre!("CTRADER_PROTO_DIR environment variable is required"))?;

        let redis_url =
            env::var("REDIS_URL").map_err(|_| eyre!("REDIS_URL environment variable is required"))?;

        let token_encryption_key = env::var("TOKEN_ENCRYPTION_KEY")
            .map_err(|_| eyre!("TOKEN_ENCRYPTION_KEY environment variable is required"))?;

        let internal_api_key = env::var("INTERNAL_API_KEY").ok();

        let log_level = env::var("LOG_LEVEL").unwrap_or_else(|_| default_log_level());

        let symbol_cache_ttl_secs = env::var("SYMBOL_CACHE_TTL_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(default_symbol_cache_ttl_secs());

        let config = Config {
            port,
            ctrader_client_id,
            ctrader_client_secret,
            ctrader_redirect_uri,
            ctrader_env,
            ctrader_demo_host,
            ctrader_live_host,
            ctrader_port,
            ctrader_proto_dir,
            redis_url,
            token_encryption_key,
            internal_api_key,
            log_level,
            symbol_cache_ttl_secs,
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.port == 0 {
            return Err(eyre!("port must be in 1..=65535"));
        }
        if self.ctrader_port == 0 {
            return Err(eyre!("ctrader_port must be in 1..=65535"));
        }
        if self.ctrader_client_id.is_empty() {
            return Err(eyre!("ctrader_client_id cannot be empty"));
        }
        if !Path::new(&self.ctrader_proto_dir).is_dir() {
            return Err(eyre!(
                "ctrader_proto_dir '{}' is not a directory",
                self.ctrader_proto_dir
            ));
        }
        let key_len = self.token_encryption_key.len();
        if key_len != 64 && key_len != 44 {
            // 64 hex chars, or a 32-byte value base64-encoded (44 chars incl. padding)
            return Err(eyre!(
                "token_encryption_key must be 64 hex chars or base64-encoded 32 bytes"
            ));
        }
        Ok(())
    }

    pub fn upstream_host(&self, env: Environment) -> &str {
        match env {
            Environment::Demo => &self.ctrader_demo_host,
            Environment::Live => &self.ctrader_live_host,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Keeps the `TempDir` alive for as long as the returned `Config` is in
    /// use, since `validate()` stats `ctrader_proto_dir` on disk.
    fn valid_config() -> (tempfile::TempDir, Config) {
        let proto_dir = tempfile::tempdir().expect("failed to create temp dir");
        let config = Config {
            port: 8088,
            ctrader_client_id: "client-id".to_string(),
            ctrader_client_secret: "client-secret".to_string(),
            ctrader_redirect_uri: "https://example.com/callback".to_string(),
            ctrader_env: Environment::Demo,
            ctrader_demo_host: default_demo_host(),
            ctrader_live_host: default_live_host(),
            ctrader_port: 5035,
            ctrader_proto_dir: proto_dir.path().to_string_lossy().into_owned(),
            redis_url: "redis://localhost".to_string(),
            token_encryption_key: "ab".repeat(32),
            internal_api_key: None,
            log_level: "info".to_string(),
            symbol_cache_ttl_secs: 86_400,
        };
        (proto_dir, config)
    }

    #[test]
    fn valid_config_passes() {
        let (_dir, config) = valid_config();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn zero_port_rejected() {
        let (_dir, mut c) = valid_config();
        c.port = 0;
        assert!(c.validate().is_err());
    }

    #[test]
    fn missing_proto_dir_rejected() {
        let (_dir, mut c) = valid_config();
        c.ctrader_proto_dir = "/definitely/does/not/exist".to_string();
        assert!(c.validate().is_err());
    }

    #[test]
    fn wrong_length_key_rejected() {
        let (_dir, mut c) = valid_config();
        c.token_encryption_key = "short".to_string();
        assert!(c.validate().is_err());
    }

    #[test]
    fn debug_redacts_secrets() {
        let (_dir, c) = valid_config();
        let debug_str = format!("{c:?}");
        assert!(!debug_str.contains("client-secret"));
        assert!(debug_str.contains("<redacted>"));
    }

    #[test]
    fn upstream_host_selects_by_env() {
        let (_dir, c) = valid_config();
        assert_eq!(c.upstream_host(Environment::Demo), &c.ctrader_demo_host);
        assert_eq!(c.upstream_host(Environment::Live), &c.ctrader_live_host);
    }
}

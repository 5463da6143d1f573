//! Per-user session state: active environment, active account, encrypted
//! OAuth tokens. Stored as JSON under `session:<userId>` with a TTL
//! refreshed on every write.

use eyre::{Result, WrapErr};
use serde::{Deserialize, Serialize};

use crate::crypto::TokenCrypto;
use crate::kv::KvClient;
use crate::types::Environment;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionData {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub env: Option<Environment>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub active_account_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub access_token_enc: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh_token_enc: Option<String>,
    pub updated_at: i64,
}

/// Fields a caller wants to patch. `None` means "leave as is" — this struct
/// can never express "set to null", matching the store's read-modify-write
/// contract.
#[derive(Debug, Clone, Default)]
pub struct SessionPatch {
    pub env: Option<Environment>,
    pub active_account_id: Option<i64>,
    pub access_token_enc: Option<String>,
    pub refresh_token_enc: Option<String>,
}

fn session_key(user_id: &str) -> String {
    format!("session:{user_id}")
}

#[derive(Clone)]
pub struct SessionStore {
    kv: KvClient,
    crypto: TokenCrypto,
}

impl SessionStore {
    pub fn new(kv: KvClient, crypto: TokenCrypto) -> Self {
        Self { kv, crypto }
    }

    pub async fn load_session(&self, user_id: &str) -> Result<Option<SessionData>> {
        let Some(raw) = self.kv.get(&session_key(user_id)).await? else {
            return Ok(None);
        };
        let data: SessionData =
            serde_json::from_str(&raw).wrap_err("stored session is not valid json")?;
        Ok(Some(data))
    }

    /// Merge `patch` into the current session (defined fields win, unset
    /// fields are left untouched) and persist the result with `ttl_secs`.
    pub async fn patch_session(
        &self,
        user_id: &str,
        patch: SessionPatch,
        ttl_secs: Option<u64>,
        now: i64,
    ) -> Result<SessionData> {
        let mut current = self.load_session(user_id).await?.unwrap_or_default();

        if let Some(env) = patch.env {
            current.env = Some(env);
        }
        if let Some(account_id) = patch.active_account_id {
            current.active_account_id = Some(account_id);
        }
        if let Some(access) = patch.access_token_enc {
            current.access_token_enc = Some(access);
        }
        if let Some(refresh) = patch.refresh_token_enc {
            current.refresh_token_enc = Some(refresh);
        }
        current.updated_at = now;

        let serialized = serde_json::to_string(&current).wrap_err("failed to serialize session")?;
        self.kv
            .set(&session_key(user_id), &serialized, ttl_secs)
            .await?;
        Ok(current)
    }

    pub async fn set_env(&self, user_id: &str, env: Environment, now: i64) -> Result<SessionData> {
        self.patch_session(
            user_id,
            SessionPatch {
                env: Some(env),
                ..Default::default()
            },
            None,
            now,
        )
        .await
    }

    pub async fn set_active_account_id(
        &self,
        user_id: &str,
        account_id: i64,
        now: i64,
    ) -> Result<SessionData> {
        self.patch_session(
            user_id,
            SessionPatch {
                active_account_id: Some(account_id),
                ..Default::default()
            },
            None,
            now,
        )
        .await
    }

    /// Encrypt and persist both tokens, refreshing the TTL to `expires_in`
    /// seconds (the lifetime of the access token just issued).
    pub async fn save_tokens(
        &self,
        user_id: &str,
        access_token: &str,
        refresh_token: &str,
        expires_in_secs: u64,
        now: i64,
    ) -> Result<SessionData> {
        let access_enc = self
            .crypto
            .encrypt(access_token)
            .wrap_err("failed to encrypt access token")?;
        let refresh_enc = self
            .crypto
            .encrypt(refresh_token)
            .wrap_err("failed to encrypt refresh token")?;

        self.patch_session(
            user_id,
            SessionPatch {
                access_token_enc: Some(access_enc),
                refresh_token_enc: Some(refresh_enc),
                ..Default::default()
            },
            Some(expires_in_secs),
            now,
        )
        .await
    }

    /// Decrypted access token, or `None` if the session has none on file.
    pub async fn access_token(&self, user_id: &str) -> Result<Option<String>> {
        let Some(session) = self.load_session(user_id).await? else {
            return Ok(None);
        };
        let Some(enc) = session.access_token_enc else {
            return Ok(None);
        };
        Ok(Some(self.crypto.decrypt(&enc).wrap_err("failed to decrypt access token")?))
    }

    pub async fn refresh_token(&self, user_id: &str) -> Result<Option<String>> {
        let Some(session) = self.load_session(user_id).await? else {
            return Ok(None);
        };
        let Some(enc) = session.refresh_token_enc else {
            return Ok(None);
        };
        Ok(Some(
            self.crypto
                .decrypt(&enc)
                .wrap_err("failed to decrypt refresh token")?,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn merge(current: SessionData, patch: SessionPatch, now: i64) -> SessionData {
        let mut merged = current;
        if let Some(env) = patch.env {
            merged.env = Some(env);
        }
        if let Some(account_id) = patch.active_account_id {
            merged.active_account_id = Some(account_id);
        }
        if let Some(access) = patch.access_token_enc {
            merged.access_token_enc = Some(access);
        }
        if let Some(refresh) = patch.refresh_token_enc {
            merged.refresh_token_enc = Some(refresh);
        }
        merged.updated_at = now;
        merged
    }

    #[test]
    fn patch_never_clears_fields_it_does_not_mention() {
        let current = SessionData {
            env: Some(Environment::Demo),
            active_account_id: Some(7),
            access_token_enc: Some("enc-access".to_string()),
            refresh_token_enc: Some("enc-refresh".to_string()),
            updated_at: 1,
        };
        let patch = SessionPatch {
            active_account_id: Some(9),
            ..Default::default()
        };
        let merged = merge(current, patch, 2);

        assert_eq!(merged.env, Some(Environment::Demo));
        assert_eq!(merged.active_account_id, Some(9));
        assert_eq!(merged.access_token_enc, Some("enc-access".to_string()));
        assert_eq!(merged.refresh_token_enc, Some("enc-refresh".to_string()));
    }

    #[test]
    fn unset_fields_serialize_as_absent_not_null() {
        let data = SessionData {
            env: None,
            active_account_id: None,
            access_token_enc: None,
            refresh_token_enc: None,
            updated_at: 5,
        };
        let json = serde_json::to_string(&data).unwrap();
        assert!(!json.contains("null"));
        assert_eq!(json, r#"{"updated_at":5}"#);
    }
}

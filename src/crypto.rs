//! Authenticated symmetric encryption for OAuth tokens at rest.
//!
//! `encrypt(plain) -> base64(iv ‖ tag ‖ ciphertext)` using AES-256-GCM with a
//! freshly generated 12-byte IV per call. The key is supplied once at boot
//! (64 hex chars, or base64-decoded 32 bytes) and never logged.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use rand::RngCore;

use crate::error::GatewayError;

const IV_LEN: usize = 12;
const TAG_LEN: usize = 16;
const KEY_LEN: usize = 32;

#[derive(Clone)]
pub struct TokenCrypto {
    cipher: Aes256Gcm,
}

impl TokenCrypto {
    /// Parse the encryption key from either 64 hex chars or base64-decoded
    /// 32 raw bytes.
    pub fn from_str_key(raw: &str) -> Result<Self, GatewayError> {
        let key_bytes = if raw.len() == KEY_LEN * 2 && raw.bytes().all(|b| b.is_ascii_hexdigit()) {
            hex::decode(raw).map_err(|e| GatewayError::Crypto(format!("invalid hex key: {e}")))?
        } else {
            STANDARD
                .decode(raw)
                .map_err(|e| GatewayError::Crypto(format!("invalid base64 key: {e}")))?
        };
        if key_bytes.len() != KEY_LEN {
            return Err(GatewayError::Crypto(format!(
                "encryption key must decode to {KEY_LEN} bytes, got {}",
                key_bytes.len()
            )));
        }
        let key = Key::<Aes256Gcm>::from_slice(&key_bytes);
        Ok(Self {
            cipher: Aes256Gcm::new(key),
        })
    }

    pub fn encrypt(&self, plain: &str) -> Result<String, GatewayError> {
        let mut iv_bytes = [0u8; IV_LEN];
        rand::thread_rng().fill_bytes(&mut iv_bytes);
        let nonce = Nonce::from_slice(&iv_bytes);

        let ciphertext_and_tag = self
            .cipher
            .encrypt(nonce, plain.as_bytes())
            .map_err(|e| GatewayError::Crypto(format!("encrypt failed: {e}")))?;

        let mut out = Vec::with_capacity(IV_LEN + ciphertext_and_tag.len());
        out.extend_from_slice(&iv_bytes);
        out.extend_from_slice(&ciphertext_and_tag);
        Ok(STANDARD.encode(out))
    }

    pub fn decrypt(&self, encoded: &str) -> Result<String, GatewayError> {
        let raw = STANDARD
            .decode(encoded)
            .map_err(|e| GatewayError::Crypto(format!("invalid base64 ciphertext: {e}")))?;
        if raw.len() < IV_LEN + TAG_LEN {
            return Err(GatewayError::Crypto(
                "ciphertext shorter than iv+tag".into(),
            ));
        }
        let (iv_bytes, ciphertext_and_tag) = raw.split_at(IV_LEN);
        let nonce = Nonce::from_slice(iv_bytes);

        let plain = self
            .cipher
            .decrypt(nonce, ciphertext_and_tag)
            .map_err(|_| GatewayError::Crypto("authentication tag mismatch".into()))?;

        String::from_utf8(plain).map_err(|e| GatewayError::Crypto(format!("invalid utf8: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_key() -> TokenCrypto {
        TokenCrypto::from_str_key(&"ab".repeat(32)).unwrap()
    }

    #[test]
    fn roundtrip() {
        let crypto = test_key();
        let plain = "super-secret-access-token";
        let enc = crypto.encrypt(plain).unwrap();
        let dec = crypto.decrypt(&enc).unwrap();
        assert_eq!(dec, plain);
    }

    #[test]
    fn distinct_ivs_produce_distinct_ciphertexts() {
        let crypto = test_key();
        let a = crypto.encrypt("same-plaintext").unwrap();
        let b = crypto.encrypt("same-plaintext").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn tampered_ciphertext_fails_to_decrypt() {
        let crypto = test_key();
        let enc = crypto.encrypt("payload").unwrap();
        let mut raw = STANDARD.decode(&enc).unwrap();
        let last = raw.len() - 1;
        raw[last] ^= 0xFF;
        let tampered = STANDARD.encode(raw);
        assert!(crypto.decrypt(&tampered).is_err());
    }

    #[test]
    fn short_input_rejected() {
        let crypto = test_key();
        let too_short = STANDARD.encode([0u8; 10]);
        assert!(crypto.decrypt(&too_short).is_err());
    }

    #[test]
    fn accepts_hex_key() {
        let hex_key = "00".repeat(32);
        assert!(TokenCrypto::from_str_key(&hex_key).is_ok());
    }

    #[test]
    fn accepts_base64_key() {
        let b64_key = STANDARD.encode([7u8; 32]);
        assert!(TokenCrypto::from_str_key(&b64_key).is_ok());
    }

    #[test]
    fn rejects_wrong_length_key() {
        assert!(TokenCrypto::from_str_key("tooshort").is_err());
    }
}

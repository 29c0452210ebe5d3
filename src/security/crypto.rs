//! Encrypted-at-rest storage for connector session payloads.
//!
//! When `FIN_AGENT_ENCRYPTION_KEY` (URL-safe base64, 32 bytes) is configured,
//! serialized payloads are wrapped as `enc:v1:<base64url(nonce || ciphertext)>`
//! using AES-256-GCM. Without the key, payloads are stored in plaintext;
//! existing encrypted values are never silently downgraded.

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;

use crate::error::{FinError, FinResult};

const PREFIX: &str = "enc:v1:";
const NONCE_LEN: usize = 12;

fn configured_key() -> Option<String> {
    std::env::var("FIN_AGENT_ENCRYPTION_KEY")
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Whether a process-wide encryption key is configured.
pub fn encryption_enabled() -> bool {
    configured_key().is_some()
}

fn cipher_or_raise() -> FinResult<Aes256Gcm> {
    let raw = configured_key().ok_or_else(|| {
        FinError::invalid("FIN_AGENT_ENCRYPTION_KEY is required for encrypted storage")
    })?;
    let decoded = URL_SAFE_NO_PAD
        .decode(raw.trim_end_matches('='))
        .map_err(|_| FinError::invalid("invalid FIN_AGENT_ENCRYPTION_KEY format; expected URL-safe base64"))?;
    if decoded.len() != 32 {
        return Err(FinError::invalid(
            "invalid FIN_AGENT_ENCRYPTION_KEY length; expected 32 bytes",
        ));
    }
    let key = Key::<Aes256Gcm>::from_slice(&decoded);
    Ok(Aes256Gcm::new(key))
}

/// Encrypt a serialized payload, producing a `enc:v1:`-prefixed string.
pub fn encrypt_payload(plain: &str) -> FinResult<String> {
    let cipher = cipher_or_raise()?;
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
    let ciphertext = cipher
        .encrypt(&nonce, plain.as_bytes())
        .map_err(|_| FinError::internal("encryption failed"))?;
    let mut combined = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    combined.extend_from_slice(nonce.as_slice());
    combined.extend_from_slice(&ciphertext);
    Ok(format!("{}{}", PREFIX, URL_SAFE_NO_PAD.encode(combined)))
}

/// Decrypt a stored value. Values without the version prefix pass through
/// unchanged (plaintext rows written while no key was configured).
pub fn decrypt_payload(value: &str) -> FinResult<String> {
    let Some(encoded) = value.strip_prefix(PREFIX) else {
        return Ok(value.to_string());
    };
    let cipher = cipher_or_raise()?;
    let combined = URL_SAFE_NO_PAD
        .decode(encoded)
        .map_err(|_| FinError::invalid("malformed encrypted payload"))?;
    if combined.len() <= NONCE_LEN {
        return Err(FinError::invalid("malformed encrypted payload"));
    }
    let (nonce_bytes, ciphertext) = combined.split_at(NONCE_LEN);
    let nonce = Nonce::from_slice(nonce_bytes);
    let plain = cipher
        .decrypt(nonce, ciphertext)
        .map_err(|_| FinError::invalid("failed to decrypt payload; key mismatch or corrupt value"))?;
    String::from_utf8(plain).map_err(|_| FinError::invalid("decrypted payload is not valid UTF-8"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set_test_key() {
        // 32 zero bytes, URL-safe base64 without padding.
        std::env::set_var(
            "FIN_AGENT_ENCRYPTION_KEY",
            URL_SAFE_NO_PAD.encode([7u8; 32]),
        );
    }

    #[test]
    fn test_round_trip() {
        set_test_key();
        let encrypted = encrypt_payload("{\"access_token\":\"abc\"}").unwrap();
        assert!(encrypted.starts_with("enc:v1:"));
        let decrypted = decrypt_payload(&encrypted).unwrap();
        assert_eq!(decrypted, "{\"access_token\":\"abc\"}");
    }

    #[test]
    fn test_plaintext_passthrough() {
        set_test_key();
        assert_eq!(decrypt_payload("{\"plain\":true}").unwrap(), "{\"plain\":true}");
    }
}

//! Envelope encryption for credential values.
//!
//! AES-256-GCM with a per-entry subkey derived from the master key via
//! HKDF-SHA256. The HKDF salt is random per encryption and stored next to
//! the ciphertext; the AEAD associated data binds each ciphertext to its
//! owning bot (or to the platform scope), so a value encrypted for one bot
//! can never decrypt under another's identity.

use aes_gcm::aead::{Aead, Payload};
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;
use hkdf::Hkdf;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::error::{CryptoError, Result};
use crate::master::MasterKey;

/// HKDF info label for platform-scoped entries (no bot binding).
const PLATFORM_INFO: &str = "cachibot-platform-env";
/// HKDF info prefix for bot-scoped entries; the bot ID is appended.
const BOT_INFO_PREFIX: &str = "cachibot-bot-env-";
/// AAD literal for platform-scoped entries.
const PLATFORM_AAD: &[u8] = b"platform";

/// One encrypted credential as stored: three base64 strings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedValue {
    pub ciphertext: String,
    pub nonce: String,
    pub salt: String,
}

/// AES-256-GCM encryption with per-bot HKDF key derivation.
pub struct EncryptionService {
    master_key: MasterKey,
}

impl EncryptionService {
    pub fn new(master_key: MasterKey) -> Self {
        Self { master_key }
    }

    /// Build a service from the process environment / key file.
    pub fn from_env() -> Result<Self> {
        Ok(Self::new(crate::master::load_master_key()?))
    }

    /// Derive the 256-bit subkey for one entry.
    fn derive_subkey(&self, bot_id: Option<&str>, salt: &[u8]) -> [u8; 32] {
        let info = match bot_id {
            Some(id) if !id.is_empty() => format!("{BOT_INFO_PREFIX}{id}"),
            _ => PLATFORM_INFO.to_string(),
        };
        let hk = Hkdf::<Sha256>::new(Some(salt), &self.master_key);
        let mut okm = [0u8; 32];
        // Expand only fails for absurd output lengths; 32 bytes is always fine.
        hk.expand(info.as_bytes(), &mut okm)
            .expect("HKDF expand with 32-byte output");
        okm
    }

    fn aad(bot_id: Option<&str>) -> Vec<u8> {
        match bot_id {
            Some(id) if !id.is_empty() => id.as_bytes().to_vec(),
            _ => PLATFORM_AAD.to_vec(),
        }
    }

    /// Encrypt a plaintext string. `bot_id = None` encrypts platform-scoped.
    pub fn encrypt_value(&self, plaintext: &str, bot_id: Option<&str>) -> Result<EncryptedValue> {
        let mut salt = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut salt);
        let mut nonce_bytes = [0u8; 12];
        rand::rngs::OsRng.fill_bytes(&mut nonce_bytes);

        let subkey = self.derive_subkey(bot_id, &salt);
        let cipher = Aes256Gcm::new_from_slice(&subkey).map_err(|_| CryptoError::Encrypt)?;
        let aad = Self::aad(bot_id);

        let ciphertext = cipher
            .encrypt(
                Nonce::from_slice(&nonce_bytes),
                Payload {
                    msg: plaintext.as_bytes(),
                    aad: &aad,
                },
            )
            .map_err(|_| CryptoError::Encrypt)?;

        Ok(EncryptedValue {
            ciphertext: B64.encode(&ciphertext),
            nonce: B64.encode(nonce_bytes),
            salt: B64.encode(salt),
        })
    }

    /// Decrypt a stored value. Fails with [`CryptoError::Decrypt`] if the
    /// master key, the bot binding, or any stored byte does not match.
    pub fn decrypt_value(&self, value: &EncryptedValue, bot_id: Option<&str>) -> Result<String> {
        let ciphertext = B64
            .decode(&value.ciphertext)
            .map_err(|e| CryptoError::Encoding(format!("ciphertext: {e}")))?;
        let nonce = B64
            .decode(&value.nonce)
            .map_err(|e| CryptoError::Encoding(format!("nonce: {e}")))?;
        let salt = B64
            .decode(&value.salt)
            .map_err(|e| CryptoError::Encoding(format!("salt: {e}")))?;

        if nonce.len() != 12 {
            return Err(CryptoError::Encoding("nonce must be 12 bytes".to_string()));
        }

        let subkey = self.derive_subkey(bot_id, &salt);
        let cipher = Aes256Gcm::new_from_slice(&subkey).map_err(|_| CryptoError::Decrypt)?;
        let aad = Self::aad(bot_id);

        let plaintext = cipher
            .decrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: &ciphertext,
                    aad: &aad,
                },
            )
            .map_err(|_| CryptoError::Decrypt)?;

        String::from_utf8(plaintext).map_err(|e| CryptoError::Encoding(e.to_string()))
    }

    /// Encrypt a connection config for storage as `{_encrypted, _nonce, _salt}`.
    pub fn encrypt_connection_config(
        &self,
        config: &serde_json::Value,
        bot_id: &str,
    ) -> Result<serde_json::Value> {
        let plaintext =
            serde_json::to_string(config).map_err(|e| CryptoError::Encoding(e.to_string()))?;
        let enc = self.encrypt_value(&plaintext, Some(bot_id))?;
        Ok(serde_json::json!({
            "_encrypted": enc.ciphertext,
            "_nonce": enc.nonce,
            "_salt": enc.salt,
        }))
    }

    /// Decrypt a stored connection config.
    ///
    /// Values without encryption markers are legacy plaintext and pass
    /// through unchanged (they are re-encrypted on the next write).
    pub fn decrypt_connection_config(
        &self,
        stored: &serde_json::Value,
        bot_id: &str,
    ) -> Result<serde_json::Value> {
        let obj = match stored.as_object() {
            Some(o) => o,
            None => return Ok(stored.clone()),
        };

        let (ct, nonce, salt) = match (
            obj.get("_encrypted").and_then(|v| v.as_str()),
            obj.get("_nonce").and_then(|v| v.as_str()),
            obj.get("_salt").and_then(|v| v.as_str()),
        ) {
            (Some(c), Some(n), Some(s)) => (c, n, s),
            _ => return Ok(stored.clone()),
        };

        let enc = EncryptedValue {
            ciphertext: ct.to_string(),
            nonce: nonce.to_string(),
            salt: salt.to_string(),
        };
        let plaintext = self.decrypt_value(&enc, Some(bot_id))?;
        serde_json::from_str(&plaintext).map_err(|e| CryptoError::Encoding(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service() -> EncryptionService {
        EncryptionService::new([0x42u8; 32])
    }

    #[test]
    fn roundtrip_basic() {
        let svc = service();
        let enc = svc.encrypt_value("sk-test-12345", Some("bot-a")).unwrap();
        let dec = svc.decrypt_value(&enc, Some("bot-a")).unwrap();
        assert_eq!(dec, "sk-test-12345");
    }

    #[test]
    fn roundtrip_empty_string() {
        let svc = service();
        let enc = svc.encrypt_value("", Some("bot-a")).unwrap();
        assert_eq!(svc.decrypt_value(&enc, Some("bot-a")).unwrap(), "");
    }

    #[test]
    fn roundtrip_unicode() {
        let svc = service();
        let value = "contraseña-ключ-鍵-🔑";
        let enc = svc.encrypt_value(value, Some("bot-a")).unwrap();
        assert_eq!(svc.decrypt_value(&enc, Some("bot-a")).unwrap(), value);
    }

    #[test]
    fn roundtrip_platform_level() {
        let svc = service();
        let enc = svc.encrypt_value("shared-default", None).unwrap();
        assert_eq!(svc.decrypt_value(&enc, None).unwrap(), "shared-default");
    }

    #[test]
    fn same_plaintext_twice_differs() {
        let svc = service();
        let a = svc.encrypt_value("same", Some("bot-a")).unwrap();
        let b = svc.encrypt_value("same", Some("bot-a")).unwrap();
        assert_ne!(a.ciphertext, b.ciphertext);
        assert_ne!(a.nonce, b.nonce);
        assert_ne!(a.salt, b.salt);
    }

    #[test]
    fn cross_bot_decrypt_fails() {
        let svc = service();
        let enc = svc.encrypt_value("secret", Some("bot-a")).unwrap();
        assert!(matches!(
            svc.decrypt_value(&enc, Some("bot-b")),
            Err(CryptoError::Decrypt)
        ));
    }

    #[test]
    fn bot_vs_platform_decrypt_fails() {
        let svc = service();
        let enc = svc.encrypt_value("secret", Some("bot-a")).unwrap();
        assert!(svc.decrypt_value(&enc, None).is_err());

        let enc = svc.encrypt_value("secret", None).unwrap();
        assert!(svc.decrypt_value(&enc, Some("bot-a")).is_err());
    }

    #[test]
    fn wrong_master_key_fails() {
        let enc = service().encrypt_value("secret", Some("bot-a")).unwrap();
        let other = EncryptionService::new([0x13u8; 32]);
        assert!(matches!(
            other.decrypt_value(&enc, Some("bot-a")),
            Err(CryptoError::Decrypt)
        ));
    }

    #[test]
    fn tampered_fields_fail() {
        let svc = service();
        let enc = svc.encrypt_value("secret", Some("bot-a")).unwrap();

        // Flip one byte in each stored field and expect failure.
        let tamper = |b64: &str| {
            let mut bytes = B64.decode(b64).unwrap();
            bytes[0] ^= 0x01;
            B64.encode(bytes)
        };

        let mut bad = enc.clone();
        bad.ciphertext = tamper(&enc.ciphertext);
        assert!(svc.decrypt_value(&bad, Some("bot-a")).is_err());

        let mut bad = enc.clone();
        bad.nonce = tamper(&enc.nonce);
        assert!(svc.decrypt_value(&bad, Some("bot-a")).is_err());

        let mut bad = enc.clone();
        bad.salt = tamper(&enc.salt);
        assert!(svc.decrypt_value(&bad, Some("bot-a")).is_err());
    }

    #[test]
    fn connection_config_roundtrip() {
        let svc = service();
        let config = serde_json::json!({"bot_token": "123456789:AAHtokentokentokentokentokentoke", "strip_markdown": true});
        let stored = svc.encrypt_connection_config(&config, "bot-a").unwrap();

        assert!(stored.get("_encrypted").is_some());
        assert!(stored.get("_nonce").is_some());
        assert!(stored.get("_salt").is_some());
        assert!(stored.get("bot_token").is_none());

        let decrypted = svc.decrypt_connection_config(&stored, "bot-a").unwrap();
        assert_eq!(decrypted, config);
    }

    #[test]
    fn legacy_plaintext_config_passthrough() {
        let svc = service();
        let legacy = serde_json::json!({"bot_token": "plain-old-token"});
        let out = svc.decrypt_connection_config(&legacy, "bot-a").unwrap();
        assert_eq!(out, legacy);
    }

    #[test]
    fn derive_is_deterministic_per_inputs() {
        let svc = service();
        let salt = [7u8; 32];
        let a = svc.derive_subkey(Some("bot-a"), &salt);
        let b = svc.derive_subkey(Some("bot-a"), &salt);
        assert_eq!(a, b);

        let c = svc.derive_subkey(Some("bot-b"), &salt);
        assert_ne!(a, c);

        let d = svc.derive_subkey(Some("bot-a"), &[8u8; 32]);
        assert_ne!(a, d);
    }
}

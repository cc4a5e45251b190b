//! Authentication: argon2 password hashing, HMAC-signed access/refresh
//! tokens, and the per-IP login rate limiter.

use std::time::{Duration, Instant};

use argon2::password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, SaltString};
use argon2::{Argon2, PasswordVerifier};
use base64::engine::general_purpose::URL_SAFE_NO_PAD as B64;
use base64::Engine;
use dashmap::DashMap;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use subtle::ConstantTimeEq;

use cachibot_core::{CachibotError, Result};

type HmacSha256 = Hmac<Sha256>;

pub fn hash_password(password: &str) -> Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|h| h.to_string())
        .map_err(|e| CachibotError::Internal(format!("password hashing failed: {e}")))
}

pub fn verify_password(password: &str, hash: &str) -> bool {
    PasswordHash::new(hash)
        .map(|parsed| {
            Argon2::default()
                .verify_password(password.as_bytes(), &parsed)
                .is_ok()
        })
        .unwrap_or(false)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenKind {
    Access,
    Refresh,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TokenClaims {
    pub sub: String,
    pub kind: TokenKind,
    /// Unix expiry timestamp (seconds).
    pub exp: i64,
}

/// Issues and verifies compact HMAC-signed tokens
/// (`base64url(claims).hex(hmac)` joined by a dot).
pub struct TokenService {
    secret: Vec<u8>,
    access_ttl: Duration,
    refresh_ttl: Duration,
}

impl TokenService {
    pub fn new(secret: &str, access_ttl_secs: u64, refresh_ttl_secs: u64) -> Self {
        Self {
            secret: secret.as_bytes().to_vec(),
            access_ttl: Duration::from_secs(access_ttl_secs),
            refresh_ttl: Duration::from_secs(refresh_ttl_secs),
        }
    }

    pub fn issue(&self, user_id: &str, kind: TokenKind) -> Result<String> {
        let ttl = match kind {
            TokenKind::Access => self.access_ttl,
            TokenKind::Refresh => self.refresh_ttl,
        };
        let claims = TokenClaims {
            sub: user_id.to_string(),
            kind,
            exp: (chrono::Utc::now() + chrono::Duration::from_std(ttl).unwrap_or_default())
                .timestamp(),
        };
        let payload = B64.encode(serde_json::to_vec(&claims)?);
        let signature = self.sign(payload.as_bytes());
        Ok(format!("{payload}.{signature}"))
    }

    pub fn verify(&self, token: &str, expected_kind: TokenKind) -> Result<TokenClaims> {
        let (payload, signature) = token
            .split_once('.')
            .ok_or_else(|| CachibotError::AuthFailed("malformed token".to_string()))?;

        let expected = self.sign(payload.as_bytes());
        if expected.as_bytes().ct_eq(signature.as_bytes()).unwrap_u8() != 1 {
            return Err(CachibotError::AuthFailed("invalid signature".to_string()));
        }

        let claims: TokenClaims = serde_json::from_slice(
            &B64.decode(payload)
                .map_err(|_| CachibotError::AuthFailed("malformed payload".to_string()))?,
        )
        .map_err(|_| CachibotError::AuthFailed("malformed claims".to_string()))?;

        if claims.kind != expected_kind {
            return Err(CachibotError::AuthFailed("wrong token kind".to_string()));
        }
        if claims.exp < chrono::Utc::now().timestamp() {
            return Err(CachibotError::AuthFailed("token expired".to_string()));
        }
        Ok(claims)
    }

    fn sign(&self, payload: &[u8]) -> String {
        let mut mac =
            HmacSha256::new_from_slice(&self.secret).expect("HMAC accepts any key length");
        mac.update(payload);
        hex::encode(mac.finalize().into_bytes())
    }
}

/// In-memory per-IP sliding window for login and token-exchange endpoints.
pub struct RateLimiter {
    attempts: DashMap<String, Vec<Instant>>,
    max_attempts: usize,
    window: Duration,
}

impl RateLimiter {
    pub fn new(max_attempts: usize, window: Duration) -> Self {
        Self {
            attempts: DashMap::new(),
            max_attempts,
            window,
        }
    }

    /// Record an attempt for `ip`; returns false when the caller is over
    /// the limit and must receive a 429.
    pub fn check(&self, ip: &str) -> bool {
        let now = Instant::now();
        let mut entry = self.attempts.entry(ip.to_string()).or_default();
        entry.retain(|t| now.duration_since(*t) < self.window);
        if entry.len() >= self.max_attempts {
            return false;
        }
        entry.push(now);
        true
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(5, Duration::from_secs(60))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn password_roundtrip() {
        let hash = hash_password("hunter42").unwrap();
        assert!(verify_password("hunter42", &hash));
        assert!(!verify_password("wrong", &hash));
    }

    #[test]
    fn token_roundtrip() {
        let svc = TokenService::new("secret", 3600, 7200);
        let token = svc.issue("u-1", TokenKind::Access).unwrap();
        let claims = svc.verify(&token, TokenKind::Access).unwrap();
        assert_eq!(claims.sub, "u-1");
    }

    #[test]
    fn token_kind_is_enforced() {
        let svc = TokenService::new("secret", 3600, 7200);
        let refresh = svc.issue("u-1", TokenKind::Refresh).unwrap();
        assert!(svc.verify(&refresh, TokenKind::Access).is_err());
    }

    #[test]
    fn tampered_token_is_rejected() {
        let svc = TokenService::new("secret", 3600, 7200);
        let token = svc.issue("u-1", TokenKind::Access).unwrap();
        let mut tampered = token.clone();
        tampered.truncate(token.len() - 2);
        tampered.push_str("zz");
        assert!(svc.verify(&tampered, TokenKind::Access).is_err());
    }

    #[test]
    fn wrong_secret_is_rejected() {
        let a = TokenService::new("secret-a", 3600, 7200);
        let b = TokenService::new("secret-b", 3600, 7200);
        let token = a.issue("u-1", TokenKind::Access).unwrap();
        assert!(b.verify(&token, TokenKind::Access).is_err());
    }

    #[test]
    fn rate_limiter_caps_attempts() {
        let limiter = RateLimiter::new(5, Duration::from_secs(60));
        for _ in 0..5 {
            assert!(limiter.check("10.0.0.1"));
        }
        assert!(!limiter.check("10.0.0.1"));
        // A different IP has its own window.
        assert!(limiter.check("10.0.0.2"));
    }
}

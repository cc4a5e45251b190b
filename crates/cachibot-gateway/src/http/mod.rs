pub mod auth;
pub mod chat;
pub mod connections;
pub mod env;
pub mod health;
pub mod webhooks;

use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use serde_json::{json, Value};

use cachibot_core::redact;
use cachibot_core::CachibotError;

/// Map a core error onto an HTTP response, scrubbing the message.
pub fn error_response(err: &CachibotError) -> (StatusCode, Json<Value>) {
    let status =
        StatusCode::from_u16(err.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (
        status,
        Json(json!({
            "error": err.code(),
            "detail": redact::scrub(&err.to_string()),
        })),
    )
}

/// Extract the client IP: first X-Forwarded-For entry, else none (the
/// socket address is not plumbed through).
pub fn client_ip(headers: &HeaderMap) -> Option<String> {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|s| s.trim().to_string())
}

/// Extract and verify the bearer token, returning the authenticated user ID.
pub fn bearer_user(
    state: &crate::app::AppState,
    headers: &HeaderMap,
) -> Result<String, CachibotError> {
    let token = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or_else(|| CachibotError::AuthFailed("missing bearer token".to_string()))?;
    let claims = state
        .tokens
        .verify(token, crate::auth::TokenKind::Access)?;
    Ok(claims.sub)
}

/// Ensure `user_id` may manage `bot_id`: the owner or an admin.
pub fn authorize_bot_access(
    state: &crate::app::AppState,
    user_id: &str,
    bot_id: &str,
) -> Result<(), CachibotError> {
    let bot = state
        .store
        .get_bot(bot_id)
        .map_err(|e| CachibotError::Database(e.to_string()))?
        .ok_or_else(|| CachibotError::not_found("bot", bot_id))?;

    if bot.owner_user_id == user_id {
        return Ok(());
    }
    let is_admin = state
        .store
        .get_user(user_id)
        .ok()
        .flatten()
        .map(|u| u.is_admin)
        .unwrap_or(false);
    if is_admin {
        return Ok(());
    }
    Err(CachibotError::Forbidden {
        reason: "not the bot owner".to_string(),
    })
}

//! Login and token refresh. Both endpoints share the per-IP rate limiter.

use std::sync::Arc;

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::warn;

use cachibot_core::CachibotError;

use crate::app::AppState;
use crate::auth::{verify_password, TokenKind};
use crate::http::{client_ip, error_response};

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    /// Username or email.
    pub username: String,
    pub password: String,
}

#[derive(Debug, Deserialize)]
pub struct RefreshRequest {
    pub refresh_token: String,
}

pub async fn login_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<LoginRequest>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let ip = client_ip(&headers).unwrap_or_else(|| "unknown".to_string());
    if !state.login_limiter.check(&ip) {
        warn!(ip = %ip, "login rate limit exceeded");
        return Err(error_response(&CachibotError::RateLimited));
    }

    let user = state
        .store
        .find_user(&body.username)
        .map_err(|e| error_response(&CachibotError::Database(e.to_string())))?
        .filter(|u| verify_password(&body.password, &u.password_hash))
        .ok_or_else(|| {
            // Same response for unknown user and bad password.
            error_response(&CachibotError::AuthFailed("invalid credentials".to_string()))
        })?;

    let access = state
        .tokens
        .issue(&user.id, TokenKind::Access)
        .map_err(|e| error_response(&e))?;
    let refresh = state
        .tokens
        .issue(&user.id, TokenKind::Refresh)
        .map_err(|e| error_response(&e))?;

    Ok(Json(json!({
        "access_token": access,
        "refresh_token": refresh,
        "user": {"id": user.id, "username": user.username, "is_admin": user.is_admin},
    })))
}

pub async fn refresh_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<RefreshRequest>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let ip = client_ip(&headers).unwrap_or_else(|| "unknown".to_string());
    if !state.login_limiter.check(&ip) {
        return Err(error_response(&CachibotError::RateLimited));
    }

    let claims = state
        .tokens
        .verify(&body.refresh_token, TokenKind::Refresh)
        .map_err(|e| error_response(&e))?;
    let access = state
        .tokens
        .issue(&claims.sub, TokenKind::Access)
        .map_err(|e| error_response(&e))?;

    Ok(Json(json!({"access_token": access})))
}

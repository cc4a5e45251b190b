//! Per-bot environment variable routes: masked listing, upsert, delete,
//! reset-all, and the five-layer resolved view. Every mutation writes one
//! audit entry; no response ever carries a plaintext secret.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use cachibot_core::redact::mask_value;
use cachibot_core::CachibotError;
use cachibot_store::audit::AuditActor;

use crate::app::AppState;
use crate::http::{authorize_bot_access, bearer_user, client_ip, error_response};

type ApiResult = Result<Json<Value>, (StatusCode, Json<Value>)>;

#[derive(Debug, Deserialize)]
pub struct UpsertEnvRequest {
    pub value: String,
}

fn actor(user_id: &str, headers: &HeaderMap) -> AuditActor {
    AuditActor {
        user_id: Some(user_id.to_string()),
        ip_address: client_ip(headers),
    }
}

fn guard(
    state: &AppState,
    headers: &HeaderMap,
    bot_id: &str,
) -> Result<String, (StatusCode, Json<Value>)> {
    let user_id = bearer_user(state, headers).map_err(|e| error_response(&e))?;
    authorize_bot_access(state, &user_id, bot_id).map_err(|e| error_response(&e))?;
    Ok(user_id)
}

/// GET /api/bots/{bot_id}/environment — masked values only.
pub async fn list_bot_env(
    State(state): State<Arc<AppState>>,
    Path(bot_id): Path<String>,
    headers: HeaderMap,
) -> ApiResult {
    guard(&state, &headers, &bot_id)?;

    let vars = state
        .store
        .list_bot_env_masked(&state.crypto, &bot_id)
        .map_err(|e| error_response(&CachibotError::Database(e.to_string())))?;
    Ok(Json(json!({"variables": vars})))
}

/// PUT /api/bots/{bot_id}/environment/{key}
pub async fn upsert_bot_env(
    State(state): State<Arc<AppState>>,
    Path((bot_id, key)): Path<(String, String)>,
    headers: HeaderMap,
    Json(body): Json<UpsertEnvRequest>,
) -> ApiResult {
    let user_id = guard(&state, &headers, &bot_id)?;

    if key.trim().is_empty() || body.value.is_empty() {
        return Err(error_response(&CachibotError::Validation(
            "key and value are required".to_string(),
        )));
    }

    let created = state
        .store
        .upsert_bot_env(
            &state.crypto,
            &bot_id,
            &key,
            &body.value,
            "user",
            &actor(&user_id, &headers),
        )
        .map_err(|e| error_response(&CachibotError::Database(e.to_string())))?;

    Ok(Json(json!({
        "key": key,
        "created": created,
        "masked_value": mask_value(&body.value),
    })))
}

/// DELETE /api/bots/{bot_id}/environment/{key}
pub async fn delete_bot_env(
    State(state): State<Arc<AppState>>,
    Path((bot_id, key)): Path<(String, String)>,
    headers: HeaderMap,
) -> ApiResult {
    let user_id = guard(&state, &headers, &bot_id)?;

    let removed = state
        .store
        .delete_bot_env(&bot_id, &key, &actor(&user_id, &headers))
        .map_err(|e| error_response(&CachibotError::Database(e.to_string())))?;
    if !removed {
        return Err(error_response(&CachibotError::not_found("env var", key)));
    }
    Ok(Json(json!({"deleted": key})))
}

/// DELETE /api/bots/{bot_id}/environment — wipe the whole bot layer.
pub async fn reset_bot_env(
    State(state): State<Arc<AppState>>,
    Path(bot_id): Path<String>,
    headers: HeaderMap,
) -> ApiResult {
    let user_id = guard(&state, &headers, &bot_id)?;

    let removed = state
        .store
        .reset_bot_env(&bot_id, &actor(&user_id, &headers))
        .map_err(|e| error_response(&CachibotError::Database(e.to_string())))?;
    Ok(Json(json!({"removed": removed})))
}

/// GET /api/bots/{bot_id}/environment/resolved — the five-layer view with
/// per-key source tags, masked.
pub async fn resolved_view(
    State(state): State<Arc<AppState>>,
    Path(bot_id): Path<String>,
    headers: HeaderMap,
) -> ApiResult {
    guard(&state, &headers, &bot_id)?;

    let resolved = state
        .resolver
        .resolve(&bot_id, "web", None)
        .map_err(|e| error_response(&CachibotError::Database(e.to_string())))?;

    let mut keys = serde_json::Map::new();
    for (provider, value) in &resolved.provider_keys {
        let source = cachibot_env::providers::env_key_for_provider(provider)
            .and_then(|env_key| resolved.sources.get(&env_key.to_lowercase()))
            .cloned()
            .unwrap_or_else(|| "global".to_string());
        keys.insert(
            provider.clone(),
            json!({"masked_value": mask_value(value), "source": source}),
        );
    }

    Ok(Json(json!({
        "provider_keys": keys,
        "model": resolved.model,
        "temperature": resolved.temperature,
        "max_tokens": resolved.max_tokens,
        "max_iterations": resolved.max_iterations,
        "sources": resolved.sources,
        "skills": resolved.skill_configs.keys().collect::<Vec<_>>(),
    })))
}

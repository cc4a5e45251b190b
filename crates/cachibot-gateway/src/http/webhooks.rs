//! Webhook ingress for push-style platforms.
//!
//! Each route resolves the owning adapter by connection ID and hands the
//! raw body plus the platform's signature header to the adapter's
//! `process_webhook`. Signature mismatch maps to 403 with no further
//! processing; the event is otherwise acknowledged even when downstream
//! handling fails, to avoid platform retry storms.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use serde_json::{json, Value};
use tracing::{error, warn};

use cachibot_adapters::{AdapterError, PlatformAdapter};
use cachibot_core::types::PlatformKind;

use crate::app::AppState;

type ApiResult = Result<Json<Value>, (StatusCode, Json<Value>)>;

fn status_error(status: StatusCode, detail: &str) -> (StatusCode, Json<Value>) {
    (status, Json(json!({"error": detail})))
}

/// Look up the running adapter for a connection and check its platform.
fn adapter_for(
    state: &AppState,
    connection_id: &str,
    expected: PlatformKind,
) -> Result<Arc<dyn PlatformAdapter>, (StatusCode, Json<Value>)> {
    let adapter = state.manager.get_adapter(connection_id).ok_or_else(|| {
        warn!(connection = %connection_id, "webhook for unknown or inactive connection");
        status_error(StatusCode::NOT_FOUND, "no active adapter for this connection")
    })?;
    if adapter.platform() != expected {
        warn!(connection = %connection_id, platform = %adapter.platform(),
              "webhook for wrong platform kind");
        return Err(status_error(
            StatusCode::BAD_REQUEST,
            "connection is a different platform",
        ));
    }
    Ok(adapter)
}

fn parse_json(raw: &Bytes) -> Result<Value, (StatusCode, Json<Value>)> {
    serde_json::from_slice(raw)
        .map_err(|_| status_error(StatusCode::BAD_REQUEST, "invalid JSON body"))
}

async fn dispatch(
    adapter: &Arc<dyn PlatformAdapter>,
    connection_id: &str,
    body: &Value,
    raw: &[u8],
    signature: Option<&str>,
) -> ApiResult {
    match adapter.process_webhook(body, raw, signature).await {
        Ok(()) => Ok(Json(json!({"status": "ok"}))),
        Err(AdapterError::Signature) => {
            warn!(connection = %connection_id, "webhook signature validation failed");
            Err(status_error(StatusCode::FORBIDDEN, "invalid signature"))
        }
        Err(AdapterError::Payload(msg)) => {
            Err(status_error(StatusCode::BAD_REQUEST, &msg))
        }
        Err(e) => {
            // Ack to the platform; the failure is ours to log.
            error!(connection = %connection_id, error = %e, "webhook processing failed");
            Ok(Json(json!({"status": "ok"})))
        }
    }
}

// ── WhatsApp ──────────────────────────────────────────────────────────────────

/// GET verification handshake: echo `hub.challenge` when the stored verify
/// token matches.
pub async fn whatsapp_verify(
    State(state): State<Arc<AppState>>,
    Path(connection_id): Path<String>,
    Query(params): Query<std::collections::HashMap<String, String>>,
) -> Result<String, (StatusCode, Json<Value>)> {
    if params.get("hub.mode").map(String::as_str) != Some("subscribe") {
        return Err(status_error(StatusCode::FORBIDDEN, "invalid hub.mode"));
    }

    let connection = state
        .store
        .get_connection(&connection_id)
        .ok()
        .flatten()
        .ok_or_else(|| status_error(StatusCode::NOT_FOUND, "connection not found"))?;
    let config = state
        .crypto
        .decrypt_connection_config(&connection.config, &connection.bot_id)
        .map_err(|_| status_error(StatusCode::INTERNAL_SERVER_ERROR, "config unavailable"))?;

    let expected = config
        .get("verify_token")
        .and_then(|v| v.as_str())
        .unwrap_or_default();
    let provided = params
        .get("hub.verify_token")
        .map(String::as_str)
        .unwrap_or_default();
    if expected.is_empty() || provided != expected {
        warn!(connection = %connection_id, "WhatsApp verification failed: token mismatch");
        return Err(status_error(StatusCode::FORBIDDEN, "invalid verify token"));
    }

    Ok(params.get("hub.challenge").cloned().unwrap_or_default())
}

pub async fn whatsapp_webhook(
    State(state): State<Arc<AppState>>,
    Path(connection_id): Path<String>,
    headers: HeaderMap,
    raw: Bytes,
) -> ApiResult {
    let adapter = adapter_for(&state, &connection_id, PlatformKind::Whatsapp)?;
    let body = parse_json(&raw)?;
    let signature = headers
        .get("x-hub-signature-256")
        .and_then(|v| v.to_str().ok());
    dispatch(&adapter, &connection_id, &body, &raw, signature).await
}

// ── LINE ──────────────────────────────────────────────────────────────────────

pub async fn line_webhook(
    State(state): State<Arc<AppState>>,
    Path(connection_id): Path<String>,
    headers: HeaderMap,
    raw: Bytes,
) -> ApiResult {
    let adapter = adapter_for(&state, &connection_id, PlatformKind::Line)?;
    let body = parse_json(&raw)?;
    let signature = headers
        .get("x-line-signature")
        .and_then(|v| v.to_str().ok());
    dispatch(&adapter, &connection_id, &body, &raw, signature).await
}

// ── Viber ─────────────────────────────────────────────────────────────────────

pub async fn viber_webhook(
    State(state): State<Arc<AppState>>,
    Path(connection_id): Path<String>,
    headers: HeaderMap,
    raw: Bytes,
) -> ApiResult {
    let adapter = adapter_for(&state, &connection_id, PlatformKind::Viber)?;
    let body = parse_json(&raw)?;
    let signature = headers
        .get("x-viber-content-signature")
        .and_then(|v| v.to_str().ok());
    if signature.is_none() {
        return Err(status_error(StatusCode::FORBIDDEN, "missing signature"));
    }
    dispatch(&adapter, &connection_id, &body, &raw, signature).await
}

// ── Teams ─────────────────────────────────────────────────────────────────────

/// Bot Framework activities. The Authorization header travels through as
/// the signature slot; JWT validation is delegated to the Bot Framework
/// trust chain in front of this service.
pub async fn teams_webhook(
    State(state): State<Arc<AppState>>,
    Path(connection_id): Path<String>,
    headers: HeaderMap,
    raw: Bytes,
) -> ApiResult {
    let adapter = adapter_for(&state, &connection_id, PlatformKind::Teams)?;
    let body = parse_json(&raw)?;
    let auth = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok());
    dispatch(&adapter, &connection_id, &body, &raw, auth).await
}

// ── Custom ────────────────────────────────────────────────────────────────────

/// User-provided platforms. The shared key arrives as `X-API-Key` or
/// `Authorization: Bearer`.
pub async fn custom_webhook(
    State(state): State<Arc<AppState>>,
    Path(connection_id): Path<String>,
    headers: HeaderMap,
    raw: Bytes,
) -> ApiResult {
    let adapter = adapter_for(&state, &connection_id, PlatformKind::Custom)?;
    let body = parse_json(&raw)?;

    let api_key = headers
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .or_else(|| {
            headers
                .get("authorization")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.strip_prefix("Bearer "))
        });
    dispatch(&adapter, &connection_id, &body, &raw, api_key).await
}

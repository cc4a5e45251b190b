//! Web chat: run the message pipeline for a control-plane client.
//!
//! The pipeline task runs detached with a cancellation token guarded by the
//! handler future: a client disconnect drops the handler, the guard cancels
//! the token, and the agent run stops cooperatively. The already-persisted
//! user message is retained.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use cachibot_core::types::{InboundMeta, PlatformKind};
use cachibot_core::CachibotError;

use crate::app::AppState;
use crate::http::{authorize_bot_access, bearer_user, error_response};

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    pub message: String,
    /// Stable per-client conversation key; defaults to one shared web chat.
    pub chat_id: Option<String>,
}

pub async fn chat_handler(
    State(state): State<Arc<AppState>>,
    Path(bot_id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<ChatRequest>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let user_id = bearer_user(&state, &headers).map_err(|e| error_response(&e))?;
    authorize_bot_access(&state, &user_id, &bot_id).map_err(|e| error_response(&e))?;

    if body.message.trim().is_empty() {
        return Err(error_response(&CachibotError::Validation(
            "message is required".to_string(),
        )));
    }

    let cancel = CancellationToken::new();
    let _guard = cancel.clone().drop_guard();

    let processor = Arc::clone(&state.processor);
    let platform_chat_id = body.chat_id.unwrap_or_else(|| format!("web-{user_id}"));
    let meta = InboundMeta {
        platform: Some(PlatformKind::Web),
        user_id: Some(user_id.clone()),
        ..Default::default()
    };

    let task = tokio::spawn(async move {
        processor
            .process_message(&bot_id, &platform_chat_id, &body.message, meta, cancel)
            .await
    });

    let response = task
        .await
        .map_err(|e| error_response(&CachibotError::Internal(e.to_string())))?;

    Ok(Json(json!({
        "text": response.text,
        "media": response
            .media
            .iter()
            .map(|m| json!({"type": m.media_type, "data_base64": B64.encode(&m.data)}))
            .collect::<Vec<_>>(),
    })))
}

//! Connection lifecycle routes, delegating to the platform manager.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use serde_json::{json, Value};

use cachibot_adapters::AdapterError;
use cachibot_core::CachibotError;

use crate::app::AppState;
use crate::http::{authorize_bot_access, bearer_user, error_response};

type ApiResult = Result<Json<Value>, (StatusCode, Json<Value>)>;

fn adapter_error(err: AdapterError) -> (StatusCode, Json<Value>) {
    let core_err = match err {
        AdapterError::NotFound(id) => CachibotError::not_found("connection", id),
        AdapterError::Config(msg) => CachibotError::Validation(msg),
        other => CachibotError::Adapter {
            platform: "unknown".to_string(),
            reason: other.to_string(),
        },
    };
    error_response(&core_err)
}

fn guard_connection(
    state: &AppState,
    headers: &HeaderMap,
    connection_id: &str,
) -> Result<(), (StatusCode, Json<Value>)> {
    let user_id = bearer_user(state, headers).map_err(|e| error_response(&e))?;
    let connection = state
        .store
        .get_connection(connection_id)
        .map_err(|e| error_response(&CachibotError::Database(e.to_string())))?
        .ok_or_else(|| error_response(&CachibotError::not_found("connection", connection_id)))?;
    authorize_bot_access(state, &user_id, &connection.bot_id).map_err(|e| error_response(&e))?;
    Ok(())
}

pub async fn connect_handler(
    State(state): State<Arc<AppState>>,
    Path(connection_id): Path<String>,
    headers: HeaderMap,
) -> ApiResult {
    guard_connection(&state, &headers, &connection_id)?;
    state
        .manager
        .connect(&connection_id)
        .await
        .map_err(adapter_error)?;
    Ok(Json(json!({"status": "connected"})))
}

pub async fn disconnect_handler(
    State(state): State<Arc<AppState>>,
    Path(connection_id): Path<String>,
    headers: HeaderMap,
) -> ApiResult {
    guard_connection(&state, &headers, &connection_id)?;
    state
        .manager
        .disconnect(&connection_id)
        .await
        .map_err(adapter_error)?;
    Ok(Json(json!({"status": "disconnected"})))
}

use std::sync::Arc;

use axum::{
    routing::{get, post, put},
    Router,
};

use cachibot_adapters::PlatformManager;
use cachibot_core::config::CachibotConfig;
use cachibot_crypto::EncryptionService;
use cachibot_env::EnvResolver;
use cachibot_pipeline::{MessageProcessor, WebhookDispatcher};
use cachibot_store::Store;

use crate::auth::{RateLimiter, TokenService};

/// Central shared state — passed as Arc<AppState> to all Axum handlers.
pub struct AppState {
    pub config: CachibotConfig,
    pub store: Arc<Store>,
    pub crypto: Arc<EncryptionService>,
    pub resolver: Arc<EnvResolver>,
    pub manager: Arc<PlatformManager>,
    pub processor: Arc<MessageProcessor>,
    pub dispatcher: Arc<WebhookDispatcher>,
    pub tokens: TokenService,
    pub login_limiter: RateLimiter,
    pub broadcaster: Arc<crate::ws::EventBroadcaster>,
}

/// Assemble the full Axum router.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/health", get(crate::http::health::health_handler))
        .route("/api/auth/login", post(crate::http::auth::login_handler))
        .route("/api/auth/refresh", post(crate::http::auth::refresh_handler))
        .route(
            "/api/bots/{bot_id}/environment",
            get(crate::http::env::list_bot_env).delete(crate::http::env::reset_bot_env),
        )
        .route(
            "/api/bots/{bot_id}/environment/resolved",
            get(crate::http::env::resolved_view),
        )
        .route(
            "/api/bots/{bot_id}/environment/{key}",
            put(crate::http::env::upsert_bot_env).delete(crate::http::env::delete_bot_env),
        )
        .route("/api/bots/{bot_id}/chat", post(crate::http::chat::chat_handler))
        .route(
            "/api/connections/{connection_id}/connect",
            post(crate::http::connections::connect_handler),
        )
        .route(
            "/api/connections/{connection_id}/disconnect",
            post(crate::http::connections::disconnect_handler),
        )
        .route(
            "/api/webhooks/whatsapp/{connection_id}",
            get(crate::http::webhooks::whatsapp_verify).post(crate::http::webhooks::whatsapp_webhook),
        )
        .route(
            "/api/webhooks/line/{connection_id}",
            post(crate::http::webhooks::line_webhook),
        )
        .route(
            "/api/webhooks/viber/{connection_id}",
            post(crate::http::webhooks::viber_webhook),
        )
        .route(
            "/api/webhooks/teams/{connection_id}/messages",
            post(crate::http::webhooks::teams_webhook),
        )
        .route(
            "/api/webhooks/custom/{connection_id}",
            post(crate::http::webhooks::custom_webhook),
        )
        .route("/ws", get(crate::ws::ws_handler))
        .with_state(state)
        .layer(tower_http::trace::TraceLayer::new_for_http())
}

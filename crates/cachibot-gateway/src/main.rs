use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use tracing::{info, warn};

mod app;
mod auth;
mod http;
mod ws;

use cachibot_adapters::PlatformManager;
use cachibot_agent::driver::AgentRunner;
use cachibot_agent::types::{AgentRequest, AgentResult};
use cachibot_core::config::CachibotConfig;
use cachibot_core::redact::RedactingWriter;
use cachibot_crypto::EncryptionService;
use cachibot_env::EnvResolver;
use cachibot_pipeline::{ContextBuilder, MessageProcessor, WebhookDispatcher};
use cachibot_store::Store;

#[derive(Parser, Debug)]
#[command(name = "cachibot-gateway", about = "CachiBot control plane and adapter host")]
struct Cli {
    /// Path to cachibot.toml (default: ~/.cachibot/cachibot.toml).
    #[arg(long)]
    config: Option<String>,
}

/// Placeholder agent used until an agent backend is linked in. Keeps the
/// pipeline, adapters, and control plane fully exercisable.
struct UnconfiguredAgent;

#[async_trait::async_trait]
impl AgentRunner for UnconfiguredAgent {
    async fn run(
        &self,
        _request: AgentRequest,
        _cancel: tokio_util::sync::CancellationToken,
    ) -> anyhow::Result<AgentResult> {
        Ok(AgentResult {
            output_text: "No agent backend is configured on this server yet.".to_string(),
            ..Default::default()
        })
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // All log output passes through the secret-redacting writer.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "cachibot_gateway=info,cachibot=info,tower_http=warn".into()),
        )
        .with_writer(RedactingWriter::stdout)
        .init();

    let cli = Cli::parse();
    let config = CachibotConfig::load(cli.config.as_deref()).unwrap_or_else(|e| {
        warn!("config load failed ({e}), using defaults");
        CachibotConfig::default()
    });

    let store = Arc::new(Store::open(&config.database.path)?);
    let crypto = Arc::new(EncryptionService::from_env()?);

    let resolver = Arc::new(EnvResolver::new(
        Arc::clone(&store),
        Arc::clone(&crypto),
        config.agent.clone(),
        config.per_bot_env,
    ));

    let manager = PlatformManager::new(
        Arc::clone(&store),
        Arc::clone(&crypto),
        config.health.clone(),
    );
    let dispatcher = Arc::new(WebhookDispatcher::new(Arc::clone(&store)));
    manager.set_event_sink(Arc::clone(&dispatcher) as Arc<dyn cachibot_adapters::manager::EventSink>);

    let broadcaster = Arc::new(ws::EventBroadcaster::new());
    let context = Arc::new(ContextBuilder::new(Arc::clone(&store), None));

    let processor = Arc::new(
        MessageProcessor::new(
            Arc::clone(&store),
            Arc::clone(&resolver),
            context,
            Arc::new(UnconfiguredAgent),
            Arc::clone(&manager),
            Arc::clone(&dispatcher),
        )
        .with_broadcaster(Arc::clone(&broadcaster) as Arc<dyn cachibot_pipeline::Broadcaster>),
    );
    manager.set_processor(Arc::clone(&processor) as Arc<dyn cachibot_adapters::InboundProcessor>);

    let token_secret = if config.auth.token_secret.is_empty() {
        warn!("auth.token_secret not set; generating an ephemeral secret (tokens won't survive restarts)");
        use rand::RngCore;
        let mut bytes = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        hex::encode(bytes)
    } else {
        config.auth.token_secret.clone()
    };
    let tokens = auth::TokenService::new(
        &token_secret,
        config.auth.access_ttl_secs,
        config.auth.refresh_ttl_secs,
    );

    let bind = config.server.bind.clone();
    let port = config.server.port;

    let state = Arc::new(app::AppState {
        config,
        store,
        crypto,
        resolver,
        manager: Arc::clone(&manager),
        processor,
        dispatcher,
        tokens,
        login_limiter: auth::RateLimiter::default(),
        broadcaster,
    });

    // Reset stale statuses and bring auto-connect connections back up, then
    // start probing them.
    manager.reconnect_all().await;
    manager.start_health_monitor();

    let router = app::build_router(Arc::clone(&state));
    let addr: SocketAddr = format!("{bind}:{port}").parse()?;
    info!("CachiBot gateway listening on {addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("shutting down");
    manager.stop_health_monitor();
    manager.disconnect_all().await;

    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

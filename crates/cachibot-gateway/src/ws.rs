//! Live observation WebSocket.
//!
//! Control-plane clients connect to `/ws` and receive every persisted
//! platform message as a `platform_message` frame. Fan-out rides a tokio
//! broadcast channel; a slow or dead client only loses its own frames.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::broadcast;
use tracing::debug;

use cachibot_pipeline::processor::{BroadcastMessage, Broadcaster};

use crate::app::AppState;

const BROADCAST_CAPACITY: usize = 256;

/// Fan-out of JSON frames to all connected WS clients.
pub struct EventBroadcaster {
    tx: broadcast::Sender<String>,
}

impl EventBroadcaster {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.tx.subscribe()
    }

    pub fn client_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Push a frame to all subscribers; silently drops with none connected.
    pub fn send(&self, payload: String) {
        let _ = self.tx.send(payload);
    }
}

impl Default for EventBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}

impl Broadcaster for EventBroadcaster {
    fn broadcast_platform_message(&self, message: BroadcastMessage) {
        let frame = serde_json::json!({
            "type": "platform_message",
            "bot_id": message.bot_id,
            "chat_id": message.chat_id,
            "role": message.role,
            "content": message.content,
            "message_id": message.message_id,
            "platform": message.platform,
            "metadata": message.metadata,
        });
        match serde_json::to_string(&frame) {
            Ok(payload) => self.send(payload),
            Err(e) => debug!(error = %e, "failed to serialise broadcast frame"),
        }
    }
}

pub async fn ws_handler(
    State(state): State<Arc<AppState>>,
    upgrade: WebSocketUpgrade,
) -> impl IntoResponse {
    upgrade.on_upgrade(move |socket| handle_socket(state, socket))
}

async fn handle_socket(state: Arc<AppState>, socket: WebSocket) {
    let mut rx = state.broadcaster.subscribe();
    let (mut sink, mut stream) = socket.split();

    debug!("ws observer connected");

    loop {
        tokio::select! {
            frame = rx.recv() => {
                match frame {
                    Ok(payload) => {
                        if sink.send(Message::Text(payload.into())).await.is_err() {
                            break;
                        }
                    }
                    // Lagged: this client missed frames; keep going.
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(skipped, "ws observer lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            inbound = stream.next() => {
                match inbound {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {} // observers only receive
                    Some(Err(_)) => break,
                }
            }
        }
    }

    debug!("ws observer disconnected");
}

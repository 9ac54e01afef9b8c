use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        Query, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt, stream::SplitSink, stream::SplitStream};
use serde::Deserialize;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::api::AppState;
use super::hub::{Observer, ProgressMessage, StatusHub};

/// How often to send WebSocket Ping frames.
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// How long to wait for a Pong response before considering the connection dead.
const PONG_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Deserialize)]
pub struct ConnectParams {
    pub client_id: Option<String>,
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<ConnectParams>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    let hub = state.hub.clone();
    ws.on_upgrade(move |socket| handle_socket(socket, hub, params.client_id))
}

async fn handle_socket(socket: WebSocket, hub: StatusHub, client_id: Option<String>) {
    let (sender, receiver) = socket.split();
    let observer = hub.connect(client_id);
    let observer_id = observer.id();
    run_socket_loop(sender, receiver, observer).await;
    hub.disconnect(observer_id);
}

/// Serialize one progress message as a text frame payload.
pub fn encode_message(msg: &ProgressMessage) -> Option<String> {
    match serde_json::to_string(msg) {
        Ok(json) => Some(json),
        Err(e) => {
            warn!(run_id = %msg.run_id, "failed to serialize progress message: {}", e);
            None
        }
    }
}

/// Core WebSocket loop with ping/pong keepalive.
///
/// Forwards hub messages to the socket, ignores client text frames, and
/// exits when the client closes or no Pong arrives within [`PONG_TIMEOUT`].
async fn run_socket_loop(
    mut sender: SplitSink<WebSocket, Message>,
    mut receiver: SplitStream<WebSocket>,
    mut observer: Observer,
) {
    let mut ping_interval = tokio::time::interval(PING_INTERVAL);
    // The first tick completes immediately.
    ping_interval.tick().await;

    let mut last_pong = Instant::now();
    let mut awaiting_pong = false;

    loop {
        tokio::select! {
            _ = ping_interval.tick() => {
                if awaiting_pong && last_pong.elapsed() > PONG_TIMEOUT {
                    debug!(observer_id = observer.id(), "pong timeout");
                    break;
                }
                if sender.send(Message::Ping(Default::default())).await.is_err() {
                    break;
                }
                awaiting_pong = true;
            }

            msg = observer.recv() => {
                let Some(msg) = msg else { break };
                let Some(json) = encode_message(&msg) else { continue };
                if sender.send(Message::Text(json.into())).await.is_err() {
                    break;
                }
            }

            incoming = receiver.next() => {
                match incoming {
                    Some(Ok(Message::Pong(_))) => {
                        last_pong = Instant::now();
                        awaiting_pong = false;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(_)) => break,
                }
            }
        }
    }

    let _ = sender.send(Message::Close(None)).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::update::models::{StatusEvent, StatusKind};

    #[test]
    fn test_encode_message_wire_shape() {
        let msg = ProgressMessage {
            run_id: "3f2a".to_string(),
            event: StatusEvent::new(StatusKind::Staging, "Staging 2 rewritten files..."),
        };
        let json = encode_message(&msg).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed["run_id"], "3f2a");
        assert_eq!(parsed["status"], "STAGING");
        assert!(parsed.get("code").is_none());
    }

    #[test]
    fn test_keepalive_constants() {
        assert!(PONG_TIMEOUT > PING_INTERVAL);
        assert_eq!(PING_INTERVAL, Duration::from_secs(30));
        assert_eq!(PONG_TIMEOUT, Duration::from_secs(60));
    }
}

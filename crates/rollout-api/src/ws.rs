//! WebSocket stream of pipeline events.

use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::Response;
use futures::{SinkExt, StreamExt};
use rollout_scheduler::PipelineEvent;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

use crate::AppState;

/// WebSocket upgrade handler. Every pipeline event is sent to the client
/// as a JSON text message.
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    let events = state.orchestrator.subscribe();
    ws.on_upgrade(move |socket| stream_events(socket, events))
}

async fn stream_events(socket: WebSocket, mut events: broadcast::Receiver<PipelineEvent>) {
    info!("WebSocket connection established");
    let (mut sender, mut receiver) = socket.split();

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => {
                    let Ok(json) = serde_json::to_string(&event) else {
                        continue;
                    };
                    if sender.send(Message::Text(json.into())).await.is_err() {
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "WebSocket client fell behind, events dropped");
                }
                Err(RecvError::Closed) => break,
            },
            msg = receiver.next() => match msg {
                Some(Ok(Message::Close(_))) | None => break,
                Some(Err(e)) => {
                    warn!(error = %e, "WebSocket error");
                    break;
                }
                Some(Ok(_)) => {}
            },
        }
    }

    info!("WebSocket connection closed");
}

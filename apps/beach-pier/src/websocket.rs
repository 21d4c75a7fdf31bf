use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::Response,
};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::handlers::AppState;
use crate::hub::RelayHub;

pub async fn websocket_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> Response {
    let hub = state.hub.clone();
    ws.on_upgrade(move |socket| handle_socket(socket, hub))
}

async fn handle_socket(socket: WebSocket, hub: RelayHub) {
    let (connection_id, mut rx) = hub.connect();
    let (mut ws_tx, mut ws_rx) = socket.split();
    info!(connection_id = %connection_id, "websocket connected");

    // The hub only ever pushes onto the queue; this task owns the socket's write half.
    let writer = tokio::spawn(async move {
        while let Some(envelope) = rx.recv().await {
            let text = match serde_json::to_string(&envelope) {
                Ok(text) => text,
                Err(err) => {
                    warn!(event = %envelope.event, error = %err, "failed to encode envelope");
                    continue;
                }
            };
            if ws_tx.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
        debug!(connection_id = %connection_id, "writer task finished");
    });

    while let Some(frame) = ws_rx.next().await {
        match frame {
            Ok(Message::Text(text)) => hub.handle_text(connection_id, &text),
            Ok(Message::Binary(bytes)) => match std::str::from_utf8(&bytes) {
                Ok(text) => hub.handle_text(connection_id, text),
                Err(_) => debug!(
                    connection_id = %connection_id,
                    len = bytes.len(),
                    "ignoring non-utf8 binary frame"
                ),
            },
            Ok(Message::Close(frame)) => {
                debug!(
                    connection_id = %connection_id,
                    reason = ?frame.map(|f| f.reason.to_string()),
                    "peer closed websocket"
                );
                break;
            }
            // axum answers pings itself
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {}
            Err(err) => {
                warn!(connection_id = %connection_id, error = %err, "websocket read failed");
                break;
            }
        }
    }

    hub.disconnect(connection_id);
    writer.abort();
    info!(connection_id = %connection_id, "websocket disconnected");
}

//! Heartbeat channel: one WebSocket per session.
//!
//! `ping` refreshes the session and is answered with `pong`; `disconnect`
//! tears the session down and closes the socket. A transport close or error
//! triggers the same teardown unless a newer socket has opened for the id.

use super::error::ApiError;
use super::AppState;
use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Path, State, WebSocketUpgrade};
use axum::response::Response;
use futures::{sink::SinkExt, stream::StreamExt};
use tracing::{debug, warn};

pub const PING: &str = "ping";
pub const PONG: &str = "pong";
pub const DISCONNECT: &str = "disconnect";

pub async fn websocket_handler(
    ws: WebSocketUpgrade,
    Path(session_id): Path<String>,
    State(state): State<AppState>,
) -> Result<Response, ApiError> {
    let connection = state.manager.connect(&session_id).await?;
    Ok(ws.on_upgrade(move |socket| handle_socket(socket, session_id, connection, state)))
}

async fn handle_socket(socket: WebSocket, session_id: String, connection: u64, state: AppState) {
    let (mut sender, mut receiver) = socket.split();

    while let Some(message) = receiver.next().await {
        let text = match message {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                debug!("WebSocket error for session {}: {}", session_id, e);
                break;
            }
        };

        match text.as_str() {
            PING => {
                if let Err(e) = state.manager.heartbeat(&session_id).await {
                    warn!("Heartbeat for session {} rejected: {}", session_id, e);
                    break;
                }
                if sender.send(Message::Text(PONG.into())).await.is_err() {
                    break;
                }
            }
            DISCONNECT => {
                state.manager.teardown(&session_id).await;
                sender.send(Message::Close(None)).await.ok();
                return;
            }
            other => debug!("Ignoring message from session {}: {:?}", session_id, other),
        }
    }

    debug!("WebSocket {} for session {} closed", connection, session_id);
    state.manager.disconnect(&session_id, connection).await;
}

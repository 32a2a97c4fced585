// WebSocket transport: one task per connection, pumping frames between the
// socket and the connection's room.

use std::time::Duration;

use axum::{
    extract::{
        ws::{rejection::WebSocketUpgradeRejection, Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    response::{IntoResponse, Response},
};
use flowsync_common::protocol::Frame;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::{current_request_id, with_request_id_scope, RelayError};
use crate::room::{validate_room_id, JoinError, RoomConnection};
use crate::server::AppState;

/// `GET /{room_id}`: validate the room and upgrade to the binary sync protocol.
pub async fn ws_upgrade(
    Path(room_id): Path<String>,
    State(state): State<AppState>,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    if let Err(error) = validate_room_id(&room_id) {
        return RelayError::from(error).into_response();
    }
    if state.registry.is_shutting_down() {
        return RelayError::from(JoinError::ShuttingDown).into_response();
    }
    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => return rejection.into_response(),
    };

    let request_id = current_request_id().unwrap_or_else(|| "unknown".to_string());
    let max_frame_bytes = state.config.max_frame_bytes;
    ws.max_frame_size(max_frame_bytes)
        .max_message_size(max_frame_bytes)
        .on_upgrade(move |socket| async move {
            let scoped = request_id.clone();
            with_request_id_scope(scoped, handle_socket(state, room_id, request_id, socket)).await;
        })
}

async fn handle_socket(state: AppState, room_id: String, request_id: String, mut socket: WebSocket) {
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<Frame>(state.config.outbound_queue);
    let send_timeout = state.config.heartbeat_interval;

    let connection = match state.registry.join_room(&room_id, outbound_tx).await {
        Ok(connection) => connection,
        Err(error) => {
            warn!(room_id = %room_id, request_id = %request_id, %error, "join rejected");
            let _ = send_bounded(&mut socket, Message::Close(None), send_timeout).await;
            return;
        }
    };
    state.metrics.connection_opened();
    let connection_id = connection.id();
    info!(room_id = %room_id, connection_id = %connection_id, request_id = %request_id, "connection opened");

    let mut heartbeat = tokio::time::interval(state.config.heartbeat_interval);
    heartbeat.reset(); // skip immediate first tick
    let mut missed_pongs: u32 = 0;

    loop {
        tokio::select! {
            biased;

            _ = connection.evicted() => {
                debug!(room_id = %room_id, connection_id = %connection_id, "evicted by room");
                break;
            }
            _ = heartbeat.tick() => {
                if missed_pongs >= state.config.heartbeat_missed_limit {
                    warn!(
                        room_id = %room_id,
                        connection_id = %connection_id,
                        missed_pongs,
                        "heartbeat timeout, disconnecting"
                    );
                    state.metrics.increment_heartbeat_timeouts();
                    break;
                }
                missed_pongs += 1;
                let ping = Message::Ping(Vec::new().into());
                if let Err(error) = send_bounded(&mut socket, ping, send_timeout).await {
                    debug!(room_id = %room_id, connection_id = %connection_id, %error, "ping failed");
                    break;
                }
            }
            maybe_outbound = outbound_rx.recv() => {
                let Some(frame) = maybe_outbound else {
                    debug!(room_id = %room_id, connection_id = %connection_id, "outbound queue closed");
                    break;
                };
                let message = Message::Binary(frame.encode().into());
                if let Err(error) = send_bounded(&mut socket, message, send_timeout).await {
                    warn!(room_id = %room_id, connection_id = %connection_id, %error, "dropping peer");
                    break;
                }
            }
            maybe_message = socket.recv() => {
                let Some(Ok(message)) = maybe_message else {
                    break;
                };
                missed_pongs = 0;

                match message {
                    Message::Binary(payload) => {
                        process_binary(&state, &connection, &payload).await;
                    }
                    Message::Text(_) => {
                        warn!(room_id = %room_id, connection_id = %connection_id, "ignoring text frame");
                        state.metrics.record_ws_frame_error("text");
                    }
                    Message::Ping(payload) => {
                        let pong = Message::Pong(payload);
                        if send_bounded(&mut socket, pong, send_timeout).await.is_err() {
                            break;
                        }
                    }
                    Message::Pong(_) => {}
                    Message::Close(_) => break,
                }
            }
        }
    }

    state.registry.leave_room(&connection).await;
    state.metrics.connection_closed();
    let _ = send_bounded(&mut socket, Message::Close(None), send_timeout).await;
    info!(room_id = %room_id, connection_id = %connection_id, "connection closed");
}

#[derive(Debug, Error)]
enum SendError {
    #[error("socket write failed: {0}")]
    Socket(#[from] axum::Error),
    #[error("peer did not accept the write within {0:?}")]
    Stalled(Duration),
}

/// Write one message, giving up when the peer stops reading for `limit`.
async fn send_bounded(
    socket: &mut WebSocket,
    message: Message,
    limit: Duration,
) -> Result<(), SendError> {
    match tokio::time::timeout(limit, socket.send(message)).await {
        Ok(result) => Ok(result?),
        Err(_) => Err(SendError::Stalled(limit)),
    }
}

/// Decode and apply one binary message. Bad frames are logged and counted;
/// the connection stays open.
async fn process_binary(state: &AppState, connection: &RoomConnection, payload: &[u8]) {
    let frame = match Frame::decode(payload) {
        Ok(frame) => frame,
        Err(error) => {
            warn!(
                room_id = connection.room_id(),
                connection_id = %connection.id(),
                %error,
                "dropping undecodable frame"
            );
            state.metrics.record_ws_frame_error("decode");
            return;
        }
    };

    let kind = frame.kind.as_str();
    state.metrics.record_ws_frame(kind);
    if let Err(error) = connection.handle_frame(frame).await {
        warn!(
            room_id = connection.room_id(),
            connection_id = %connection.id(),
            kind,
            %error,
            "rejected frame"
        );
        state.metrics.record_ws_frame_error(kind);
    }
}

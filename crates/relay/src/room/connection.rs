use std::sync::Arc;

use flowsync_common::awareness::{AwarenessError, AwarenessUpdate};
use flowsync_common::protocol::{Frame, MessageType};
use flowsync_common::sync::{SyncError, SyncHandler};
use thiserror::Error;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

use super::state::Room;

#[derive(Debug, Error)]
pub enum FrameHandlingError {
    #[error(transparent)]
    Sync(#[from] SyncError),
    #[error(transparent)]
    Awareness(#[from] AwarenessError),
    #[error("connection has left room `{0}`")]
    Detached(String),
}

/// A joined connection's handle on its room.
pub struct RoomConnection {
    id: Uuid,
    room: Arc<Room>,
    evicted: Arc<Notify>,
}

impl RoomConnection {
    pub(crate) fn new(id: Uuid, room: Arc<Room>, evicted: Arc<Notify>) -> Self {
        Self { id, room, evicted }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn room_id(&self) -> &str {
        self.room.id()
    }

    pub fn room(&self) -> &Arc<Room> {
        &self.room
    }

    /// Resolves once the room has dropped this peer for falling behind or
    /// because the relay is shutting down. The transport should disconnect
    /// without draining what is still queued.
    pub async fn evicted(&self) {
        self.evicted.notified().await;
    }

    /// Apply one inbound frame inside the room's writer lock and enqueue
    /// whatever replies and fan-out it produces.
    ///
    /// Step1 is answered with Step2 followed by the room's own Step1. The
    /// connection starts receiving broadcasts once its Step2 is queued. A
    /// repeated Step1 is answered the same way.
    pub async fn handle_frame(&self, frame: Frame) -> Result<(), FrameHandlingError> {
        let room_id = self.room.id();
        let mut guard = self.room.state.lock().await;
        let state = &mut *guard;
        let Some(slot) = state.connections.get(&self.id) else {
            return Err(FrameHandlingError::Detached(room_id.to_string()));
        };
        let first_handshake = !slot.handshaken;

        match frame.kind {
            MessageType::SyncStep1 => {
                let outcome = SyncHandler::handle(&mut state.doc, &frame)?;
                if let Some(reply) = outcome.reply {
                    state.send_to(room_id, self.id, reply);
                }
                if let Some(slot) = state.connections.get_mut(&self.id) {
                    slot.handshaken = true;
                }
                let step1 = SyncHandler::step1(&state.doc);
                state.send_to(room_id, self.id, step1);

                if first_handshake && !state.awareness.is_empty() {
                    let presence = Frame::awareness(state.awareness.full_update().encode());
                    state.send_to(room_id, self.id, presence);
                }
                debug!(room_id, connection_id = %self.id, first_handshake, "answered sync step 1");
            }
            MessageType::SyncStep2 | MessageType::Update => {
                let outcome = SyncHandler::handle(&mut state.doc, &frame)?;
                if let Some(update) = outcome.broadcast {
                    let delivered = state.broadcast(room_id, &update, Some(self.id));
                    debug!(room_id, connection_id = %self.id, delivered, "fanned out update");
                }
            }
            MessageType::Awareness => {
                let update = AwarenessUpdate::decode(&frame.payload)?;
                let change = state.awareness.apply_update(&update, Instant::now().into_std());
                if let Some(slot) = state.connections.get_mut(&self.id) {
                    for client in &update.clients {
                        if client.state.is_some() {
                            slot.client_ids.insert(client.client_id);
                        } else {
                            slot.client_ids.remove(&client.client_id);
                        }
                    }
                }
                state.broadcast(room_id, &frame, Some(self.id));
                debug!(
                    room_id,
                    connection_id = %self.id,
                    added = change.added.len(),
                    updated = change.updated.len(),
                    removed = change.removed.len(),
                    "relayed awareness update"
                );
            }
        }
        Ok(())
    }
}

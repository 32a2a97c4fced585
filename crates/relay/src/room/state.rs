use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use flowsync_common::awareness::Awareness;
use flowsync_common::crdt::{ClientId, GraphDoc};
use flowsync_common::protocol::Frame;
use serde::Serialize;
use tokio::sync::{mpsc, mpsc::error::TrySendError, Mutex, Notify};
use tracing::warn;
use uuid::Uuid;

use crate::metrics::RelayMetrics;

/// Sending half of a connection's bounded outbound queue.
pub type Outbound = mpsc::Sender<Frame>;

pub(crate) struct ConnectionSlot {
    /// `None` once the peer was dropped for falling behind or the relay shut down.
    pub(crate) outbound: Option<Outbound>,
    pub(crate) handshaken: bool,
    /// Presence client ids announced over this connection.
    pub(crate) client_ids: BTreeSet<ClientId>,
    /// Wakes the connection task when the room gives up on this peer.
    pub(crate) evicted: Arc<Notify>,
}

impl ConnectionSlot {
    pub(crate) fn new(outbound: Outbound, evicted: Arc<Notify>) -> Self {
        Self { outbound: Some(outbound), handshaken: false, client_ids: BTreeSet::new(), evicted }
    }

    /// Stop queueing to this peer and tell its task to disconnect now.
    pub(crate) fn evict(&mut self) {
        self.outbound = None;
        self.evicted.notify_one();
    }
}

pub(crate) struct RoomState {
    pub(crate) doc: GraphDoc,
    pub(crate) awareness: Awareness,
    pub(crate) connections: HashMap<Uuid, ConnectionSlot>,
    /// Set when the last connection left. A closed room is never reused.
    pub(crate) closed: bool,
    pub(crate) metrics: Arc<RelayMetrics>,
}

impl RoomState {
    /// Enqueue `frame` for one connection.
    pub(crate) fn send_to(&mut self, room_id: &str, connection_id: Uuid, frame: Frame) -> bool {
        match self.connections.get_mut(&connection_id) {
            Some(slot) => deliver(&self.metrics, room_id, connection_id, slot, frame),
            None => false,
        }
    }

    /// Enqueue `frame` for every handshaken connection except `exclude`.
    pub(crate) fn broadcast(&mut self, room_id: &str, frame: &Frame, exclude: Option<Uuid>) -> usize {
        let mut delivered = 0;
        for (connection_id, slot) in &mut self.connections {
            if Some(*connection_id) == exclude || !slot.handshaken {
                continue;
            }
            if deliver(&self.metrics, room_id, *connection_id, slot, frame.clone()) {
                delivered += 1;
            }
        }
        delivered
    }
}

fn deliver(
    metrics: &RelayMetrics,
    room_id: &str,
    connection_id: Uuid,
    slot: &mut ConnectionSlot,
    frame: Frame,
) -> bool {
    let Some(outbound) = &slot.outbound else {
        return false;
    };
    match outbound.try_send(frame) {
        Ok(()) => true,
        Err(TrySendError::Full(_)) => {
            warn!(room_id, connection_id = %connection_id, "outbound queue full, dropping slow peer");
            metrics.increment_slow_peer_disconnects();
            slot.evict();
            false
        }
        Err(TrySendError::Closed(_)) => {
            slot.outbound = None;
            false
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RoomStats {
    pub room_id: String,
    pub connections: usize,
    pub synced_connections: usize,
    pub awareness_clients: usize,
    pub nodes: usize,
    pub edges: usize,
    pub operations: usize,
    pub created_at: DateTime<Utc>,
}

pub struct Room {
    id: String,
    created_at: DateTime<Utc>,
    pub(crate) state: Mutex<RoomState>,
}

impl Room {
    pub(crate) fn new(id: impl Into<String>, metrics: Arc<RelayMetrics>) -> Self {
        Self {
            id: id.into(),
            created_at: Utc::now(),
            state: Mutex::new(RoomState {
                doc: GraphDoc::with_random_client_id(),
                awareness: Awareness::new(),
                connections: HashMap::new(),
                closed: false,
                metrics,
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Fan `frame` out to every synced connection except `exclude`.
    /// Returns how many queues accepted it.
    pub async fn broadcast(&self, frame: &Frame, exclude: Option<Uuid>) -> usize {
        self.state.lock().await.broadcast(&self.id, frame, exclude)
    }

    pub async fn stats(&self) -> RoomStats {
        let state = self.state.lock().await;
        let snapshot = state.doc.snapshot();
        RoomStats {
            room_id: self.id.clone(),
            connections: state.connections.len(),
            synced_connections: state.connections.values().filter(|slot| slot.handshaken).count(),
            awareness_clients: state.awareness.len(),
            nodes: snapshot.nodes.len(),
            edges: snapshot.edges.len(),
            operations: state.doc.op_count(),
            created_at: self.created_at,
        }
    }
}

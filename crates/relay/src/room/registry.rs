use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use flowsync_common::awareness::{AwarenessUpdate, ClientAwareness};
use flowsync_common::protocol::Frame;
use tokio::sync::{Notify, RwLock};
use tracing::{debug, info};
use uuid::Uuid;

use super::connection::RoomConnection;
use super::state::{ConnectionSlot, Outbound, Room, RoomStats};
use super::{validate_room_id, JoinError};
use crate::metrics::RelayMetrics;

/// Owns every live room. Rooms are created by the first join and dropped when
/// their last connection leaves.
pub struct RoomRegistry {
    rooms: RwLock<HashMap<String, Arc<Room>>>,
    shutting_down: AtomicBool,
    awareness_timeout: Duration,
    metrics: Arc<RelayMetrics>,
}

impl RoomRegistry {
    pub fn new(awareness_timeout: Duration, metrics: Arc<RelayMetrics>) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            shutting_down: AtomicBool::new(false),
            awareness_timeout,
            metrics,
        }
    }

    pub fn metrics(&self) -> &Arc<RelayMetrics> {
        &self.metrics
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Add a connection to `room_id`, creating the room if needed.
    pub async fn join_room(
        &self,
        room_id: &str,
        outbound: Outbound,
    ) -> Result<RoomConnection, JoinError> {
        validate_room_id(room_id)?;
        let connection_id = Uuid::new_v4();

        loop {
            if self.is_shutting_down() {
                return Err(JoinError::ShuttingDown);
            }

            let room = {
                let mut rooms = self.rooms.write().await;
                let room = Arc::clone(rooms.entry(room_id.to_string()).or_insert_with(|| {
                    Arc::new(Room::new(room_id, Arc::clone(&self.metrics)))
                }));
                self.metrics.set_active_rooms(rooms.len());
                room
            };

            let mut state = room.state.lock().await;
            if state.closed {
                // Lost a race with the last leave. Drop the stale entry and retry.
                drop(state);
                self.forget(&room).await;
                continue;
            }
            if self.is_shutting_down() {
                if state.connections.is_empty() {
                    state.closed = true;
                }
                drop(state);
                self.forget(&room).await;
                return Err(JoinError::ShuttingDown);
            }

            let evicted = Arc::new(Notify::new());
            state
                .connections
                .insert(connection_id, ConnectionSlot::new(outbound, Arc::clone(&evicted)));
            info!(
                room_id,
                connection_id = %connection_id,
                connections = state.connections.len(),
                "connection joined room"
            );
            drop(state);
            return Ok(RoomConnection::new(connection_id, room, evicted));
        }
    }

    /// Remove a connection, announce its presence removal and drop the room
    /// once it is empty. Safe to call more than once.
    pub async fn leave_room(&self, connection: &RoomConnection) {
        let room = Arc::clone(connection.room());
        let room_id = room.id();

        let now_empty = {
            let mut state = room.state.lock().await;
            let Some(slot) = state.connections.remove(&connection.id()) else {
                return;
            };
            // A client id may have moved to another connection (same id reused
            // in a second tab); that connection still owns its presence.
            let orphaned: Vec<_> = slot
                .client_ids
                .into_iter()
                .filter(|client_id| {
                    !state.connections.values().any(|other| other.client_ids.contains(client_id))
                })
                .collect();
            if let Some(removal) = state.awareness.remove_clients(orphaned) {
                state.broadcast(room_id, &Frame::awareness(removal.encode()), None);
            }
            if state.connections.is_empty() {
                state.closed = true;
            }
            info!(
                room_id,
                connection_id = %connection.id(),
                connections = state.connections.len(),
                "connection left room"
            );
            state.closed
        };

        if now_empty {
            self.forget(&room).await;
            debug!(room_id, "room destroyed");
        }
    }

    /// Reject new joins and close every outbound queue so connection tasks exit.
    pub async fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        let rooms: Vec<Arc<Room>> = {
            let mut rooms = self.rooms.write().await;
            rooms.drain().map(|(_, room)| room).collect()
        };
        self.metrics.set_active_rooms(0);

        for room in rooms {
            let mut state = room.state.lock().await;
            state.closed = true;
            for slot in state.connections.values_mut() {
                slot.evict();
            }
        }
        info!("room registry shut down");
    }

    /// Drop presence entries that were not refreshed within the timeout and
    /// tell the remaining peers. Returns how many entries expired.
    pub async fn sweep_awareness(&self, now: Instant) -> usize {
        let rooms: Vec<Arc<Room>> = self.rooms.read().await.values().cloned().collect();
        let mut expired_total = 0;

        for room in rooms {
            let mut state = room.state.lock().await;
            let expired = state.awareness.expire(now, self.awareness_timeout);
            if expired.is_empty() {
                continue;
            }
            for slot in state.connections.values_mut() {
                for client_id in &expired {
                    slot.client_ids.remove(client_id);
                }
            }

            let removal = AwarenessUpdate {
                clients: expired
                    .iter()
                    .map(|client_id| ClientAwareness { client_id: *client_id, state: None })
                    .collect(),
            };
            state.broadcast(room.id(), &Frame::awareness(removal.encode()), None);
            debug!(room_id = room.id(), expired = expired.len(), "expired stale presence");
            expired_total += expired.len();
        }

        self.metrics.add_awareness_expirations(expired_total);
        expired_total
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn room(&self, room_id: &str) -> Option<Arc<Room>> {
        self.rooms.read().await.get(room_id).cloned()
    }

    pub async fn room_stats(&self, room_id: &str) -> Option<RoomStats> {
        let room = self.room(room_id).await?;
        Some(room.stats().await)
    }

    async fn forget(&self, room: &Arc<Room>) {
        let mut rooms = self.rooms.write().await;
        if rooms.get(room.id()).is_some_and(|current| Arc::ptr_eq(current, room)) {
            rooms.remove(room.id());
        }
        self.metrics.set_active_rooms(rooms.len());
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    use flowsync_common::awareness::{AwarenessState, AwarenessUpdate, ClientAwareness};
    use flowsync_common::crdt::{GraphChange, GraphDoc, NodeUpsert, Position};
    use flowsync_common::protocol::{Frame, MessageType};
    use flowsync_common::sync::SyncHandler;
    use tokio::sync::mpsc;

    use super::RoomRegistry;
    use crate::metrics::RelayMetrics;
    use crate::room::{FrameHandlingError, JoinError, RoomConnection};

    const TIMEOUT: Duration = Duration::from_secs(30);

    fn registry() -> RoomRegistry {
        RoomRegistry::new(TIMEOUT, Arc::new(RelayMetrics::default()))
    }

    async fn join(
        registry: &RoomRegistry,
        room_id: &str,
        capacity: usize,
    ) -> (RoomConnection, mpsc::Receiver<Frame>) {
        let (tx, rx) = mpsc::channel(capacity);
        let connection = registry.join_room(room_id, tx).await.expect("join should succeed");
        (connection, rx)
    }

    async fn handshake(connection: &RoomConnection, rx: &mut mpsc::Receiver<Frame>) {
        let step1 = SyncHandler::step1(&GraphDoc::new(99));
        connection.handle_frame(step1).await.expect("step1 should be handled");
        while let Ok(frame) = rx.try_recv() {
            if frame.kind == MessageType::SyncStep1 {
                break;
            }
        }
    }

    fn node_update(client: u64, id: &str, x: f64) -> Frame {
        let mut doc = GraphDoc::new(client);
        let update = doc
            .apply_local_change(GraphChange::UpsertNode(NodeUpsert::new(id).with_position(x, 0.0)))
            .expect("local change");
        Frame::update(update)
    }

    fn presence(client_id: u64, color: &str) -> Frame {
        let update = AwarenessUpdate {
            clients: vec![ClientAwareness {
                client_id,
                state: Some(AwarenessState::new(color).with_cursor(Some(Position::new(1.0, 1.0)))),
            }],
        };
        Frame::awareness(update.encode())
    }

    #[tokio::test]
    async fn concurrent_first_joins_share_one_room() {
        let registry = Arc::new(registry());
        let (tx_a, _rx_a) = mpsc::channel(8);
        let (tx_b, _rx_b) = mpsc::channel(8);

        let (a, b) = tokio::join!(
            registry.join_room("flow-room", tx_a),
            registry.join_room("flow-room", tx_b)
        );
        let a = a.expect("a should join");
        let b = b.expect("b should join");

        assert_eq!(registry.room_count().await, 1);
        assert!(Arc::ptr_eq(a.room(), b.room()));
        let stats = registry.room_stats("flow-room").await.expect("room exists");
        assert_eq!(stats.connections, 2);
    }

    #[tokio::test]
    async fn invalid_room_ids_are_rejected() {
        let registry = registry();
        let (tx, _rx) = mpsc::channel(1);
        let error = registry.join_room("bad room", tx).await.err().expect("join should fail");
        assert!(matches!(error, JoinError::InvalidRoomId { .. }));
        assert_eq!(registry.room_count().await, 0);
    }

    #[tokio::test]
    async fn step1_is_answered_with_step2_then_server_step1() {
        let registry = registry();
        let (seed, mut seed_rx) = join(&registry, "r", 8).await;
        handshake(&seed, &mut seed_rx).await;
        seed.handle_frame(node_update(1, "1", 0.0)).await.expect("update");

        let (fresh, mut rx) = join(&registry, "r", 8).await;
        fresh
            .handle_frame(SyncHandler::step1(&GraphDoc::new(2)))
            .await
            .expect("step1 should be handled");

        let step2 = rx.try_recv().expect("step2 should be queued");
        assert_eq!(step2.kind, MessageType::SyncStep2);
        let mut replica = GraphDoc::new(2);
        replica.apply_remote_update(&step2.payload).expect("step2 applies");
        assert!(replica.node("1").is_some());

        let step1 = rx.try_recv().expect("server step1 should follow");
        assert_eq!(step1.kind, MessageType::SyncStep1);
    }

    #[tokio::test]
    async fn updates_reach_synced_peers_only() {
        let registry = registry();
        let (a, mut rx_a) = join(&registry, "r", 8).await;
        let (b, mut rx_b) = join(&registry, "r", 8).await;
        let (_c, mut rx_c) = join(&registry, "r", 8).await;
        handshake(&a, &mut rx_a).await;
        handshake(&b, &mut rx_b).await;

        a.handle_frame(node_update(1, "1", 5.0)).await.expect("update");

        let fanned = rx_b.try_recv().expect("b should receive the update");
        assert_eq!(fanned.kind, MessageType::Update);
        assert!(rx_a.try_recv().is_err(), "sender must not get its own update");
        assert!(rx_c.try_recv().is_err(), "unsynced peer must not get updates");

        a.handle_frame(node_update(1, "1", 5.0)).await.expect("duplicate");
        assert!(rx_b.try_recv().is_err(), "duplicate ops are not fanned out again");
    }

    #[tokio::test]
    async fn full_queue_disconnects_only_the_slow_peer() {
        let registry = registry();
        let (a, mut rx_a) = join(&registry, "r", 8).await;
        let (slow, mut rx_slow) = join(&registry, "r", 2).await;
        let (fast, mut rx_fast) = join(&registry, "r", 8).await;
        handshake(&a, &mut rx_a).await;
        handshake(&slow, &mut rx_slow).await;
        handshake(&fast, &mut rx_fast).await;

        let mut author = GraphDoc::new(1);
        let mut fast_received = 0;
        for index in 0..4 {
            let update = author
                .apply_local_change(GraphChange::UpsertNode(
                    NodeUpsert::new(index.to_string()).with_position(0.0, 0.0),
                ))
                .expect("local change");
            a.handle_frame(Frame::update(update)).await.expect("update");
            if let Ok(frame) = rx_fast.try_recv() {
                assert_eq!(frame.kind, MessageType::Update);
                fast_received += 1;
            }
        }
        assert_eq!(fast_received, 4);

        tokio::time::timeout(Duration::from_secs(1), slow.evicted())
            .await
            .expect("slow peer should be told to disconnect");
        assert!(
            tokio::time::timeout(Duration::from_millis(50), fast.evicted()).await.is_err(),
            "peers that keep up stay connected"
        );
        let mut drained = 0;
        while rx_slow.recv().await.is_some() {
            drained += 1;
        }
        assert_eq!(drained, 2, "no frames are queued after the drop");
        assert_eq!(registry.metrics().slow_peer_disconnects(), 1);
        let stats = registry.room_stats("r").await.expect("room survives");
        assert_eq!(stats.connections, 3);
    }

    #[tokio::test]
    async fn leaving_announces_presence_removal_and_drops_empty_room() {
        let registry = registry();
        let (a, mut rx_a) = join(&registry, "r", 8).await;
        let (b, mut rx_b) = join(&registry, "r", 8).await;
        handshake(&a, &mut rx_a).await;
        handshake(&b, &mut rx_b).await;

        a.handle_frame(presence(11, "#ff0000")).await.expect("presence");
        let relayed = rx_b.try_recv().expect("b should see a's presence");
        assert_eq!(relayed.kind, MessageType::Awareness);

        registry.leave_room(&a).await;
        registry.leave_room(&a).await;
        let removal = rx_b.try_recv().expect("b should see the removal");
        let update = AwarenessUpdate::decode(&removal.payload).expect("removal decodes");
        assert_eq!(update.clients, vec![ClientAwareness { client_id: 11, state: None }]);

        registry.leave_room(&b).await;
        assert_eq!(registry.room_count().await, 0);

        let (again, _rx) = join(&registry, "r", 8).await;
        assert!(!Arc::ptr_eq(again.room(), a.room()), "closed rooms are not reused");
    }

    #[tokio::test]
    async fn room_broadcast_skips_the_origin_and_unsynced_peers() {
        let registry = registry();
        let (a, mut rx_a) = join(&registry, "r", 8).await;
        let (b, mut rx_b) = join(&registry, "r", 8).await;
        let (_pending, mut rx_pending) = join(&registry, "r", 8).await;
        handshake(&a, &mut rx_a).await;
        handshake(&b, &mut rx_b).await;

        let frame = node_update(1, "1", 0.0);
        assert_eq!(a.room().broadcast(&frame, Some(a.id())).await, 1);
        assert_eq!(rx_b.try_recv().expect("b is synced"), frame);
        assert!(rx_a.try_recv().is_err(), "origin is excluded");
        assert!(rx_pending.try_recv().is_err(), "no delivery before the handshake");

        registry.leave_room(&b).await;
        drop(rx_b);
        assert_eq!(a.room().broadcast(&frame, None).await, 1, "departed peers are skipped");
    }

    #[tokio::test]
    async fn presence_claimed_by_another_connection_survives_leave() {
        let registry = registry();
        let (first_tab, mut rx_first) = join(&registry, "r", 8).await;
        let (second_tab, mut rx_second) = join(&registry, "r", 8).await;
        let (observer, mut rx_observer) = join(&registry, "r", 8).await;
        handshake(&first_tab, &mut rx_first).await;
        handshake(&second_tab, &mut rx_second).await;
        handshake(&observer, &mut rx_observer).await;

        first_tab.handle_frame(presence(11, "#ff0000")).await.expect("presence");
        second_tab.handle_frame(presence(11, "#00ff00")).await.expect("same client id");
        while rx_observer.try_recv().is_ok() {}

        registry.leave_room(&first_tab).await;
        assert!(rx_observer.try_recv().is_err(), "no removal while the id is still claimed");
        assert_eq!(registry.room_stats("r").await.map(|stats| stats.awareness_clients), Some(1));

        registry.leave_room(&second_tab).await;
        let removal = rx_observer.try_recv().expect("removal once the last claim leaves");
        let update = AwarenessUpdate::decode(&removal.payload).expect("removal decodes");
        assert_eq!(update.clients, vec![ClientAwareness { client_id: 11, state: None }]);
    }

    #[tokio::test]
    async fn sweep_expires_presence_that_stopped_refreshing() {
        let registry = registry();
        let (a, mut rx_a) = join(&registry, "r", 8).await;
        let (b, mut rx_b) = join(&registry, "r", 8).await;
        handshake(&a, &mut rx_a).await;
        handshake(&b, &mut rx_b).await;
        a.handle_frame(presence(11, "#00ff00")).await.expect("presence");
        let _ = rx_b.try_recv();

        assert_eq!(registry.sweep_awareness(Instant::now()).await, 0);
        let expired = registry.sweep_awareness(Instant::now() + TIMEOUT).await;
        assert_eq!(expired, 1);

        let removal = rx_b.try_recv().expect("b should see the expiry");
        let update = AwarenessUpdate::decode(&removal.payload).expect("removal decodes");
        assert_eq!(update.clients[0].state, None);
        assert_eq!(registry.room_stats("r").await.map(|stats| stats.awareness_clients), Some(0));
    }

    #[tokio::test]
    async fn late_joiner_receives_current_presence_after_handshake() {
        let registry = registry();
        let (a, mut rx_a) = join(&registry, "r", 8).await;
        handshake(&a, &mut rx_a).await;
        a.handle_frame(presence(11, "#123456")).await.expect("presence");

        let (b, mut rx_b) = join(&registry, "r", 8).await;
        b.handle_frame(SyncHandler::step1(&GraphDoc::new(2))).await.expect("step1");
        let kinds: Vec<MessageType> =
            std::iter::from_fn(|| rx_b.try_recv().ok()).map(|frame| frame.kind).collect();
        assert_eq!(
            kinds,
            vec![MessageType::SyncStep2, MessageType::SyncStep1, MessageType::Awareness]
        );
    }

    #[tokio::test]
    async fn malformed_frames_leave_room_untouched() {
        let registry = registry();
        let (a, mut rx_a) = join(&registry, "r", 8).await;
        handshake(&a, &mut rx_a).await;
        a.handle_frame(node_update(1, "1", 0.0)).await.expect("update");

        let error = a.handle_frame(Frame::update(vec![1u8, 1, 9])).await.expect_err("bad update");
        assert!(matches!(error, FrameHandlingError::Sync(_)));
        let error = a.handle_frame(Frame::awareness(b"nope".to_vec())).await.expect_err("bad");
        assert!(matches!(error, FrameHandlingError::Awareness(_)));

        let stats = registry.room_stats("r").await.expect("room survives");
        assert_eq!(stats.nodes, 1);
        assert_eq!(stats.connections, 1);
    }

    #[tokio::test]
    async fn shutdown_rejects_joins_and_closes_queues() {
        let registry = registry();
        let (a, mut rx_a) = join(&registry, "r", 8).await;

        registry.shutdown().await;
        tokio::time::timeout(Duration::from_secs(1), a.evicted())
            .await
            .expect("connections are told to disconnect");
        assert!(rx_a.recv().await.is_none());
        assert_eq!(registry.room_count().await, 0);

        let (tx, _rx) = mpsc::channel(1);
        let error = registry.join_room("r", tx).await.err().expect("join should fail");
        assert_eq!(error, JoinError::ShuttingDown);

        registry.leave_room(&a).await;
    }
}

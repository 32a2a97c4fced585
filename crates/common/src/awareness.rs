// Ephemeral presence shared alongside a room's document.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::crdt::{ClientId, Position};

/// Longest accepted color string.
pub const MAX_COLOR_LEN: usize = 64;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AwarenessState {
    #[serde(default)]
    pub cursor: Option<Position>,
    pub color: String,
}

impl AwarenessState {
    pub fn new(color: impl Into<String>) -> Self {
        Self { cursor: None, color: color.into() }
    }

    pub fn with_cursor(mut self, cursor: Option<Position>) -> Self {
        self.cursor = cursor;
        self
    }

    fn validate(&self) -> Result<(), &'static str> {
        if self.color.is_empty() || self.color.len() > MAX_COLOR_LEN {
            return Err("color must be 1..=64 bytes");
        }
        if self.cursor.is_some_and(|cursor| !cursor.is_finite()) {
            return Err("cursor must be finite");
        }
        Ok(())
    }
}

/// One client's entry in an awareness update. `state: None` removes it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientAwareness {
    pub client_id: ClientId,
    pub state: Option<AwarenessState>,
}

/// Wire payload of an awareness frame.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AwarenessUpdate {
    pub clients: Vec<ClientAwareness>,
}

impl AwarenessUpdate {
    pub fn encode(&self) -> Vec<u8> {
        // Plain structs of strings and finite floats always serialize.
        serde_json::to_vec(self).unwrap_or_default()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, AwarenessError> {
        let update: Self = serde_json::from_slice(bytes)
            .map_err(|error| AwarenessError::InvalidPayload(error.to_string()))?;
        for client in &update.clients {
            if let Some(state) = &client.state {
                state.validate().map_err(|reason| AwarenessError::InvalidState {
                    client_id: client.client_id,
                    reason,
                })?;
            }
        }
        Ok(update)
    }

    pub fn client_ids(&self) -> impl Iterator<Item = ClientId> + '_ {
        self.clients.iter().map(|client| client.client_id)
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AwarenessError {
    #[error("awareness payload is not valid: {0}")]
    InvalidPayload(String),
    #[error("awareness state for client {client_id} is not valid: {reason}")]
    InvalidState { client_id: ClientId, reason: &'static str },
    #[error("no local client id configured")]
    NoLocalClient,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AwarenessEntry {
    pub state: AwarenessState,
    pub last_seen: Instant,
    pub last_seen_at: DateTime<Utc>,
}

/// Client ids touched by an applied update.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AwarenessChange {
    pub added: Vec<ClientId>,
    pub updated: Vec<ClientId>,
    pub removed: Vec<ClientId>,
}

impl AwarenessChange {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.removed.is_empty()
    }
}

/// Presence table keyed by client id.
///
/// The relay keeps one without a local client. A session keeps one with its
/// own client id so it can publish and refresh its state.
#[derive(Debug, Clone, Default)]
pub struct Awareness {
    local_client: Option<ClientId>,
    entries: BTreeMap<ClientId, AwarenessEntry>,
}

impl Awareness {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_local_client(client_id: ClientId) -> Self {
        Self { local_client: Some(client_id), entries: BTreeMap::new() }
    }

    pub fn local_client(&self) -> Option<ClientId> {
        self.local_client
    }

    /// Replace the local state and return the update announcing it.
    pub fn set_local_state(
        &mut self,
        state: Option<AwarenessState>,
        now: Instant,
    ) -> Result<AwarenessUpdate, AwarenessError> {
        let client_id = self.local_client.ok_or(AwarenessError::NoLocalClient)?;
        if let Some(state) = &state {
            state
                .validate()
                .map_err(|reason| AwarenessError::InvalidState { client_id, reason })?;
        }

        match state.clone() {
            Some(state) => {
                self.entries.insert(client_id, entry(state, now));
            }
            None => {
                self.entries.remove(&client_id);
            }
        }
        Ok(AwarenessUpdate { clients: vec![ClientAwareness { client_id, state }] })
    }

    pub fn local_state(&self) -> Option<&AwarenessState> {
        self.local_client.and_then(|client_id| self.entries.get(&client_id)).map(|e| &e.state)
    }

    /// Merge a remote update. Each listed client's state is replaced wholesale.
    pub fn apply_update(&mut self, update: &AwarenessUpdate, now: Instant) -> AwarenessChange {
        let mut change = AwarenessChange::default();
        for client in &update.clients {
            if Some(client.client_id) == self.local_client {
                continue;
            }
            match &client.state {
                Some(state) => {
                    let previous = self.entries.insert(client.client_id, entry(state.clone(), now));
                    match previous {
                        None => change.added.push(client.client_id),
                        Some(previous) if previous.state != *state => {
                            change.updated.push(client.client_id)
                        }
                        Some(_) => {}
                    }
                }
                None => {
                    if self.entries.remove(&client.client_id).is_some() {
                        change.removed.push(client.client_id);
                    }
                }
            }
        }
        change
    }

    /// Drop the given clients. Returns the removal update when any were present.
    pub fn remove_clients(
        &mut self,
        client_ids: impl IntoIterator<Item = ClientId>,
    ) -> Option<AwarenessUpdate> {
        let clients: Vec<ClientAwareness> = client_ids
            .into_iter()
            .filter(|client_id| self.entries.remove(client_id).is_some())
            .map(|client_id| ClientAwareness { client_id, state: None })
            .collect();
        (!clients.is_empty()).then_some(AwarenessUpdate { clients })
    }

    /// Drop remote entries not refreshed within `timeout`.
    pub fn expire(&mut self, now: Instant, timeout: Duration) -> Vec<ClientId> {
        let stale: Vec<ClientId> = self
            .entries
            .iter()
            .filter(|(client_id, entry)| {
                Some(**client_id) != self.local_client
                    && now.saturating_duration_since(entry.last_seen) >= timeout
            })
            .map(|(client_id, _)| *client_id)
            .collect();
        for client_id in &stale {
            self.entries.remove(client_id);
        }
        stale
    }

    /// Every known state, for a newly joined peer.
    pub fn full_update(&self) -> AwarenessUpdate {
        AwarenessUpdate {
            clients: self
                .entries
                .iter()
                .map(|(client_id, entry)| ClientAwareness {
                    client_id: *client_id,
                    state: Some(entry.state.clone()),
                })
                .collect(),
        }
    }

    pub fn states(&self) -> &BTreeMap<ClientId, AwarenessEntry> {
        &self.entries
    }

    /// Remote peers and their states, sorted by client id.
    pub fn peers(&self) -> Vec<(ClientId, AwarenessState)> {
        self.entries
            .iter()
            .filter(|(client_id, _)| Some(**client_id) != self.local_client)
            .map(|(client_id, entry)| (*client_id, entry.state.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn entry(state: AwarenessState, now: Instant) -> AwarenessEntry {
    AwarenessEntry { state, last_seen: now, last_seen_at: Utc::now() }
}

/// Random `#rrggbb` presence color.
pub fn random_color() -> String {
    format!("#{:06x}", rand::random::<u32>() & 0x00ff_ffff)
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use super::{
        random_color, Awareness, AwarenessError, AwarenessState, AwarenessUpdate, ClientAwareness,
    };
    use crate::crdt::Position;

    fn remote(client_id: u64, state: Option<AwarenessState>) -> AwarenessUpdate {
        AwarenessUpdate { clients: vec![ClientAwareness { client_id, state }] }
    }

    #[test]
    fn local_state_is_announced_and_kept() {
        let mut awareness = Awareness::with_local_client(7);
        let state = AwarenessState::new("#ff0000").with_cursor(Some(Position::new(1.0, 2.0)));
        let update =
            awareness.set_local_state(Some(state.clone()), Instant::now()).expect("local state");

        assert_eq!(update.clients.len(), 1);
        assert_eq!(update.clients[0].client_id, 7);
        assert_eq!(awareness.local_state(), Some(&state));
        assert!(awareness.peers().is_empty());
    }

    #[test]
    fn relay_table_has_no_local_state() {
        let mut awareness = Awareness::new();
        let error = awareness
            .set_local_state(Some(AwarenessState::new("#000000")), Instant::now())
            .expect_err("relay has no local client");
        assert_eq!(error, AwarenessError::NoLocalClient);
    }

    #[test]
    fn apply_update_reports_added_updated_removed() {
        let mut awareness = Awareness::new();
        let now = Instant::now();

        let change = awareness.apply_update(&remote(1, Some(AwarenessState::new("#111111"))), now);
        assert_eq!(change.added, vec![1]);

        let moved = AwarenessState::new("#111111").with_cursor(Some(Position::new(3.0, 4.0)));
        let change = awareness.apply_update(&remote(1, Some(moved)), now);
        assert_eq!(change.updated, vec![1]);

        let change = awareness.apply_update(&remote(1, None), now);
        assert_eq!(change.removed, vec![1]);
        assert!(awareness.is_empty());

        let change = awareness.apply_update(&remote(1, None), now);
        assert!(change.is_empty());
    }

    #[test]
    fn stale_entries_expire_after_timeout() {
        let mut awareness = Awareness::with_local_client(9);
        let start = Instant::now();
        awareness.set_local_state(Some(AwarenessState::new("#999999")), start).expect("local");
        awareness.apply_update(&remote(1, Some(AwarenessState::new("#111111"))), start);
        awareness.apply_update(
            &remote(2, Some(AwarenessState::new("#222222"))),
            start + Duration::from_secs(20),
        );

        let expired = awareness.expire(start + Duration::from_secs(30), Duration::from_secs(30));
        assert_eq!(expired, vec![1]);
        assert_eq!(awareness.peers().len(), 1);
        assert!(awareness.local_state().is_some());
    }

    #[test]
    fn remove_clients_builds_removal_update() {
        let mut awareness = Awareness::new();
        awareness.apply_update(&remote(4, Some(AwarenessState::new("#444444"))), Instant::now());

        let update = awareness.remove_clients([4, 5]).expect("client 4 was present");
        assert_eq!(update.clients.len(), 1);
        assert_eq!(update.clients[0].state, None);
        assert!(awareness.remove_clients([4]).is_none());
    }

    #[test]
    fn decode_rejects_bad_payloads() {
        assert!(matches!(
            AwarenessUpdate::decode(b"not json"),
            Err(AwarenessError::InvalidPayload(_))
        ));

        let bad = remote(3, Some(AwarenessState::new("")));
        assert!(matches!(
            AwarenessUpdate::decode(&bad.encode()),
            Err(AwarenessError::InvalidState { client_id: 3, .. })
        ));
    }

    #[test]
    fn payload_shape_is_stable_json() {
        let update = remote(5, Some(AwarenessState::new("#abcdef")));
        let value: serde_json::Value =
            serde_json::from_slice(&update.encode()).expect("payload is json");
        assert_eq!(value["clients"][0]["client_id"], 5);
        assert_eq!(value["clients"][0]["state"]["color"], "#abcdef");
        assert!(value["clients"][0]["state"]["cursor"].is_null());
    }

    #[test]
    fn random_color_is_hex_triplet() {
        let color = random_color();
        assert_eq!(color.len(), 7);
        assert!(color.starts_with('#'));
        assert!(color[1..].chars().all(|c| c.is_ascii_hexdigit()));
    }
}

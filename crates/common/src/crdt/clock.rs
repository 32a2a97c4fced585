// Logical clocks and state vectors for the graph CRDT.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Replica identifier. Every document replica (browser tab, relay room) picks
/// one at random when it is created.
pub type ClientId = u64;

/// Identity of a single operation: the author and its per-author sequence.
///
/// Sequences are contiguous per client (1, 2, 3, ...), which is what lets a
/// state vector summarize "everything seen so far" with one number per client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OpId {
    pub client: ClientId,
    pub seq: u64,
}

/// Last-writer-wins ordering key.
///
/// `clock` is a Lamport timestamp, so a write made after observing another
/// write always carries a larger clock. Concurrent writes with equal clocks
/// fall back to the client id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Stamp {
    pub clock: u64,
    pub client: ClientId,
}

impl Stamp {
    pub fn new(clock: u64, client: ClientId) -> Self {
        Self { clock, client }
    }
}

impl Ord for Stamp {
    fn cmp(&self, other: &Self) -> Ordering {
        self.clock.cmp(&other.clock).then_with(|| self.client.cmp(&other.client))
    }
}

impl PartialOrd for Stamp {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Highest contiguous sequence integrated per client.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateVector {
    entries: BTreeMap<ClientId, u64>,
}

impl StateVector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sequence seen for `client`, zero when the client is unknown.
    pub fn get(&self, client: ClientId) -> u64 {
        self.entries.get(&client).copied().unwrap_or(0)
    }

    pub fn set(&mut self, client: ClientId, seq: u64) {
        if seq == 0 {
            self.entries.remove(&client);
        } else {
            self.entries.insert(client, seq);
        }
    }

    /// Returns true when `id` is covered by this vector.
    pub fn contains(&self, id: OpId) -> bool {
        id.seq <= self.get(id.client)
    }

    /// Every entry here is `<=` the matching entry in `other`.
    pub fn is_subset_of(&self, other: &StateVector) -> bool {
        self.entries.iter().all(|(client, seq)| *seq <= other.get(*client))
    }

    pub fn iter(&self) -> impl Iterator<Item = (ClientId, u64)> + '_ {
        self.entries.iter().map(|(client, seq)| (*client, *seq))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl FromIterator<(ClientId, u64)> for StateVector {
    fn from_iter<I: IntoIterator<Item = (ClientId, u64)>>(iter: I) -> Self {
        let mut vector = StateVector::new();
        for (client, seq) in iter {
            vector.set(client, seq);
        }
        vector
    }
}

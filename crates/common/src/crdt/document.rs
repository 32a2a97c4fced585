// Replicated graph document.
//
// Nodes carry one last-writer-wins register per field, edges carry one register
// for their whole body. Deletes leave permanent tombstones, and an edge is
// cascade-tombstoned once any node it has ever pointed at is tombstoned.

use std::collections::{BTreeMap, BTreeSet};

use serde_json::{json, Value};
use thiserror::Error;

use super::clock::{ClientId, OpId, Stamp, StateVector};
use super::graph::{
    Edge, EntityStatus, GraphChange, GraphSnapshot, Node, NodeUpsert, Position, ValidationError,
    DEFAULT_NODE_TYPE,
};
use super::update::{
    decode_state_vector, decode_update, encode_update, DecodeError, Operation,
};

/// How far past its author's first missing sequence number an op may be
/// buffered.
pub const MAX_PENDING_AHEAD: u64 = 4_096;
/// Upper bound on buffered ops across all authors.
pub const MAX_PENDING_OPS: usize = 16_384;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DocError {
    #[error("invalid change: {0}")]
    Invalid(#[from] ValidationError),
    #[error("undecodable payload: {0}")]
    Decode(#[from] DecodeError),
    #[error("op {seq} from client {client} is more than {MAX_PENDING_AHEAD} ops past the first gap at {gap}")]
    TooFarAhead { client: ClientId, seq: u64, gap: u64 },
    #[error("out-of-order buffer would hold {buffered} ops, limit is {MAX_PENDING_OPS}")]
    BufferFull { buffered: usize },
}

/// Result of merging a remote update.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RemoteApply {
    /// The visible graph differs from before the update.
    pub changed: bool,
    /// Operations this replica had never seen (integrated or buffered).
    pub fresh: usize,
}

#[derive(Debug, Clone)]
struct Register<T> {
    value: T,
    stamp: Stamp,
}

impl<T> Register<T> {
    /// Writes `value` when `stamp` beats the current one. Returns true on write.
    fn merge(slot: &mut Option<Register<T>>, value: T, stamp: Stamp) -> bool {
        match slot {
            Some(current) if current.stamp >= stamp => false,
            _ => {
                *slot = Some(Register { value, stamp });
                true
            }
        }
    }
}

#[derive(Debug, Clone, Default)]
struct NodeEntry {
    node_type: Option<Register<String>>,
    position: Option<Register<Position>>,
    data: Option<Register<Value>>,
    tombstone: Option<Stamp>,
}

#[derive(Debug, Clone, Default)]
struct EdgeEntry {
    body: Option<Register<Edge>>,
    /// Every node id any write to this edge has referenced.
    endpoints: BTreeSet<String>,
    tombstone: Option<Stamp>,
}

fn bury(tombstone: &mut Option<Stamp>, stamp: Stamp) {
    *tombstone = Some(tombstone.map_or(stamp, |current| current.max(stamp)));
}

/// One replica of a room's graph.
#[derive(Debug, Clone)]
pub struct GraphDoc {
    client_id: ClientId,
    clock: u64,
    state_vector: StateVector,
    log: Vec<Operation>,
    pending: BTreeMap<OpId, Operation>,
    nodes: BTreeMap<String, NodeEntry>,
    edges: BTreeMap<String, EdgeEntry>,
}

impl GraphDoc {
    pub fn new(client_id: ClientId) -> Self {
        Self {
            client_id,
            clock: 0,
            state_vector: StateVector::new(),
            log: Vec::new(),
            pending: BTreeMap::new(),
            nodes: BTreeMap::new(),
            edges: BTreeMap::new(),
        }
    }

    /// Create a replica with a random 32-bit client id.
    pub fn with_random_client_id() -> Self {
        Self::new(u64::from(rand::random::<u32>()))
    }

    pub fn client_id(&self) -> ClientId {
        self.client_id
    }

    /// Current Lamport clock.
    pub fn clock(&self) -> u64 {
        self.clock
    }

    /// Apply a local edit and return the encoded update for exactly that op.
    pub fn apply_local_change(&mut self, change: GraphChange) -> Result<Vec<u8>, DocError> {
        change.validate()?;

        let seq = self.state_vector.get(self.client_id) + 1;
        self.clock += 1;
        let op = Operation { id: OpId { client: self.client_id, seq }, clock: self.clock, change };
        let encoded = encode_update(std::slice::from_ref(&op));
        self.integrate(op);
        Ok(encoded)
    }

    /// Merge an encoded update from another replica.
    ///
    /// Already integrated ops are skipped. Ops that arrive ahead of a gap in
    /// their author's sequence wait in a buffer until the gap closes. An update
    /// that would push the buffer past [`MAX_PENDING_AHEAD`] or
    /// [`MAX_PENDING_OPS`] is rejected whole and changes nothing.
    pub fn apply_remote_update(&mut self, payload: &[u8]) -> Result<RemoteApply, DocError> {
        let ops: Vec<Operation> = decode_update(payload)?
            .into_iter()
            .filter(|op| !self.state_vector.contains(op.id) && !self.pending.contains_key(&op.id))
            .collect();
        self.check_buffer_limits(&ops)?;

        let mut outcome = RemoteApply::default();
        let mut authors = BTreeSet::new();
        for op in ops {
            let id = op.id;
            if self.pending.insert(id, op).is_none() {
                outcome.fresh += 1;
                authors.insert(id.client);
            }
        }

        for client in authors {
            outcome.changed |= self.drain_pending(client);
        }
        Ok(outcome)
    }

    pub fn state_vector(&self) -> &StateVector {
        &self.state_vector
    }

    /// Ops integrated here that `peer` has not seen, encoded as one update.
    pub fn diff(&self, peer: &StateVector) -> Vec<u8> {
        let missing: Vec<Operation> =
            self.log.iter().filter(|op| !peer.contains(op.id)).cloned().collect();
        encode_update(&missing)
    }

    /// Same as [`GraphDoc::diff`] for an encoded peer state vector.
    pub fn diff_encoded(&self, peer_state_vector: &[u8]) -> Result<Vec<u8>, DocError> {
        let peer = decode_state_vector(peer_state_vector)?;
        Ok(self.diff(&peer))
    }

    /// The whole document as a single update.
    pub fn encode_state_as_update(&self) -> Vec<u8> {
        self.diff(&StateVector::new())
    }

    /// Number of received ops waiting on a sequence gap.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn op_count(&self) -> usize {
        self.log.len()
    }

    pub fn snapshot(&self) -> GraphSnapshot {
        GraphSnapshot {
            nodes: self.nodes.keys().filter_map(|id| self.node(id)).collect(),
            edges: self.edges.keys().filter_map(|id| self.edge(id)).collect(),
        }
    }

    pub fn node(&self, id: &str) -> Option<Node> {
        let entry = self.nodes.get(id)?;
        if entry.tombstone.is_some() {
            return None;
        }
        let position = entry.position.as_ref()?.value;

        Some(Node {
            id: id.to_string(),
            node_type: entry
                .node_type
                .as_ref()
                .map(|register| register.value.clone())
                .unwrap_or_else(|| DEFAULT_NODE_TYPE.to_string()),
            position,
            data: entry.data.as_ref().map(|register| register.value.clone()).unwrap_or(json!({})),
        })
    }

    pub fn edge(&self, id: &str) -> Option<Edge> {
        let entry = self.edges.get(id)?;
        if entry.tombstone.is_some() || self.has_buried_endpoint(entry) {
            return None;
        }
        let body = &entry.body.as_ref()?.value;
        if self.node(&body.source).is_none() || self.node(&body.target).is_none() {
            return None;
        }
        Some(body.clone())
    }

    pub fn node_status(&self, id: &str) -> EntityStatus {
        match self.nodes.get(id) {
            Some(entry) if entry.tombstone.is_some() => EntityStatus::Tombstoned,
            _ if self.node(id).is_some() => EntityStatus::Live,
            _ => EntityStatus::Absent,
        }
    }

    pub fn edge_status(&self, id: &str) -> EntityStatus {
        match self.edges.get(id) {
            Some(entry) if entry.tombstone.is_some() || self.has_buried_endpoint(entry) => {
                EntityStatus::Tombstoned
            }
            _ if self.edge(id).is_some() => EntityStatus::Live,
            _ => EntityStatus::Absent,
        }
    }

    fn has_buried_endpoint(&self, entry: &EdgeEntry) -> bool {
        entry.endpoints.iter().any(|node_id| {
            self.nodes.get(node_id).is_some_and(|node| node.tombstone.is_some())
        })
    }

    /// Reject `ops` (all unseen) if buffering them would exceed the limits.
    fn check_buffer_limits(&self, ops: &[Operation]) -> Result<(), DocError> {
        let mut incoming: BTreeMap<ClientId, BTreeSet<u64>> = BTreeMap::new();
        for op in ops {
            incoming.entry(op.id.client).or_default().insert(op.id.seq);
        }

        let mut buffered = self.pending.len();
        for (client, seqs) in incoming {
            let integrated = self.state_vector.get(client);
            let mut frontier = integrated;
            while seqs.contains(&(frontier + 1))
                || self.pending.contains_key(&OpId { client, seq: frontier + 1 })
            {
                frontier += 1;
            }

            let released = self
                .pending
                .range(OpId { client, seq: integrated + 1 }..=OpId { client, seq: frontier })
                .count();
            buffered -= released;

            for &seq in seqs.range(frontier + 1..) {
                if seq - frontier > MAX_PENDING_AHEAD {
                    return Err(DocError::TooFarAhead { client, seq, gap: frontier + 1 });
                }
                buffered += 1;
            }
        }

        if buffered > MAX_PENDING_OPS {
            return Err(DocError::BufferFull { buffered });
        }
        Ok(())
    }

    /// Integrate `client`'s buffered ops for as long as they follow on.
    fn drain_pending(&mut self, client: ClientId) -> bool {
        let mut changed = false;
        loop {
            let next = OpId { client, seq: self.state_vector.get(client) + 1 };
            let Some(op) = self.pending.remove(&next) else {
                break;
            };
            changed |= self.integrate(op);
        }
        changed
    }

    /// Merge one causally ready op. Returns true when the visible graph changed.
    fn integrate(&mut self, op: Operation) -> bool {
        let stamp = op.stamp();
        self.clock = self.clock.max(op.clock);
        self.state_vector.set(op.id.client, op.id.seq);

        let changed = match &op.change {
            GraphChange::UpsertNode(upsert) => self.merge_node(upsert.clone(), stamp),
            GraphChange::DeleteNode { id } => {
                let was_visible = self.node(id).is_some();
                bury(&mut self.nodes.entry(id.clone()).or_default().tombstone, stamp);
                was_visible
            }
            GraphChange::UpsertEdge(edge) => {
                let before = self.edge(&edge.id);
                let entry = self.edges.entry(edge.id.clone()).or_default();
                entry.endpoints.insert(edge.source.clone());
                entry.endpoints.insert(edge.target.clone());
                Register::merge(&mut entry.body, edge.clone(), stamp);
                before != self.edge(&edge.id)
            }
            GraphChange::DeleteEdge { id } => {
                let was_visible = self.edge(id).is_some();
                bury(&mut self.edges.entry(id.clone()).or_default().tombstone, stamp);
                was_visible
            }
        };

        self.log.push(op);
        changed
    }

    fn merge_node(&mut self, upsert: NodeUpsert, stamp: Stamp) -> bool {
        let before = self.node(&upsert.id);
        let entry = self.nodes.entry(upsert.id.clone()).or_default();
        if let Some(node_type) = upsert.node_type {
            Register::merge(&mut entry.node_type, node_type, stamp);
        }
        if let Some(position) = upsert.position {
            Register::merge(&mut entry.position, position, stamp);
        }
        if let Some(data) = upsert.data {
            Register::merge(&mut entry.data, data, stamp);
        }
        before != self.node(&upsert.id)
    }
}

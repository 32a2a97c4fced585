// Graph CRDT: clocks, graph shapes, the update codec and the merge engine.

pub mod clock;
pub mod document;
pub mod graph;
pub mod update;

pub use clock::{ClientId, OpId, Stamp, StateVector};
pub use document::{DocError, GraphDoc, RemoteApply, MAX_PENDING_AHEAD, MAX_PENDING_OPS};
pub use graph::{
    Edge, EntityStatus, GraphChange, GraphSnapshot, Node, NodeUpsert, Position, ValidationError,
    DEFAULT_NODE_TYPE, MAX_ID_LEN,
};
pub use update::{
    decode_state_vector, decode_update, encode_state_vector, encode_update, DecodeError, Operation,
    UPDATE_FORMAT_VERSION,
};

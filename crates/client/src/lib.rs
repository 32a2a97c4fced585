//! Client session for a flowsync relay room.
//!
//! [`RoomSession`] keeps a local replica of the room's graph in sync with the
//! relay, publishes this client's cursor and reports the cursors of everyone
//! else in the room.

mod changes;
mod session;

pub use changes::DocumentChanges;
pub use session::{PresenceCallback, ReconnectPolicy, RoomSession, SessionOptions};

pub use flowsync_common::awareness::AwarenessState;
pub use flowsync_common::crdt::{ClientId, Edge, GraphChange, GraphSnapshot, NodeUpsert, Position};

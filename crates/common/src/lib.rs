// flowsync-common: graph CRDT, wire framing, sync steps and presence shared by
// the relay and client sessions.

pub mod awareness;
pub mod crdt;
pub mod protocol;
pub mod sync;

//! Room-based WebSocket relay for replicated flow graphs.
//!
//! Each room holds one [`flowsync_common::crdt::GraphDoc`] plus the presence
//! of the clients connected to it. Peers exchange binary sync frames through
//! the room, which applies them under a single writer lock and fans them out.

pub mod config;
pub mod cors;
pub mod error;
pub mod metrics;
pub mod room;
pub mod server;
pub mod ws;

pub use config::{LogFormat, RelayConfig};
pub use server::{ShutdownHandle, SyncServer};

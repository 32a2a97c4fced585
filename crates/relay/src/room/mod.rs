// Rooms: one replicated graph plus presence per room id, shared by every
// connection that joined it.

mod connection;
mod registry;
mod state;

pub use connection::{FrameHandlingError, RoomConnection};
pub use registry::RoomRegistry;
pub use state::{Outbound, Room, RoomStats};

use thiserror::Error;

pub const MAX_ROOM_ID_LEN: usize = 128;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum JoinError {
    #[error("relay is shutting down")]
    ShuttingDown,
    #[error("invalid room id `{room_id}`: {reason}")]
    InvalidRoomId { room_id: String, reason: &'static str },
}

pub fn validate_room_id(room_id: &str) -> Result<(), JoinError> {
    let invalid = |reason| Err(JoinError::InvalidRoomId { room_id: room_id.to_string(), reason });

    if room_id.is_empty() {
        return invalid("must not be empty");
    }
    if room_id.len() > MAX_ROOM_ID_LEN {
        return invalid("longer than 128 bytes");
    }
    if !room_id.bytes().all(|byte| byte.is_ascii_alphanumeric() || matches!(byte, b'-' | b'_' | b'.')) {
        return invalid("contains characters outside [A-Za-z0-9._-]");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{validate_room_id, JoinError};

    #[test]
    fn accepts_typical_room_ids() {
        for room_id in ["flow-room", "team_a.graph", "X9"] {
            assert_eq!(validate_room_id(room_id), Ok(()));
        }
    }

    #[test]
    fn rejects_empty_long_and_odd_ids() {
        let too_long = "r".repeat(129);
        for room_id in ["", too_long.as_str(), "with space", "slash/inside", "emoji🙂"] {
            assert!(matches!(validate_room_id(room_id), Err(JoinError::InvalidRoomId { .. })));
        }
        assert_eq!(validate_room_id(&"r".repeat(128)), Ok(()));
    }
}

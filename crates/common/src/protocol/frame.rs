// Binary sync frames.
//
// Every WebSocket binary message carries exactly one frame:
//
//   frame := type:u8 length:varint payload[length]
//
// Step1 carries an encoded state vector, Step2 and Update carry an encoded
// update, Awareness carries a JSON awareness update.

use bytes::Bytes;
use thiserror::Error;

use crate::crdt::update::{write_varint, Reader};
use crate::crdt::DecodeError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    SyncStep1 = 0,
    SyncStep2 = 1,
    Update = 2,
    Awareness = 3,
}

impl MessageType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::SyncStep1 => "sync_step1",
            Self::SyncStep2 => "sync_step2",
            Self::Update => "update",
            Self::Awareness => "awareness",
        }
    }
}

impl TryFrom<u8> for MessageType {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::SyncStep1),
            1 => Ok(Self::SyncStep2),
            2 => Ok(Self::Update),
            3 => Ok(Self::Awareness),
            other => Err(FrameError::UnknownMessageType(other)),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("empty frame")]
    Empty,
    #[error("unknown message type {0}")]
    UnknownMessageType(u8),
    #[error("malformed frame: {0}")]
    Malformed(#[from] DecodeError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: MessageType,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(kind: MessageType, payload: impl Into<Bytes>) -> Self {
        Self { kind, payload: payload.into() }
    }

    pub fn sync_step1(state_vector: impl Into<Bytes>) -> Self {
        Self::new(MessageType::SyncStep1, state_vector)
    }

    pub fn sync_step2(update: impl Into<Bytes>) -> Self {
        Self::new(MessageType::SyncStep2, update)
    }

    pub fn update(update: impl Into<Bytes>) -> Self {
        Self::new(MessageType::Update, update)
    }

    pub fn awareness(payload: impl Into<Bytes>) -> Self {
        Self::new(MessageType::Awareness, payload)
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.payload.len() + 6);
        buf.push(self.kind as u8);
        write_varint(&mut buf, self.payload.len() as u64);
        buf.extend_from_slice(&self.payload);
        buf
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, FrameError> {
        if bytes.is_empty() {
            return Err(FrameError::Empty);
        }
        let mut reader = Reader::new(bytes);
        let kind = MessageType::try_from(reader.u8()?)?;
        let len = reader.varint()?;
        let len = usize::try_from(len).map_err(|_| DecodeError::UnexpectedEof)?;
        let payload = Bytes::copy_from_slice(reader.take(len)?);
        reader.expect_end()?;
        Ok(Self { kind, payload })
    }
}

#[cfg(test)]
mod tests {
    use super::{Frame, FrameError, MessageType};
    use crate::crdt::DecodeError;

    #[test]
    fn encodes_type_length_and_payload() {
        let frame = Frame::update(vec![9u8, 8, 7]);
        assert_eq!(frame.encode(), vec![2, 3, 9, 8, 7]);
        assert_eq!(Frame::decode(&frame.encode()), Ok(frame));
    }

    #[test]
    fn long_payload_uses_multi_byte_length() {
        let frame = Frame::awareness(vec![b'x'; 300]);
        let encoded = frame.encode();
        assert_eq!(&encoded[..3], &[3, 0xac, 0x02]);
        let decoded = Frame::decode(&encoded).expect("frame should decode");
        assert_eq!(decoded.kind, MessageType::Awareness);
        assert_eq!(decoded.payload.len(), 300);
    }

    #[test]
    fn rejects_unknown_type_and_empty_input() {
        assert_eq!(Frame::decode(&[]), Err(FrameError::Empty));
        assert_eq!(Frame::decode(&[7, 0]), Err(FrameError::UnknownMessageType(7)));
    }

    #[test]
    fn rejects_length_mismatch() {
        assert_eq!(
            Frame::decode(&[0, 4, 1, 2]),
            Err(FrameError::Malformed(DecodeError::UnexpectedEof))
        );
        assert_eq!(
            Frame::decode(&[0, 1, 1, 2]),
            Err(FrameError::Malformed(DecodeError::TrailingBytes(1)))
        );
    }
}

// Versioned binary encoding for graph operations and state vectors.
//
// Layout (all integers are LEB128 varints unless noted):
//
//   update := version:u8 count op*count
//   op     := kind:u8 client seq clock body
//
// Bodies per kind:
//   0 upsert node : id flags:u8 [type] [x:f64le y:f64le] [data:json]
//   1 delete node : id
//   2 upsert edge : id source target flags:u8 [source_handle] [target_handle]
//   3 delete edge : id
//
// Strings and JSON blobs are length-prefixed byte runs.
//
//   state vector := count (client seq)*count

use serde_json::Value;
use thiserror::Error;

use super::clock::{ClientId, OpId, Stamp, StateVector};
use super::graph::{Edge, GraphChange, NodeUpsert, Position, ValidationError};

/// Current update format version.
pub const UPDATE_FORMAT_VERSION: u8 = 1;

const KIND_UPSERT_NODE: u8 = 0;
const KIND_DELETE_NODE: u8 = 1;
const KIND_UPSERT_EDGE: u8 = 2;
const KIND_DELETE_EDGE: u8 = 3;

const NODE_HAS_TYPE: u8 = 0b001;
const NODE_HAS_POSITION: u8 = 0b010;
const NODE_HAS_DATA: u8 = 0b100;
const EDGE_HAS_SOURCE_HANDLE: u8 = 0b01;
const EDGE_HAS_TARGET_HANDLE: u8 = 0b10;

const MAX_VARINT_BYTES: usize = 10;

/// One replicated operation: who wrote it, where it sits in the author's
/// sequence, its Lamport clock and the change itself.
#[derive(Debug, Clone, PartialEq)]
pub struct Operation {
    pub id: OpId,
    pub clock: u64,
    pub change: GraphChange,
}

impl Operation {
    pub fn stamp(&self) -> Stamp {
        Stamp::new(self.clock, self.id.client)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("payload ended unexpectedly")]
    UnexpectedEof,
    #[error("varint exceeds 64 bits")]
    VarintOverflow,
    #[error("unsupported update format version {0}")]
    UnsupportedVersion(u8),
    #[error("unknown operation kind {0}")]
    UnknownKind(u8),
    #[error("operation sequence must start at 1")]
    ZeroSequence,
    #[error("string field is not valid UTF-8")]
    InvalidUtf8,
    #[error("node data is not valid JSON: {0}")]
    InvalidJson(String),
    #[error("{0} trailing bytes after payload")]
    TrailingBytes(usize),
    #[error("operation {client}:{seq} is malformed: {source}")]
    InvalidOperation {
        client: ClientId,
        seq: u64,
        #[source]
        source: ValidationError,
    },
}

pub fn encode_update(ops: &[Operation]) -> Vec<u8> {
    let mut writer = Writer::default();
    writer.u8(UPDATE_FORMAT_VERSION);
    writer.varint(ops.len() as u64);
    for op in ops {
        encode_operation(&mut writer, op);
    }
    writer.finish()
}

pub fn decode_update(bytes: &[u8]) -> Result<Vec<Operation>, DecodeError> {
    let mut reader = Reader::new(bytes);
    let version = reader.u8()?;
    if version != UPDATE_FORMAT_VERSION {
        return Err(DecodeError::UnsupportedVersion(version));
    }

    let count = reader.varint()?;
    let mut ops = Vec::with_capacity((count as usize).min(reader.remaining()));
    for _ in 0..count {
        ops.push(decode_operation(&mut reader)?);
    }
    reader.expect_end()?;
    Ok(ops)
}

impl StateVector {
    pub fn encode(&self) -> Vec<u8> {
        encode_state_vector(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        decode_state_vector(bytes)
    }
}

pub fn encode_state_vector(vector: &StateVector) -> Vec<u8> {
    let mut writer = Writer::default();
    writer.varint(vector.len() as u64);
    for (client, seq) in vector.iter() {
        writer.varint(client);
        writer.varint(seq);
    }
    writer.finish()
}

pub fn decode_state_vector(bytes: &[u8]) -> Result<StateVector, DecodeError> {
    let mut reader = Reader::new(bytes);
    let count = reader.varint()?;
    let mut vector = StateVector::new();
    for _ in 0..count {
        let client = reader.varint()?;
        let seq = reader.varint()?;
        vector.set(client, vector.get(client).max(seq));
    }
    reader.expect_end()?;
    Ok(vector)
}

fn encode_operation(writer: &mut Writer, op: &Operation) {
    let kind = match &op.change {
        GraphChange::UpsertNode(_) => KIND_UPSERT_NODE,
        GraphChange::DeleteNode { .. } => KIND_DELETE_NODE,
        GraphChange::UpsertEdge(_) => KIND_UPSERT_EDGE,
        GraphChange::DeleteEdge { .. } => KIND_DELETE_EDGE,
    };
    writer.u8(kind);
    writer.varint(op.id.client);
    writer.varint(op.id.seq);
    writer.varint(op.clock);

    match &op.change {
        GraphChange::UpsertNode(upsert) => {
            writer.str(&upsert.id);
            let mut flags = 0;
            if upsert.node_type.is_some() {
                flags |= NODE_HAS_TYPE;
            }
            if upsert.position.is_some() {
                flags |= NODE_HAS_POSITION;
            }
            if upsert.data.is_some() {
                flags |= NODE_HAS_DATA;
            }
            writer.u8(flags);
            if let Some(node_type) = &upsert.node_type {
                writer.str(node_type);
            }
            if let Some(position) = upsert.position {
                writer.f64(position.x);
                writer.f64(position.y);
            }
            if let Some(data) = &upsert.data {
                // Serializing a `Value` cannot fail: every key is already a string.
                let raw = serde_json::to_vec(data).unwrap_or_else(|_| b"null".to_vec());
                writer.bytes(&raw);
            }
        }
        GraphChange::DeleteNode { id } | GraphChange::DeleteEdge { id } => writer.str(id),
        GraphChange::UpsertEdge(edge) => {
            writer.str(&edge.id);
            writer.str(&edge.source);
            writer.str(&edge.target);
            let mut flags = 0;
            if edge.source_handle.is_some() {
                flags |= EDGE_HAS_SOURCE_HANDLE;
            }
            if edge.target_handle.is_some() {
                flags |= EDGE_HAS_TARGET_HANDLE;
            }
            writer.u8(flags);
            if let Some(handle) = &edge.source_handle {
                writer.str(handle);
            }
            if let Some(handle) = &edge.target_handle {
                writer.str(handle);
            }
        }
    }
}

fn decode_operation(reader: &mut Reader<'_>) -> Result<Operation, DecodeError> {
    let kind = reader.u8()?;
    let client = reader.varint()?;
    let seq = reader.varint()?;
    let clock = reader.varint()?;
    if seq == 0 {
        return Err(DecodeError::ZeroSequence);
    }

    let change = match kind {
        KIND_UPSERT_NODE => {
            let id = reader.string()?;
            let flags = reader.u8()?;
            let node_type =
                if flags & NODE_HAS_TYPE != 0 { Some(reader.string()?) } else { None };
            let position = if flags & NODE_HAS_POSITION != 0 {
                Some(Position::new(reader.f64()?, reader.f64()?))
            } else {
                None
            };
            let data = if flags & NODE_HAS_DATA != 0 {
                let raw = reader.bytes()?;
                Some(
                    serde_json::from_slice::<Value>(raw)
                        .map_err(|error| DecodeError::InvalidJson(error.to_string()))?,
                )
            } else {
                None
            };
            GraphChange::UpsertNode(NodeUpsert { id, node_type, position, data })
        }
        KIND_DELETE_NODE => GraphChange::DeleteNode { id: reader.string()? },
        KIND_UPSERT_EDGE => {
            let id = reader.string()?;
            let source = reader.string()?;
            let target = reader.string()?;
            let flags = reader.u8()?;
            let source_handle =
                if flags & EDGE_HAS_SOURCE_HANDLE != 0 { Some(reader.string()?) } else { None };
            let target_handle =
                if flags & EDGE_HAS_TARGET_HANDLE != 0 { Some(reader.string()?) } else { None };
            GraphChange::UpsertEdge(Edge { id, source, target, source_handle, target_handle })
        }
        KIND_DELETE_EDGE => GraphChange::DeleteEdge { id: reader.string()? },
        other => return Err(DecodeError::UnknownKind(other)),
    };

    change
        .validate()
        .map_err(|source| DecodeError::InvalidOperation { client, seq, source })?;

    Ok(Operation { id: OpId { client, seq }, clock, change })
}

#[derive(Default)]
struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    fn u8(&mut self, value: u8) {
        self.buf.push(value);
    }

    fn varint(&mut self, value: u64) {
        write_varint(&mut self.buf, value);
    }

    fn f64(&mut self, value: f64) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    fn bytes(&mut self, value: &[u8]) {
        self.varint(value.len() as u64);
        self.buf.extend_from_slice(value);
    }

    fn str(&mut self, value: &str) {
        self.bytes(value.as_bytes());
    }

    fn finish(self) -> Vec<u8> {
        self.buf
    }
}

/// Cursor over an encoded payload. Shared with the frame codec.
pub(crate) struct Reader<'a> {
    bytes: &'a [u8],
    offset: usize,
}

impl<'a> Reader<'a> {
    pub(crate) fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, offset: 0 }
    }

    pub(crate) fn remaining(&self) -> usize {
        self.bytes.len() - self.offset
    }

    pub(crate) fn position(&self) -> usize {
        self.offset
    }

    pub(crate) fn u8(&mut self) -> Result<u8, DecodeError> {
        let value = *self.bytes.get(self.offset).ok_or(DecodeError::UnexpectedEof)?;
        self.offset += 1;
        Ok(value)
    }

    pub(crate) fn varint(&mut self) -> Result<u64, DecodeError> {
        let mut value: u64 = 0;
        for index in 0..MAX_VARINT_BYTES {
            let byte = self.u8()?;
            let chunk = u64::from(byte & 0x7f);
            if index == MAX_VARINT_BYTES - 1 && chunk > 1 {
                return Err(DecodeError::VarintOverflow);
            }
            value |= chunk << (7 * index);
            if byte & 0x80 == 0 {
                return Ok(value);
            }
        }
        Err(DecodeError::VarintOverflow)
    }

    pub(crate) fn take(&mut self, len: usize) -> Result<&'a [u8], DecodeError> {
        if len > self.remaining() {
            return Err(DecodeError::UnexpectedEof);
        }
        let slice = &self.bytes[self.offset..self.offset + len];
        self.offset += len;
        Ok(slice)
    }

    fn f64(&mut self) -> Result<f64, DecodeError> {
        let raw = self.take(8)?;
        let mut buf = [0u8; 8];
        buf.copy_from_slice(raw);
        Ok(f64::from_le_bytes(buf))
    }

    fn bytes(&mut self) -> Result<&'a [u8], DecodeError> {
        let len = self.varint()?;
        let len = usize::try_from(len).map_err(|_| DecodeError::UnexpectedEof)?;
        self.take(len)
    }

    fn string(&mut self) -> Result<String, DecodeError> {
        let raw = self.bytes()?;
        String::from_utf8(raw.to_vec()).map_err(|_| DecodeError::InvalidUtf8)
    }

    pub(crate) fn expect_end(&self) -> Result<(), DecodeError> {
        match self.remaining() {
            0 => Ok(()),
            extra => Err(DecodeError::TrailingBytes(extra)),
        }
    }
}

/// Appends `value` as a LEB128 varint.
pub(crate) fn write_varint(buf: &mut Vec<u8>, mut value: u64) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            buf.push(byte);
            return;
        }
        buf.push(byte | 0x80);
    }
}

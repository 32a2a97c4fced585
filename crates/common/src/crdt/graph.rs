// Graph shapes carried by the CRDT: nodes, edges and the changes that edit them.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Node type used when no writer has set one.
pub const DEFAULT_NODE_TYPE: &str = "default";

/// Maximum UTF-8 byte length for node/edge ids and handles.
pub const MAX_ID_LEN: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

impl Position {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite()
    }
}

/// A visible node as materialized from the replicated state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    #[serde(rename = "type")]
    pub node_type: String,
    pub position: Position,
    pub data: Value,
}

/// A visible edge. Also the body written by an edge upsert.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Edge {
    pub id: String,
    pub source: String,
    pub target: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_handle: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_handle: Option<String>,
}

impl Edge {
    pub fn new(id: impl Into<String>, source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            source: source.into(),
            target: target.into(),
            source_handle: None,
            target_handle: None,
        }
    }

    /// Edge between two nodes using the `e{source}-{target}` id convention.
    pub fn connect(source: impl Into<String>, target: impl Into<String>) -> Self {
        let source = source.into();
        let target = target.into();
        Self::new(format!("e{source}-{target}"), source, target)
    }

    pub fn with_handles(mut self, source_handle: Option<String>, target_handle: Option<String>) -> Self {
        self.source_handle = source_handle;
        self.target_handle = target_handle;
        self
    }
}

/// Field-level node write. Absent fields leave the current value untouched.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct NodeUpsert {
    pub id: String,
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub node_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<Position>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl NodeUpsert {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into(), ..Self::default() }
    }

    pub fn with_type(mut self, node_type: impl Into<String>) -> Self {
        self.node_type = Some(node_type.into());
        self
    }

    pub fn with_position(mut self, x: f64, y: f64) -> Self {
        self.position = Some(Position::new(x, y));
        self
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.node_type.is_none() && self.position.is_none() && self.data.is_none()
    }
}

impl From<Node> for NodeUpsert {
    fn from(node: Node) -> Self {
        Self {
            id: node.id,
            node_type: Some(node.node_type),
            position: Some(node.position),
            data: Some(node.data),
        }
    }
}

/// A local edit to the graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum GraphChange {
    UpsertNode(NodeUpsert),
    DeleteNode { id: String },
    UpsertEdge(Edge),
    DeleteEdge { id: String },
}

impl GraphChange {
    pub fn delete_node(id: impl Into<String>) -> Self {
        Self::DeleteNode { id: id.into() }
    }

    pub fn delete_edge(id: impl Into<String>) -> Self {
        Self::DeleteEdge { id: id.into() }
    }

    /// Id of the node or edge this change targets.
    pub fn target_id(&self) -> &str {
        match self {
            Self::UpsertNode(upsert) => &upsert.id,
            Self::DeleteNode { id } | Self::DeleteEdge { id } => id,
            Self::UpsertEdge(edge) => &edge.id,
        }
    }

    /// Rejects malformed shapes before they reach the replicated state.
    pub fn validate(&self) -> Result<(), ValidationError> {
        match self {
            Self::UpsertNode(upsert) => {
                validate_id("id", &upsert.id)?;
                if upsert.is_empty() {
                    return Err(ValidationError::EmptyUpsert(upsert.id.clone()));
                }
                if let Some(node_type) = &upsert.node_type {
                    validate_id("type", node_type)?;
                }
                if let Some(position) = upsert.position {
                    if !position.is_finite() {
                        return Err(ValidationError::NonFinitePosition(upsert.id.clone()));
                    }
                }
                Ok(())
            }
            Self::DeleteNode { id } | Self::DeleteEdge { id } => validate_id("id", id),
            Self::UpsertEdge(edge) => {
                validate_id("id", &edge.id)?;
                validate_id("source", &edge.source)?;
                validate_id("target", &edge.target)?;
                if let Some(handle) = &edge.source_handle {
                    validate_id("sourceHandle", handle)?;
                }
                if let Some(handle) = &edge.target_handle {
                    validate_id("targetHandle", handle)?;
                }
                Ok(())
            }
        }
    }
}

fn validate_id(field: &'static str, value: &str) -> Result<(), ValidationError> {
    if value.is_empty() {
        return Err(ValidationError::EmptyField(field));
    }
    if value.len() > MAX_ID_LEN {
        return Err(ValidationError::FieldTooLong { field, len: value.len(), max: MAX_ID_LEN });
    }
    Ok(())
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("`{0}` must not be empty")]
    EmptyField(&'static str),
    #[error("`{field}` exceeds maximum length ({max} bytes), got {len}")]
    FieldTooLong { field: &'static str, len: usize, max: usize },
    #[error("node `{0}` upsert carries no fields")]
    EmptyUpsert(String),
    #[error("node `{0}` position must be finite")]
    NonFinitePosition(String),
}

/// Visible graph at a point in time, sorted by id.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct GraphSnapshot {
    pub nodes: Vec<Node>,
    pub edges: Vec<Edge>,
}

impl GraphSnapshot {
    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.iter().find(|node| node.id == id)
    }

    pub fn edge(&self, id: &str) -> Option<&Edge> {
        self.edges.iter().find(|edge| edge.id == id)
    }
}

/// Lifecycle of an id inside a document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityStatus {
    /// Never written, or written without the fields needed to be visible.
    Absent,
    Live,
    Tombstoned,
}

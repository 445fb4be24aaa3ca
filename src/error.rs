use std::fmt;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Per-node failure raised during a processing pass. These never escape the
/// orchestrator boundary: they become the node's `error` string and force
/// `is_active = false` without touching sibling nodes.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub enum NodeError {
    NotFound(String),
    InvalidInput(String),
    ProcessingFailed(String),
    Serialization(String),
    RecoveryFailed(String),
    Internal(String),
}

impl fmt::Display for NodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeError::NotFound(id) => write!(f, "Node not found: {}", id),
            NodeError::InvalidInput(msg) => write!(f, "Invalid input: {}", msg),
            NodeError::ProcessingFailed(msg) => write!(f, "Processing error: {}", msg),
            NodeError::Serialization(msg) => write!(f, "Serialization error: {}", msg),
            NodeError::RecoveryFailed(msg) => write!(f, "Recovery failed: {}", msg),
            NodeError::Internal(msg) => write!(f, "Internal error: {}", msg),
        }
    }
}

impl std::error::Error for NodeError {}

/// Engine-level failures: malformed documents, topology violations, lookups
/// against ids that were never registered.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("document error: {0}")]
    Document(String),
    #[error("node `{0}` is already registered")]
    DuplicateNode(String),
    #[error("unknown node `{0}`")]
    UnknownNode(String),
    #[error("connection {0} -> {1} would create a cycle")]
    CyclicGraph(String, String),
    #[error("connection {0} -> {1} does not exist")]
    UnknownConnection(String, String),
    #[error(transparent)]
    Node(#[from] NodeError),
}

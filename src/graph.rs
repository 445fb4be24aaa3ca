use std::collections::HashMap;
use std::fmt;
use std::sync::RwLock;

use petgraph::Direction::{Incoming, Outgoing};
use petgraph::graph::NodeIndex;
use petgraph::prelude::StableDiGraph;
use petgraph::visit::EdgeRef;
use schemars::JsonSchema;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::data::NodeData;
use crate::error::EngineError;

/// Typed port identifier. Advisory at this layer: type compatibility is an
/// editor-time concern, the runtime never rejects a value on handle grounds.
#[derive(Debug, Clone, PartialEq, Eq, Hash, JsonSchema)]
pub enum Handle {
    Bool,
    Any,
    Json,
    Other(String),
}

impl Handle {
    pub fn as_str(&self) -> &str {
        match self {
            Handle::Bool => "b",
            Handle::Any => "x",
            Handle::Json => "j",
            Handle::Other(s) => s,
        }
    }
}

impl From<&str> for Handle {
    fn from(s: &str) -> Self {
        match s {
            "b" => Handle::Bool,
            "x" => Handle::Any,
            "j" => Handle::Json,
            other => Handle::Other(other.to_string()),
        }
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for Handle {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Handle {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(Handle::from(raw.as_str()))
    }
}

fn default_handle() -> Handle {
    Handle::Any
}

/// A directed edge between two node ports.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Connection {
    pub source: String,
    pub target: String,
    #[serde(default = "default_handle")]
    pub source_handle: Handle,
    #[serde(default = "default_handle")]
    pub target_handle: Handle,
}

impl Connection {
    pub fn new(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            source_handle: Handle::Any,
            target_handle: Handle::Any,
        }
    }

    pub fn with_handles(mut self, source_handle: Handle, target_handle: Handle) -> Self {
        self.source_handle = source_handle;
        self.target_handle = target_handle;
        self
    }
}

/// A node as it appears in a graph document.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct Node {
    pub id: String,
    pub data: NodeData,
}

impl Node {
    pub fn new(id: impl Into<String>, data: NodeData) -> Self {
        Self {
            id: id.into(),
            data,
        }
    }
}

/// Serialized form of a whole graph: node data keyed by id plus the edges.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
pub struct GraphDocument {
    pub nodes: HashMap<String, NodeData>,
    #[serde(default)]
    pub connections: Vec<Connection>,
}

struct GraphInner {
    graph: StableDiGraph<String, Connection>,
    index_of: HashMap<String, NodeIndex>,
}

/// Topology store: who is connected to whom. Node data lives in the
/// `NodeDataStore`; this only tracks ids and edges, and it is read-only
/// from the processing side.
pub struct GraphStore {
    inner: RwLock<GraphInner>,
}

impl Default for GraphStore {
    fn default() -> Self {
        Self::new()
    }
}

impl GraphStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(GraphInner {
                graph: StableDiGraph::new(),
                index_of: HashMap::new(),
            }),
        }
    }

    pub fn add_node(&self, id: &str) -> bool {
        let mut inner = self.inner.write().expect("graph lock poisoned");
        if inner.index_of.contains_key(id) {
            return false;
        }
        let idx = inner.graph.add_node(id.to_string());
        inner.index_of.insert(id.to_string(), idx);
        true
    }

    pub fn remove_node(&self, id: &str) -> bool {
        let mut inner = self.inner.write().expect("graph lock poisoned");
        match inner.index_of.remove(id) {
            Some(idx) => {
                inner.graph.remove_node(idx);
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, id: &str) -> bool {
        let inner = self.inner.read().expect("graph lock poisoned");
        inner.index_of.contains_key(id)
    }

    pub fn node_ids(&self) -> Vec<String> {
        let inner = self.inner.read().expect("graph lock poisoned");
        inner.index_of.keys().cloned().collect()
    }

    /// Add an edge. Cycles are rejected: monotonic settling is only
    /// guaranteed on a DAG.
    pub fn connect(&self, conn: Connection) -> Result<(), EngineError> {
        let mut inner = self.inner.write().expect("graph lock poisoned");
        let from = *inner
            .index_of
            .get(&conn.source)
            .ok_or_else(|| EngineError::UnknownNode(conn.source.clone()))?;
        let to = *inner
            .index_of
            .get(&conn.target)
            .ok_or_else(|| EngineError::UnknownNode(conn.target.clone()))?;
        let edge = inner.graph.add_edge(from, to, conn.clone());
        if petgraph::algo::is_cyclic_directed(&inner.graph) {
            inner.graph.remove_edge(edge);
            return Err(EngineError::CyclicGraph(conn.source, conn.target));
        }
        Ok(())
    }

    pub fn disconnect(&self, source: &str, target: &str) -> Result<(), EngineError> {
        let mut inner = self.inner.write().expect("graph lock poisoned");
        let edges: Vec<_> = inner
            .graph
            .edge_indices()
            .filter(|&e| {
                inner
                    .graph
                    .edge_weight(e)
                    .map(|c| c.source == source && c.target == target)
                    .unwrap_or(false)
            })
            .collect();
        if edges.is_empty() {
            return Err(EngineError::UnknownConnection(
                source.to_string(),
                target.to_string(),
            ));
        }
        for e in edges {
            inner.graph.remove_edge(e);
        }
        Ok(())
    }

    /// Incoming connections of a node, in insertion order.
    pub fn incoming(&self, id: &str) -> Vec<Connection> {
        self.edges_of(id, Incoming)
    }

    pub fn outgoing(&self, id: &str) -> Vec<Connection> {
        self.edges_of(id, Outgoing)
    }

    /// Incoming connections restricted to one target handle.
    pub fn incoming_for_handle(&self, id: &str, handle: &Handle) -> Vec<Connection> {
        self.incoming(id)
            .into_iter()
            .filter(|c| &c.target_handle == handle)
            .collect()
    }

    pub fn upstream_ids(&self, id: &str) -> Vec<String> {
        let mut out = Vec::new();
        for conn in self.incoming(id) {
            if !out.contains(&conn.source) {
                out.push(conn.source);
            }
        }
        out
    }

    /// Every edge in the graph, for document snapshots.
    pub fn connections(&self) -> Vec<Connection> {
        let inner = self.inner.read().expect("graph lock poisoned");
        inner
            .graph
            .edge_indices()
            .filter_map(|e| inner.graph.edge_weight(e).cloned())
            .collect()
    }

    pub fn downstream_ids(&self, id: &str) -> Vec<String> {
        let mut out = Vec::new();
        for conn in self.outgoing(id) {
            if !out.contains(&conn.target) {
                out.push(conn.target);
            }
        }
        out
    }

    fn edges_of(&self, id: &str, dir: petgraph::Direction) -> Vec<Connection> {
        let inner = self.inner.read().expect("graph lock poisoned");
        let Some(&idx) = inner.index_of.get(id) else {
            return Vec::new();
        };
        let mut edges: Vec<Connection> = inner
            .graph
            .edges_directed(idx, dir)
            .map(|e| e.weight().clone())
            .collect();
        // petgraph yields most-recent-first; normalize to insertion order.
        edges.reverse();
        edges
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{KindData, TextData};

    fn store_abc() -> GraphStore {
        let store = GraphStore::new();
        store.add_node("a");
        store.add_node("b");
        store.add_node("c");
        store
    }

    #[test]
    fn test_handle_wire_codes() {
        assert_eq!(serde_json::to_string(&Handle::Bool).unwrap(), "\"b\"");
        let h: Handle = serde_json::from_str("\"j\"").unwrap();
        assert_eq!(h, Handle::Json);
        let h: Handle = serde_json::from_str("\"custom\"").unwrap();
        assert_eq!(h, Handle::Other("custom".to_string()));
    }

    #[test]
    fn test_connect_and_accessors() {
        let store = store_abc();
        store
            .connect(Connection::new("a", "b").with_handles(Handle::Any, Handle::Bool))
            .unwrap();
        store.connect(Connection::new("c", "b")).unwrap();

        assert_eq!(store.upstream_ids("b"), vec!["a", "c"]);
        assert_eq!(store.downstream_ids("a"), vec!["b"]);
        assert_eq!(store.incoming("b").len(), 2);
        assert_eq!(store.incoming_for_handle("b", &Handle::Bool).len(), 1);
        assert_eq!(store.incoming("a").len(), 0);
    }

    #[test]
    fn test_cycle_is_rejected_and_rolled_back() {
        let store = store_abc();
        store.connect(Connection::new("a", "b")).unwrap();
        store.connect(Connection::new("b", "c")).unwrap();
        let err = store.connect(Connection::new("c", "a")).unwrap_err();
        assert!(matches!(err, EngineError::CyclicGraph(_, _)));
        // The failed edge is gone.
        assert_eq!(store.incoming("a").len(), 0);
    }

    #[test]
    fn test_disconnect_unknown_connection() {
        let store = store_abc();
        assert!(matches!(
            store.disconnect("a", "b"),
            Err(EngineError::UnknownConnection(_, _))
        ));
    }

    #[test]
    fn test_remove_node_drops_edges() {
        let store = store_abc();
        store.connect(Connection::new("a", "b")).unwrap();
        assert!(store.remove_node("a"));
        assert_eq!(store.incoming("b").len(), 0);
        assert!(!store.contains("a"));
    }

    #[test]
    fn test_graph_document_round_trip() {
        let mut doc = GraphDocument::default();
        doc.nodes.insert(
            "t1".to_string(),
            NodeData::new(KindData::Text(TextData {
                text: "hi".to_string(),
            })),
        );
        doc.connections.push(Connection::new("t1", "t2"));
        let json = serde_json::to_string(&doc).unwrap();
        let back: GraphDocument = serde_json::from_str(&json).unwrap();
        assert_eq!(back.nodes.len(), 1);
        assert_eq!(back.connections[0].source_handle, Handle::Any);
    }
}

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dashmap::DashMap;
use serde_json::{Map, Value};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::data::NodeData;
use crate::error::NodeError;

/// Events published on every mutation of the node-data store. Node runtimes
/// subscribe to this bus and re-run their processing pass on relevant ones.
#[derive(Debug, Clone)]
pub enum StoreEvent {
    DataChanged { node_id: String, update_id: Uuid },
    NodeRemoved { node_id: String },
    TopologyChanged,
}

/// The single point of mutation for node data. Everything goes through
/// `update_node_data` merge-patches; no component ever holds a mutable
/// reference into another node's data.
pub struct NodeDataStore {
    nodes: DashMap<String, NodeData>,
    events: broadcast::Sender<StoreEvent>,
}

impl NodeDataStore {
    pub fn new(event_capacity: usize) -> Arc<Self> {
        let (events, _) = broadcast::channel(event_capacity);
        Arc::new(Self {
            nodes: DashMap::new(),
            events,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }

    pub fn get(&self, id: &str) -> Option<NodeData> {
        self.nodes.get(id).map(|entry| entry.clone())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.nodes.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node_ids(&self) -> Vec<String> {
        self.nodes.iter().map(|e| e.key().clone()).collect()
    }

    /// Seed or fully replace a node's data (registration and recovery).
    pub fn insert(&self, id: &str, data: NodeData) {
        self.nodes.insert(id.to_string(), data);
        self.publish_changed(id);
    }

    pub fn remove(&self, id: &str) -> Option<NodeData> {
        let removed = self.nodes.remove(id).map(|(_, data)| data);
        if removed.is_some() {
            let _ = self.events.send(StoreEvent::NodeRemoved {
                node_id: id.to_string(),
            });
        }
        removed
    }

    /// Merge-patch a node's data. Publishes a change event only when the
    /// patch actually altered something.
    pub fn update_node_data(&self, id: &str, patch: &Map<String, Value>) -> Result<bool, NodeError> {
        let changed = {
            let mut entry = self
                .nodes
                .get_mut(id)
                .ok_or_else(|| NodeError::NotFound(id.to_string()))?;
            let (next, changed) = entry.apply_patch(patch)?;
            if changed {
                *entry = next;
            }
            changed
        };
        if changed {
            self.publish_changed(id);
        }
        Ok(changed)
    }

    pub fn publish_topology(&self) {
        let _ = self.events.send(StoreEvent::TopologyChanged);
    }

    fn publish_changed(&self, id: &str) {
        let update_id = Uuid::new_v4();
        debug!(node_id = id, %update_id, "node data changed");
        let _ = self.events.send(StoreEvent::DataChanged {
            node_id: id.to_string(),
            update_id,
        });
    }
}

/// Coalescing buffer in front of `update_node_data` for high-frequency
/// sources (keystroke-driven text edits). Patches for the same node merge
/// in place and flush on a fixed window.
pub struct DebouncedWriter {
    store: Arc<NodeDataStore>,
    pending: Mutex<HashMap<String, Map<String, Value>>>,
    cancel: CancellationToken,
}

impl DebouncedWriter {
    pub fn spawn(store: Arc<NodeDataStore>, window: Duration) -> Arc<Self> {
        let writer = Arc::new(Self {
            store,
            pending: Mutex::new(HashMap::new()),
            cancel: CancellationToken::new(),
        });
        let flusher = writer.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = flusher.cancel.cancelled() => {
                        flusher.flush();
                        break;
                    }
                    _ = tokio::time::sleep(window) => flusher.flush(),
                }
            }
        });
        writer
    }

    /// Merge a patch into the pending buffer; later keys win.
    pub fn submit(&self, id: &str, patch: Map<String, Value>) {
        let mut pending = self.pending.lock().expect("debounce lock poisoned");
        let slot = pending.entry(id.to_string()).or_default();
        for (k, v) in patch {
            slot.insert(k, v);
        }
    }

    pub fn flush(&self) {
        let drained: Vec<(String, Map<String, Value>)> = {
            let mut pending = self.pending.lock().expect("debounce lock poisoned");
            pending.drain().collect()
        };
        for (id, patch) in drained {
            if let Err(e) = self.store.update_node_data(&id, &patch) {
                warn!(node_id = %id, error = %e, "debounced flush failed");
            }
        }
    }

    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

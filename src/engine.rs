use std::sync::Arc;

use dashmap::DashMap;
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::activation::ActivationCache;
use crate::clock::{Clock, TokioClock};
use crate::config::EngineSettings;
use crate::data::{KindData, NodeData};
use crate::delay::DelayProcessor;
use crate::error::{EngineError, NodeError};
use crate::graph::{Connection, GraphDocument, GraphStore, Node};
use crate::propagate::{Propagator, VisualState};
use crate::runtime::{self, NodeRuntime, RuntimeCtx};
use crate::store::{DebouncedWriter, NodeDataStore, StoreEvent};

/// The engine owns the whole reactive surface: the topology, the node data
/// store, the activation cache, both propagation layers, and one orchestrator
/// task per registered node. All mutation funnels through the methods here.
pub struct Engine {
    settings: EngineSettings,
    graph: Arc<GraphStore>,
    store: Arc<NodeDataStore>,
    cache: Arc<ActivationCache>,
    visual: Arc<VisualState>,
    propagator: Arc<Propagator>,
    clock: Arc<dyn Clock>,
    writer: Arc<DebouncedWriter>,
    runtimes: DashMap<String, NodeRuntime>,
}

impl Engine {
    pub fn new(settings: EngineSettings) -> Arc<Self> {
        Self::with_clock(settings, Arc::new(TokioClock::new()))
    }

    /// Construct with an explicit clock, which is how tests drive timers
    /// deterministically.
    pub fn with_clock(settings: EngineSettings, clock: Arc<dyn Clock>) -> Arc<Self> {
        let store = NodeDataStore::new(settings.event_capacity);
        let visual = Arc::new(VisualState::new());
        let propagator = Arc::new(Propagator::new(visual.clone(), store.clone()));
        let writer = DebouncedWriter::spawn(store.clone(), settings.debounce());
        info!(?settings, "engine started");
        Arc::new(Self {
            settings,
            graph: Arc::new(GraphStore::new()),
            store,
            cache: Arc::new(ActivationCache::new()),
            visual,
            propagator,
            clock,
            writer,
            runtimes: DashMap::new(),
        })
    }

    /// Register a node and spawn its orchestrator. Delay nodes additionally
    /// get their queue processor.
    pub fn register_node(&self, node: Node) -> Result<(), EngineError> {
        if self.runtimes.contains_key(&node.id) {
            return Err(EngineError::DuplicateNode(node.id));
        }
        self.graph.add_node(&node.id);
        let pending = match &node.data.kind {
            KindData::Delay(d) => Some(d.queue_items.clone()),
            _ => None,
        };
        self.store.insert(&node.id, node.data);
        let delay = pending.map(|items| {
            let processor = DelayProcessor::new(
                node.id.clone(),
                self.store.clone(),
                self.clock.clone(),
                self.settings.clone(),
            );
            // A loaded document may carry items queued in a previous
            // session; the processor must agree with the node data.
            for item in items {
                processor.push(item);
            }
            processor
        });
        let rt = runtime::spawn(RuntimeCtx {
            node_id: node.id.clone(),
            graph: self.graph.clone(),
            store: self.store.clone(),
            cache: self.cache.clone(),
            propagator: self.propagator.clone(),
            clock: self.clock.clone(),
            settings: self.settings.clone(),
            delay,
        });
        self.runtimes.insert(node.id, rt);
        Ok(())
    }

    /// Destroy a node: cancel its tasks, drop its edges, and scrub every
    /// per-node structure so no stale state survives re-registration.
    pub fn unregister_node(&self, id: &str) -> bool {
        let Some((_, rt)) = self.runtimes.remove(id) else {
            return false;
        };
        rt.cancel.cancel();
        if let Some(delay) = &rt.delay {
            delay.shutdown();
        }
        self.graph.remove_node(id);
        self.cache.remove(id);
        self.propagator.drop_node(id);
        self.store.remove(id);
        self.store.publish_topology();
        debug!(node_id = %id, "node unregistered");
        true
    }

    pub fn connect(&self, conn: Connection) -> Result<(), EngineError> {
        self.graph.connect(conn)?;
        self.store.publish_topology();
        Ok(())
    }

    pub fn disconnect(&self, source: &str, target: &str) -> Result<(), EngineError> {
        self.graph.disconnect(source, target)?;
        self.store.publish_topology();
        Ok(())
    }

    /// The single authoritative entry point for data patches.
    pub fn update_node_data(
        &self,
        id: &str,
        patch: Map<String, Value>,
    ) -> Result<bool, NodeError> {
        self.store.update_node_data(id, &patch)
    }

    /// Coalesce rapid patches (keystroke-rate text edits) into one write per
    /// debounce window.
    pub fn debounced_update(&self, id: &str, patch: Map<String, Value>) {
        self.writer.submit(id, patch);
    }

    /// Reset an errored node to a clean default of its kind, clearing its
    /// queue, cache entry and visual state. If the reset write itself fails
    /// the node is marked with a terminal error instead of being left
    /// half-reset.
    pub fn recover_node(&self, id: &str) -> Result<(), NodeError> {
        let current = self
            .store
            .get(id)
            .ok_or_else(|| NodeError::NotFound(id.to_string()))?;
        if let Some(rt) = self.runtimes.get(id) {
            if let Some(delay) = &rt.delay {
                delay.clear();
            }
        }
        let fresh = NodeData::error_recovery_data(current.tag());
        let result = serde_json::to_value(&fresh)
            .map_err(|e| NodeError::Serialization(e.to_string()))
            .map(|_| {
                self.store.insert(id, fresh);
                self.cache.remove(id);
                self.visual.set(id, false, current.kind.is_pulse_like());
            });
        match result {
            Ok(()) => {
                info!(node_id = %id, "node recovered");
                Ok(())
            }
            Err(e) => {
                warn!(node_id = %id, error = %e, "recovery failed");
                let mut patch = Map::new();
                patch.insert(
                    "error".to_string(),
                    Value::String("Recovery failed, please refresh".to_string()),
                );
                let _ = self.store.update_node_data(id, &patch);
                Err(NodeError::RecoveryFailed(e.to_string()))
            }
        }
    }

    /// Load a whole document, replacing nothing: callers start from an empty
    /// engine. Cycles in the document are rejected before any task runs long.
    pub fn load_document(&self, json: &str) -> Result<(), EngineError> {
        let doc: GraphDocument =
            serde_json::from_str(json).map_err(|e| EngineError::Document(e.to_string()))?;
        for (id, data) in doc.nodes {
            self.register_node(Node::new(id, data))?;
        }
        for conn in doc.connections {
            self.connect(conn)?;
        }
        Ok(())
    }

    /// Serialize the current graph back into a document.
    pub fn snapshot(&self) -> GraphDocument {
        let nodes = self
            .store
            .node_ids()
            .into_iter()
            .filter_map(|id| self.store.get(&id).map(|data| (id, data)))
            .collect();
        GraphDocument {
            nodes,
            connections: self.graph.connections(),
        }
    }

    pub fn node_data(&self, id: &str) -> Option<NodeData> {
        self.store.get(id)
    }

    /// The instant visual layer's view of a node; absent means inactive.
    pub fn visual_active(&self, id: &str) -> bool {
        self.visual.active(id).unwrap_or(false)
    }

    /// Both propagation layers agree for every node.
    pub fn is_settled(&self) -> bool {
        self.propagator.converged()
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<StoreEvent> {
        self.store.subscribe()
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    /// Stop every node task and the debounced writer. Safe to call more
    /// than once.
    pub fn shutdown(&self) {
        for entry in self.runtimes.iter() {
            entry.value().cancel.cancel();
            if let Some(delay) = &entry.value().delay {
                delay.shutdown();
            }
        }
        self.runtimes.clear();
        self.writer.shutdown();
        info!("engine stopped");
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{DelayData, TextData, TransformData};
    use serde_json::json;

    fn text_node(id: &str, text: &str) -> Node {
        Node::new(
            id,
            NodeData::new(KindData::Text(TextData {
                text: text.to_string(),
            })),
        )
    }

    #[tokio::test]
    async fn test_register_rejects_duplicates() {
        let engine = Engine::new(EngineSettings::default());
        engine.register_node(text_node("a", "hi")).unwrap();
        let err = engine.register_node(text_node("a", "again")).unwrap_err();
        assert!(matches!(err, EngineError::DuplicateNode(_)));
        engine.shutdown();
    }

    #[tokio::test]
    async fn test_unregister_scrubs_all_state() {
        let engine = Engine::new(EngineSettings::default());
        engine.register_node(text_node("a", "hi")).unwrap();
        assert!(engine.unregister_node("a"));
        assert!(engine.node_data("a").is_none());
        assert!(!engine.visual_active("a"));
        assert!(!engine.unregister_node("a"));
        engine.shutdown();
    }

    #[tokio::test]
    async fn test_connect_rejects_cycles() {
        let engine = Engine::new(EngineSettings::default());
        engine.register_node(text_node("a", "x")).unwrap();
        engine
            .register_node(Node::new(
                "b",
                NodeData::new(KindData::Transform(TransformData::default())),
            ))
            .unwrap();
        engine.connect(Connection::new("a", "b")).unwrap();
        let err = engine.connect(Connection::new("b", "a")).unwrap_err();
        assert!(matches!(err, EngineError::CyclicGraph(_, _)));
        engine.shutdown();
    }

    #[tokio::test]
    async fn test_snapshot_round_trips_through_document() {
        let engine = Engine::new(EngineSettings::default());
        engine.register_node(text_node("a", "x")).unwrap();
        engine.register_node(text_node("b", "y")).unwrap();
        engine.connect(Connection::new("a", "b")).unwrap();

        let json = serde_json::to_string(&engine.snapshot()).unwrap();
        engine.shutdown();

        let restored = Engine::new(EngineSettings::default());
        restored.load_document(&json).unwrap();
        assert!(restored.node_data("a").is_some());
        assert!(restored.node_data("b").is_some());
        assert_eq!(restored.snapshot().connections.len(), 1);
        restored.shutdown();
    }

    #[tokio::test]
    async fn test_recover_node_resets_to_kind_default() {
        let engine = Engine::new(EngineSettings::default());
        engine.register_node(text_node("a", "x")).unwrap();
        let mut patch = Map::new();
        patch.insert("error".to_string(), json!("boom"));
        engine.update_node_data("a", patch).unwrap();
        assert!(engine.node_data("a").unwrap().error.is_some());

        engine.recover_node("a").unwrap();
        let data = engine.node_data("a").unwrap();
        assert!(data.error.is_none());
        assert!(!data.is_active);
        assert!(!engine.visual_active("a"));
        engine.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_registration_seeds_delay_queue_from_document_data() {
        let engine = Engine::new(EngineSettings::default());
        engine
            .register_node(Node::new(
                "d",
                NodeData::new(KindData::Delay(DelayData {
                    delay_ms: 50,
                    queue_items: vec![json!("restored")],
                    queue_length: 1,
                    ..Default::default()
                })),
            ))
            .unwrap();

        // The seeded item drains through a normal countdown cycle.
        tokio::time::sleep(std::time::Duration::from_millis(500)).await;
        let data = engine.node_data("d").unwrap();
        assert_eq!(data.output_value, Some(json!("restored")));
        match data.kind {
            KindData::Delay(d) => {
                assert_eq!(d.queue_length, 0);
                assert!(d.queue_items.is_empty());
            }
            _ => panic!("kind changed"),
        }
        engine.shutdown();
    }

    #[tokio::test]
    async fn test_recover_unknown_node_is_not_found() {
        let engine = Engine::new(EngineSettings::default());
        let err = engine.recover_node("ghost").unwrap_err();
        assert!(matches!(err, NodeError::NotFound(_)));
        engine.shutdown();
    }
}

use std::sync::Arc;

use dashmap::DashMap;
use serde_json::{Map, Value};
use tracing::debug;

use crate::error::NodeError;
use crate::store::NodeDataStore;

/// Immediate-feedback styling state for one node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VisualEntry {
    pub active: bool,
    /// Compositing hint set for pulse-like kinds (trigger/cycle/delay) whose
    /// activation flips at timer rate.
    pub gpu_hint: bool,
}

/// Fast side-table of node id -> activation used for instant visual
/// feedback, written outside the authoritative data flow. It must converge
/// to `data.is_active` within one reconciliation pass; divergence is only
/// ever transient.
pub struct VisualState {
    entries: DashMap<String, VisualEntry>,
}

impl Default for VisualState {
    fn default() -> Self {
        Self::new()
    }
}

impl VisualState {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    pub fn set(&self, node_id: &str, active: bool, gpu_hint: bool) {
        self.entries
            .insert(node_id.to_string(), VisualEntry { active, gpu_hint });
    }

    pub fn get(&self, node_id: &str) -> Option<VisualEntry> {
        self.entries.get(node_id).map(|e| *e)
    }

    pub fn active(&self, node_id: &str) -> Option<bool> {
        self.get(node_id).map(|e| e.active)
    }

    pub fn remove(&self, node_id: &str) {
        self.entries.remove(node_id);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Dual-layer activation propagation: the visual side-table is written
/// synchronously before the authoritative `is_active` patch is issued, so
/// the styling change is observable with no batching delay.
pub struct Propagator {
    visual: Arc<VisualState>,
    store: Arc<NodeDataStore>,
}

impl Propagator {
    pub fn new(visual: Arc<VisualState>, store: Arc<NodeDataStore>) -> Self {
        Self { visual, store }
    }

    /// Push a new activation value through both layers. Returns whether the
    /// authoritative data actually changed.
    pub fn propagate(&self, node_id: &str, active: bool) -> Result<bool, NodeError> {
        // Liveness guard: a destroyed node must never be re-materialized by
        // a late callback.
        let data = self
            .store
            .get(node_id)
            .ok_or_else(|| NodeError::NotFound(node_id.to_string()))?;

        // Layer 1: instant visual toggle.
        self.visual.set(node_id, active, data.kind.is_pulse_like());
        debug!(node_id, active, "visual activation updated");

        // Layer 2: authoritative patch. Deactivation clears the output
        // fields in the same patch, so a downstream consumer can never read
        // a stale usable value from an inactive node.
        let patch: Map<String, Value> = if active {
            let mut patch = Map::new();
            patch.insert("isActive".to_string(), Value::Bool(true));
            patch
        } else {
            data.deactivation_patch()
        };
        self.store.update_node_data(node_id, &patch)
    }

    pub fn drop_node(&self, node_id: &str) {
        self.visual.remove(node_id);
    }

    /// True when every node's visual entry matches its authoritative
    /// `is_active`. A missing visual entry counts as inactive.
    pub fn converged(&self) -> bool {
        self.store.node_ids().into_iter().all(|id| {
            let authoritative = self.store.get(&id).map(|d| d.is_active).unwrap_or(false);
            let visual = self.visual.active(&id).unwrap_or(false);
            authoritative == visual
        })
    }
}

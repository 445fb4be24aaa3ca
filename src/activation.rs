use std::hash::{DefaultHasher, Hash, Hasher};
use std::time::Instant;

use dashmap::DashMap;
use tracing::error;

use crate::data::{KindData, NodeData};
use crate::error::NodeError;
use crate::graph::Connection;
use crate::value::{extract, is_meaningful};

/// One upstream edge plus the live data of its source node (`None` when the
/// source has already been destroyed).
#[derive(Debug, Clone)]
pub struct UpstreamSnapshot {
    pub connection: Connection,
    pub data: Option<NodeData>,
}

#[derive(Debug, Clone)]
struct CacheEntry {
    fingerprint: u64,
    active: bool,
    #[allow(dead_code)]
    computed_at: Instant,
}

/// Memoized activation results, one entry per live node id. Entries are
/// overwritten on every fingerprint change and removed with the node, so the
/// cache never outgrows the graph.
pub struct ActivationCache {
    entries: DashMap<String, CacheEntry>,
}

impl Default for ActivationCache {
    fn default() -> Self {
        Self::new()
    }
}

impl ActivationCache {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
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

/// Compute whether a node is active. Never panics and never returns an
/// error: any failure inside the computation is logged and read as
/// "inactive" so one bad node cannot take the pass down.
pub fn compute_activation(
    node_id: &str,
    data: &NodeData,
    upstream: &[UpstreamSnapshot],
    cache: &ActivationCache,
    bypass_cache: bool,
) -> bool {
    match try_compute(node_id, data, upstream, cache, bypass_cache) {
        Ok(active) => active,
        Err(e) => {
            error!(node_id, error = %e, "activation computation failed; treating as inactive");
            cache.entries.remove(node_id);
            false
        }
    }
}

fn try_compute(
    node_id: &str,
    data: &NodeData,
    upstream: &[UpstreamSnapshot],
    cache: &ActivationCache,
    bypass_cache: bool,
) -> Result<bool, NodeError> {
    let fingerprint = compute_fingerprint(data, upstream)?;

    if !bypass_cache {
        if let Some(entry) = cache.entries.get(node_id) {
            if entry.fingerprint == fingerprint {
                // A cached `true` is only trusted if the cheap pre-check
                // still predicts activation; otherwise fall through and
                // recompute so deactivation is never delayed by the cache.
                let stale_true = entry.active && !quick_check(data, upstream);
                if !stale_true {
                    return Ok(entry.active);
                }
            }
        }
    }

    let active = if upstream.is_empty() {
        head_active(data)
    } else {
        downstream_active(data, upstream)
    };
    cache.entries.insert(
        node_id.to_string(),
        CacheEntry {
            fingerprint,
            active,
            computed_at: Instant::now(),
        },
    );
    Ok(active)
}

/// Head node: active iff its own data yields a defined, meaningful output.
fn head_active(data: &NodeData) -> bool {
    if data.error.is_some() {
        return false;
    }
    match &data.kind {
        // A view is only showing something when at least one of its items
        // is non-empty, non-whitespace, non-empty-collection.
        KindData::ViewOutput(d) => d.items.iter().any(is_meaningful),
        _ => extract(data).map(|v| is_meaningful(&v)).unwrap_or(false),
    }
}

/// Downstream node: active iff a relevant upstream node is active and
/// exposes a defined output. Transform nodes gate on their own computed
/// output instead.
fn downstream_active(data: &NodeData, upstream: &[UpstreamSnapshot]) -> bool {
    if data.error.is_some() {
        return false;
    }
    let fed = upstream.iter().any(|up| match &up.data {
        Some(d) => d.is_active && extract(d).is_some(),
        None => false,
    });
    match &data.kind {
        KindData::Transform(_) => {
            fed && extract(data).map(|v| is_meaningful(&v)).unwrap_or(false)
        }
        _ => fed,
    }
}

/// Cheap prediction of the next activation value, used only to decide
/// whether a cached `true` may be trusted.
fn quick_check(data: &NodeData, upstream: &[UpstreamSnapshot]) -> bool {
    if data.error.is_some() {
        return false;
    }
    if upstream.is_empty() {
        extract(data).is_some()
    } else {
        upstream
            .iter()
            .any(|up| up.data.as_ref().map(|d| d.is_active).unwrap_or(false))
    }
}

fn compute_fingerprint(data: &NodeData, upstream: &[UpstreamSnapshot]) -> Result<u64, NodeError> {
    let mut hasher = DefaultHasher::new();
    data.tag().hash(&mut hasher);
    let own = serde_json::to_string(data).map_err(|e| NodeError::Serialization(e.to_string()))?;
    own.hash(&mut hasher);
    for up in upstream {
        up.connection.source.hash(&mut hasher);
        up.connection.target.hash(&mut hasher);
        up.connection.source_handle.as_str().hash(&mut hasher);
        up.connection.target_handle.as_str().hash(&mut hasher);
        match &up.data {
            Some(d) => {
                let s = serde_json::to_string(d)
                    .map_err(|e| NodeError::Serialization(e.to_string()))?;
                s.hash(&mut hasher);
            }
            None => {
                "<gone>".hash(&mut hasher);
            }
        }
    }
    Ok(hasher.finish())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{TextData, TransformData, TriggerData, ViewOutputData};
    use serde_json::json;

    fn text(text: &str) -> NodeData {
        NodeData::new(KindData::Text(TextData {
            text: text.to_string(),
        }))
    }

    fn upstream_of(conn: Connection, data: NodeData) -> UpstreamSnapshot {
        UpstreamSnapshot {
            connection: conn,
            data: Some(data),
        }
    }

    #[test]
    fn test_head_node_activation_is_pure_and_cached() {
        let cache = ActivationCache::new();
        let data = text("hello");
        let first = compute_activation("a", &data, &[], &cache, false);
        let second = compute_activation("a", &data, &[], &cache, false);
        assert!(first && second);
        assert_eq!(cache.len(), 1);

        // Empty and whitespace-only text is not meaningful output.
        assert!(!compute_activation("b", &text(""), &[], &cache, false));
        assert!(!compute_activation("c", &text("   "), &[], &cache, false));
    }

    #[test]
    fn test_head_view_output_needs_one_meaningful_item() {
        let cache = ActivationCache::new();
        let empty_items = NodeData::new(KindData::ViewOutput(ViewOutputData {
            items: vec![json!(""), json!([]), json!({})],
        }));
        assert!(!compute_activation("v", &empty_items, &[], &cache, false));

        let one_real = NodeData::new(KindData::ViewOutput(ViewOutputData {
            items: vec![json!(""), json!("shown")],
        }));
        assert!(compute_activation("v", &one_real, &[], &cache, false));
    }

    #[test]
    fn test_downstream_gating() {
        let cache = ActivationCache::new();
        let conn = Connection::new("up", "down");
        let own = NodeData::new(KindData::ViewOutput(ViewOutputData::default()));

        // Active upstream with output: active.
        let mut up = text("payload");
        up.is_active = true;
        let ups = [upstream_of(conn.clone(), up.clone())];
        assert!(compute_activation("down", &own, &ups, &cache, false));

        // Inactive upstream is never observed as usable, even with a stale
        // output value still in its bag.
        let mut stale = up.clone();
        stale.is_active = false;
        stale.output_value = Some(json!("stale"));
        // extract() still finds the value, but is_active gates it out.
        let ups = [upstream_of(conn.clone(), stale)];
        assert!(!compute_activation("down", &own, &ups, &cache, false));

        // Destroyed upstream counts as absent.
        let ups = [UpstreamSnapshot {
            connection: conn,
            data: None,
        }];
        assert!(!compute_activation("down", &own, &ups, &cache, false));
    }

    #[test]
    fn test_transform_gates_on_own_output() {
        let cache = ActivationCache::new();
        let conn = Connection::new("up", "t");
        let mut up = text("payload");
        up.is_active = true;
        let ups = [upstream_of(conn, up)];

        let no_result = NodeData::new(KindData::Transform(TransformData::default()));
        assert!(!compute_activation("t", &no_result, &ups, &cache, false));

        let with_result = NodeData::new(KindData::Transform(TransformData {
            text: Some("PAYLOAD".to_string()),
            ..Default::default()
        }));
        assert!(compute_activation("t", &with_result, &ups, &cache, false));
    }

    #[test]
    fn test_error_state_forces_inactive() {
        let cache = ActivationCache::new();
        let mut data = text("fine");
        data.error = Some("boom".to_string());
        assert!(!compute_activation("e", &data, &[], &cache, false));
    }

    #[test]
    fn test_trigger_head_active_only_after_pulse() {
        let cache = ActivationCache::new();
        let idle = NodeData::new(KindData::Trigger(TriggerData::default()));
        assert!(!compute_activation("t", &idle, &[], &cache, false));

        let fired = NodeData::new(KindData::Trigger(TriggerData {
            triggered: Some(1_700_000_000_000.0),
            value: Some(true),
            ..Default::default()
        }));
        assert!(compute_activation("t", &fired, &[], &cache, true));
    }

    #[test]
    fn test_cache_entry_removed_with_node() {
        let cache = ActivationCache::new();
        compute_activation("gone", &text("x"), &[], &cache, false);
        assert_eq!(cache.len(), 1);
        cache.remove("gone");
        assert!(cache.is_empty());
    }
}

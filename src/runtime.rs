use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{Map, Value, json};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::activation::{ActivationCache, UpstreamSnapshot, compute_activation};
use crate::change::{EdgeMode, SourceMeta, should_process};
use crate::clock::Clock;
use crate::config::EngineSettings;
use crate::data::{KindData, NodeData, TransformOp};
use crate::delay::DelayProcessor;
use crate::error::NodeError;
use crate::graph::GraphStore;
use crate::propagate::Propagator;
use crate::store::{NodeDataStore, StoreEvent};
use crate::value::extract;

/// Everything a node's orchestration task needs, shared by reference with
/// the engine that owns it.
pub(crate) struct RuntimeCtx {
    pub node_id: String,
    pub graph: Arc<GraphStore>,
    pub store: Arc<NodeDataStore>,
    pub cache: Arc<ActivationCache>,
    pub propagator: Arc<Propagator>,
    pub clock: Arc<dyn Clock>,
    pub settings: EngineSettings,
    pub delay: Option<Arc<DelayProcessor>>,
}

/// Handle to one spawned node orchestrator.
pub(crate) struct NodeRuntime {
    pub cancel: CancellationToken,
    #[allow(dead_code)]
    pub handle: JoinHandle<()>,
    pub delay: Option<Arc<DelayProcessor>>,
}

pub(crate) fn spawn(ctx: RuntimeCtx) -> NodeRuntime {
    let cancel = CancellationToken::new();
    let delay = ctx.delay.clone();
    let token = cancel.clone();
    let handle = tokio::spawn(async move {
        run(ctx, token).await;
    });
    NodeRuntime {
        cancel,
        handle,
        delay,
    }
}

/// Local mutable state of one orchestrator task.
struct PassState {
    /// Last effective output observed per upstream source id.
    last_seen: HashMap<String, Value>,
    /// Clock time of the last completed pass, for throttling.
    last_pass_ms: Option<f64>,
    /// A relevant change arrived and a pass is owed.
    pending: bool,
    /// Ticker token of a running cycle node.
    cycle_ticker: Option<CancellationToken>,
    /// Last emitted trigger timestamp, kept strictly increasing.
    last_trigger_ms: f64,
}

#[tracing::instrument(name = "node_runtime", skip(ctx, cancel), fields(node_id = %ctx.node_id))]
async fn run(ctx: RuntimeCtx, cancel: CancellationToken) {
    let mut rx = ctx.store.subscribe();
    let mut tick = tokio::time::interval(ctx.settings.poll_interval());
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut state = PassState {
        last_seen: HashMap::new(),
        last_pass_ms: None,
        pending: true,
        cycle_ticker: None,
        last_trigger_ms: 0.0,
    };

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            event = rx.recv() => match event {
                Ok(event) => {
                    if is_relevant(&ctx, &event) {
                        state.pending = true;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed, "event bus lagged; forcing full pass");
                    state.pending = true;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            _ = tick.tick() => {}
        }

        if !state.pending {
            continue;
        }
        // Liveness: the node may have been destroyed while we slept.
        let Some(own) = ctx.store.get(&ctx.node_id) else {
            break;
        };

        // Minimum inter-processing interval, except for plain input
        // sources where a frame of lag is perceptible. A deferred pass is
        // picked up again by the poll tick.
        if !own.kind.is_latency_sensitive() {
            let now = ctx.clock.now_millis();
            if let Some(last) = state.last_pass_ms {
                if now - last < ctx.settings.throttle_ms as f64 {
                    continue;
                }
            }
        }
        state.pending = false;
        state.last_pass_ms = Some(ctx.clock.now_millis());
        process_pass(&ctx, own, &mut state, &cancel).await;
    }

    if let Some(ticker) = state.cycle_ticker.take() {
        ticker.cancel();
    }
    debug!("node runtime stopped");
}

fn is_relevant(ctx: &RuntimeCtx, event: &StoreEvent) -> bool {
    match event {
        StoreEvent::TopologyChanged => true,
        StoreEvent::DataChanged { node_id, .. } | StoreEvent::NodeRemoved { node_id } => {
            *node_id == ctx.node_id || ctx.graph.upstream_ids(&ctx.node_id).contains(node_id)
        }
    }
}

/// One full processing pass: snapshot, change detection, kind-specific
/// logic, activation recompute, propagation.
async fn process_pass(
    ctx: &RuntimeCtx,
    own: NodeData,
    state: &mut PassState,
    cancel: &CancellationToken,
) {
    // (a) Graph snapshot: incoming connections plus live upstream data.
    let upstream: Vec<UpstreamSnapshot> = ctx
        .graph
        .incoming(&ctx.node_id)
        .into_iter()
        .map(|connection| {
            let data = ctx.store.get(&connection.source);
            UpstreamSnapshot { connection, data }
        })
        .collect();

    // (b) Change detection per upstream source. An inactive or errored
    // upstream exposes no value at all; that is the data-flow-blocking
    // guarantee downstream nodes rely on.
    let edge_mode = match &own.kind {
        KindData::Trigger(d) => d.edge_mode,
        _ => EdgeMode::Level,
    };
    let mut changed_inputs: Vec<Value> = Vec::new();
    for up in &upstream {
        let source_id = up.connection.source.clone();
        let effective = up
            .data
            .as_ref()
            .filter(|d| d.is_active && d.error.is_none())
            .and_then(extract);
        let meta = up.data.as_ref().map(SourceMeta::of).unwrap_or_default();
        if should_process(
            effective.as_ref(),
            state.last_seen.get(&source_id),
            &meta,
            edge_mode,
        ) {
            if let Some(v) = &effective {
                changed_inputs.push(v.clone());
            }
        }
        match effective {
            Some(v) => {
                state.last_seen.insert(source_id, v);
            }
            None => {
                state.last_seen.remove(&source_id);
            }
        }
    }

    // (c) Kind-specific processing with error isolation: a failure becomes
    // this node's error string and forced deactivation, nothing more.
    match process_logic(ctx, &own, &upstream, &changed_inputs, state, cancel) {
        Ok(Some(patch)) => {
            if let Err(e) = ctx.store.update_node_data(&ctx.node_id, &patch) {
                debug!(error = %e, "processing patch dropped");
            }
        }
        Ok(None) => {}
        Err(e) => {
            error!(node_id = %ctx.node_id, error = %e, "processing failed");
            let mut patch = Map::new();
            patch.insert("error".to_string(), Value::String(e.to_string()));
            let _ = ctx.store.update_node_data(&ctx.node_id, &patch);
            let _ = ctx.propagator.propagate(&ctx.node_id, false);
            return;
        }
    }

    // (d) Recompute activation from the post-logic data and push any
    // transition through both propagation layers.
    let Some(own_now) = ctx.store.get(&ctx.node_id) else {
        return;
    };
    let active = compute_activation(&ctx.node_id, &own_now, &upstream, &ctx.cache, false);
    if active != own_now.is_active {
        if let Err(e) = ctx.propagator.propagate(&ctx.node_id, active) {
            debug!(error = %e, "propagation skipped");
        }
    }
}

/// Pure-ish per-kind step: reads the snapshots, returns a data patch.
fn process_logic(
    ctx: &RuntimeCtx,
    own: &NodeData,
    upstream: &[UpstreamSnapshot],
    changed_inputs: &[Value],
    state: &mut PassState,
    cancel: &CancellationToken,
) -> Result<Option<Map<String, Value>>, NodeError> {
    match &own.kind {
        KindData::Text(d) => {
            let mut patch = Map::new();
            let output = if d.text.is_empty() {
                Value::Null
            } else {
                Value::String(d.text.clone())
            };
            patch.insert("outputValue".to_string(), output);
            Ok(Some(patch))
        }

        KindData::TestInput(d) => {
            let mut patch = Map::new();
            patch.insert(
                "outputValue".to_string(),
                d.value.clone().unwrap_or(Value::Null),
            );
            Ok(Some(patch))
        }

        KindData::Trigger(_) => {
            if changed_inputs.is_empty() {
                return Ok(None);
            }
            // An input passed the edge filter: fire one pulse.
            let ts = next_trigger_timestamp(ctx, state);
            let mut patch = Map::new();
            patch.insert("triggered".to_string(), json!(ts));
            patch.insert("value".to_string(), Value::Bool(true));
            arm_value_reset(ctx, cancel.clone());
            Ok(Some(patch))
        }

        KindData::Cycle(d) => {
            if d.running && state.cycle_ticker.is_none() {
                let ticker = cancel.child_token();
                state.cycle_ticker = Some(ticker.clone());
                spawn_cycle_ticker(ctx, d.interval_ms, ticker);
            } else if !d.running {
                if let Some(ticker) = state.cycle_ticker.take() {
                    ticker.cancel();
                }
            }
            Ok(None)
        }

        KindData::Delay(_) => {
            if let Some(delay) = &ctx.delay {
                for value in changed_inputs {
                    delay.push(value.clone());
                }
                delay.ensure_processing();
            }
            Ok(None)
        }

        KindData::Transform(d) => {
            let input = upstream.iter().find_map(|up| {
                up.data
                    .as_ref()
                    .filter(|data| data.is_active && data.error.is_none())
                    .and_then(extract)
            });
            let mut patch = Map::new();
            match input {
                None => {
                    patch.insert("text".to_string(), Value::Null);
                    patch.insert("outputValue".to_string(), Value::Null);
                }
                Some(value) => {
                    let output = apply_transform(d.op, &value)?;
                    patch.insert("text".to_string(), json!(render_text(&output)));
                    patch.insert("outputValue".to_string(), output);
                }
            }
            Ok(Some(patch))
        }

        KindData::ViewOutput(_) => {
            let items: Vec<Value> = upstream
                .iter()
                .filter_map(|up| {
                    up.data
                        .as_ref()
                        .filter(|data| data.is_active && data.error.is_none())
                        .and_then(extract)
                })
                .collect();
            let mut patch = Map::new();
            patch.insert("items".to_string(), Value::Array(items));
            Ok(Some(patch))
        }

        // Unknown kinds carry their data untouched.
        KindData::Legacy { .. } => Ok(None),
    }
}

fn next_trigger_timestamp(ctx: &RuntimeCtx, state: &mut PassState) -> f64 {
    let ts = ctx.clock.now_millis().max(state.last_trigger_ms + 1.0);
    state.last_trigger_ms = ts;
    ts
}

/// Reset the derived boolean `value` after the pulse interval; the pulse is
/// transient by design. Guarded by the node's cancellation token.
fn arm_value_reset(ctx: &RuntimeCtx, cancel: CancellationToken) {
    let store = ctx.store.clone();
    let clock = ctx.clock.clone();
    let node_id = ctx.node_id.clone();
    let reset_after = ctx.settings.pulse_reset();
    tokio::spawn(async move {
        tokio::select! {
            _ = cancel.cancelled() => {}
            _ = clock.sleep(reset_after) => {
                let mut patch = Map::new();
                patch.insert("value".to_string(), Value::Bool(false));
                let _ = store.update_node_data(&node_id, &patch);
            }
        }
    });
}

/// A running cycle node toggles its boolean output on a fixed interval
/// until stopped or destroyed.
fn spawn_cycle_ticker(ctx: &RuntimeCtx, interval_ms: u64, cancel: CancellationToken) {
    let store = ctx.store.clone();
    let clock = ctx.clock.clone();
    let node_id = ctx.node_id.clone();
    let interval = std::time::Duration::from_millis(interval_ms.max(1));
    tokio::spawn(async move {
        let mut value = false;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = clock.sleep(interval) => {}
            }
            value = !value;
            let mut patch = Map::new();
            patch.insert("value".to_string(), Value::Bool(value));
            patch.insert("outputValue".to_string(), Value::Bool(value));
            if store.update_node_data(&node_id, &patch).is_err() {
                // Node destroyed; stop ticking.
                break;
            }
        }
    });
}

fn apply_transform(op: TransformOp, input: &Value) -> Result<Value, NodeError> {
    let as_text = || match input {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    match op {
        TransformOp::Uppercase => Ok(Value::String(as_text().to_uppercase())),
        TransformOp::Lowercase => Ok(Value::String(as_text().to_lowercase())),
        TransformOp::Trim => Ok(Value::String(as_text().trim().to_string())),
        TransformOp::Stringify => serde_json::to_string(input)
            .map(Value::String)
            .map_err(|e| NodeError::Serialization(e.to_string())),
        TransformOp::ParseNumber => {
            let text = as_text();
            let parsed: f64 = text
                .trim()
                .parse()
                .map_err(|_| NodeError::InvalidInput(format!("`{}` is not a number", text)))?;
            serde_json::Number::from_f64(parsed)
                .map(Value::Number)
                .ok_or_else(|| NodeError::InvalidInput(format!("`{}` is not finite", text)))
        }
    }
}

fn render_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value, json};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::config::EngineSettings;
use crate::data::{KindData, OutputMode};
use crate::store::NodeDataStore;

/// Per-delay-node queue and countdown driver. Pending inputs sit in a
/// bounded FIFO; one countdown runs at a time, and each completed countdown
/// dequeues exactly one head item and writes the transformed output.
pub struct DelayProcessor {
    node_id: String,
    store: Arc<NodeDataStore>,
    clock: Arc<dyn Clock>,
    settings: EngineSettings,
    queue: Mutex<VecDeque<Value>>,
    running: AtomicBool,
    cancel: Mutex<CancellationToken>,
    last_pulse_ms: Mutex<f64>,
}

impl DelayProcessor {
    pub fn new(
        node_id: impl Into<String>,
        store: Arc<NodeDataStore>,
        clock: Arc<dyn Clock>,
        settings: EngineSettings,
    ) -> Arc<Self> {
        Arc::new(Self {
            node_id: node_id.into(),
            store,
            clock,
            settings,
            queue: Mutex::new(VecDeque::new()),
            running: AtomicBool::new(false),
            cancel: Mutex::new(CancellationToken::new()),
            last_pulse_ms: Mutex::new(0.0),
        })
    }

    /// Enqueue one input value. The queue is hard-capped: on overflow the
    /// oldest item drops so the most recent inputs always survive.
    pub fn push(&self, value: Value) {
        {
            let mut queue = self.queue.lock().expect("delay queue lock poisoned");
            if queue.len() >= self.settings.max_queue_size {
                queue.pop_front();
                warn!(node_id = %self.node_id, "delay queue full; dropping oldest item");
            }
            queue.push_back(value);
        }
        self.sync_queue_fields();
    }

    pub fn queue_len(&self) -> usize {
        self.queue.lock().expect("delay queue lock poisoned").len()
    }

    /// Start the countdown loop if items are pending and none is running.
    pub fn ensure_processing(self: &Arc<Self>) {
        if self.queue_len() == 0 {
            return;
        }
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let token = self.cancel.lock().expect("delay cancel lock poisoned").clone();
        let me = self.clone();
        tokio::spawn(async move {
            me.run_loop(token).await;
        });
    }

    /// Cancel any pending countdown and reset the queue. No callback armed
    /// before the clear may fire afterwards.
    pub fn clear(&self) {
        {
            let mut guard = self.cancel.lock().expect("delay cancel lock poisoned");
            guard.cancel();
            *guard = CancellationToken::new();
        }
        self.queue.lock().expect("delay queue lock poisoned").clear();
        self.running.store(false, Ordering::SeqCst);
        let mut patch = self.queue_patch();
        patch.insert("progress".to_string(), json!(0.0));
        self.write(patch);
    }

    /// Permanent teardown on node destruction.
    pub fn shutdown(&self) {
        self.cancel
            .lock()
            .expect("delay cancel lock poisoned")
            .cancel();
        self.queue.lock().expect("delay queue lock poisoned").clear();
    }

    async fn run_loop(self: Arc<Self>, cancel: CancellationToken) {
        loop {
            if cancel.is_cancelled() {
                return;
            }
            let Some(config) = self.current_config() else {
                break;
            };
            if self.queue_len() == 0 {
                break;
            }

            if !self.countdown(config.0, &cancel).await {
                // Cancelled mid-countdown; the item stays queued for the
                // owner of the new token.
                return;
            }
            if cancel.is_cancelled() {
                // Cleared in the window between the countdown completing
                // and the dequeue; nothing may emit on the old token.
                return;
            }

            // Exactly one head item per completed cycle.
            let item = self
                .queue
                .lock()
                .expect("delay queue lock poisoned")
                .pop_front();
            let Some(item) = item else {
                break;
            };
            self.emit(item, config.1, &cancel);

            // Minimal yield between items keeps the loop fair under load.
            tokio::task::yield_now().await;
        }
        if cancel.is_cancelled() {
            // `clear` owns the running flag once the token is dead; a stale
            // loop must not stomp it under a newer countdown.
            return;
        }
        self.running.store(false, Ordering::SeqCst);
        // Items may have arrived while winding down.
        if self.queue_len() > 0 {
            self.ensure_processing();
        }
    }

    /// Countdown for one item. Short delays tick frame by frame so progress
    /// reads smoothly; long delays use one deferred sleep. Returns false if
    /// the countdown was cancelled.
    async fn countdown(&self, delay_ms: u64, cancel: &CancellationToken) -> bool {
        self.write_progress(1.0);
        if delay_ms >= self.settings.long_delay_threshold_ms {
            tokio::select! {
                _ = cancel.cancelled() => return false,
                _ = self.clock.sleep(Duration::from_millis(delay_ms)) => {}
            }
        } else {
            let started = self.clock.now_millis();
            loop {
                let frame = self.settings.frame_interval();
                tokio::select! {
                    _ = cancel.cancelled() => return false,
                    _ = self.clock.sleep(frame) => {}
                }
                let elapsed = self.clock.now_millis() - started;
                if elapsed >= delay_ms as f64 {
                    break;
                }
                let fraction = ((delay_ms as f64 - elapsed) / delay_ms as f64).clamp(0.0, 1.0);
                self.write_progress(fraction);
            }
        }
        self.write_progress(0.0);
        true
    }

    fn emit(&self, item: Value, mode: OutputMode, cancel: &CancellationToken) {
        let mut patch = self.queue_patch();
        match mode {
            OutputMode::Passthrough => {
                patch.insert("outputValue".to_string(), item);
            }
            OutputMode::Boolean => {
                let fired = truthy(&item);
                patch.insert("outputValue".to_string(), Value::Bool(fired));
                if fired {
                    self.arm_pulse_reset(cancel.clone());
                }
            }
            OutputMode::Trigger => {
                let ts = self.next_pulse_timestamp();
                patch.insert("outputValue".to_string(), json!(ts));
            }
        }
        debug!(node_id = %self.node_id, ?mode, "delay item emitted");
        self.write(patch);
    }

    /// A boolean `true` emission is a pulse, not a sticky state: it resets
    /// to `false` after the configured interval with no further input.
    fn arm_pulse_reset(&self, cancel: CancellationToken) {
        let store = self.store.clone();
        let clock = self.clock.clone();
        let node_id = self.node_id.clone();
        let reset_after = self.settings.pulse_reset();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = clock.sleep(reset_after) => {
                    let mut patch = Map::new();
                    patch.insert("outputValue".to_string(), Value::Bool(false));
                    if let Err(e) = store.update_node_data(&node_id, &patch) {
                        debug!(node_id = %node_id, error = %e, "pulse reset skipped");
                    }
                }
            }
        });
    }

    /// Trigger pulses are strictly increasing even within one millisecond.
    fn next_pulse_timestamp(&self) -> f64 {
        let mut last = self.last_pulse_ms.lock().expect("pulse lock poisoned");
        let ts = self.clock.now_millis().max(*last + 1.0);
        *last = ts;
        ts
    }

    fn current_config(&self) -> Option<(u64, OutputMode)> {
        match self.store.get(&self.node_id)?.kind {
            KindData::Delay(d) => Some((d.delay_ms, d.output_mode)),
            _ => None,
        }
    }

    fn queue_patch(&self) -> Map<String, Value> {
        let queue = self.queue.lock().expect("delay queue lock poisoned");
        let items: Vec<Value> = queue.iter().cloned().collect();
        let mut patch = Map::new();
        patch.insert("queueLength".to_string(), json!(items.len()));
        patch.insert("queueItems".to_string(), Value::Array(items));
        patch
    }

    fn sync_queue_fields(&self) {
        self.write(self.queue_patch());
    }

    fn write_progress(&self, fraction: f64) {
        let mut patch = Map::new();
        patch.insert("progress".to_string(), json!(fraction));
        self.write(patch);
    }

    fn write(&self, patch: Map<String, Value>) {
        if let Err(e) = self.store.update_node_data(&self.node_id, &patch) {
            debug!(node_id = %self.node_id, error = %e, "delay write dropped");
        }
    }
}

/// JSON truthiness used by the boolean output mode.
fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0 && !f.is_nan()).unwrap_or(true),
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::TokioClock;
    use crate::data::{DelayData, NodeData};

    fn delay_node(delay_ms: u64, mode: OutputMode) -> NodeData {
        NodeData::new(KindData::Delay(DelayData {
            delay_ms,
            output_mode: mode,
            ..Default::default()
        }))
    }

    fn setup(delay_ms: u64, mode: OutputMode) -> (Arc<NodeDataStore>, Arc<DelayProcessor>) {
        let store = NodeDataStore::new(64);
        store.insert("d", delay_node(delay_ms, mode));
        let clock: Arc<dyn Clock> = Arc::new(TokioClock::new());
        let processor = DelayProcessor::new("d", store.clone(), clock, EngineSettings::default());
        (store, processor)
    }

    fn output(store: &NodeDataStore) -> Option<Value> {
        store.get("d").unwrap().output_value
    }

    #[tokio::test]
    async fn test_queue_bound_drops_oldest() {
        let (store, processor) = setup(100, OutputMode::Passthrough);
        let cap = EngineSettings::default().max_queue_size;
        for i in 0..(cap + 5) {
            processor.push(json!(i));
        }
        assert_eq!(processor.queue_len(), cap);
        let data = store.get("d").unwrap();
        match data.kind {
            KindData::Delay(d) => {
                assert_eq!(d.queue_length, cap);
                // Oldest five dropped: queue starts at 5.
                assert_eq!(d.queue_items.first(), Some(&json!(5)));
                assert_eq!(d.queue_items.last(), Some(&json!(cap + 4)));
            }
            _ => panic!("kind changed"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_passthrough_processes_fifo() {
        let (store, processor) = setup(50, OutputMode::Passthrough);
        processor.push(json!("first"));
        processor.push(json!("second"));
        processor.ensure_processing();

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(output(&store), Some(json!("first")));

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(output(&store), Some(json!("second")));
        assert_eq!(processor.queue_len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_boolean_pulse_auto_resets() {
        let (store, processor) = setup(100, OutputMode::Boolean);
        processor.push(json!(true));
        processor.ensure_processing();

        // t ~= 100: pulse fires.
        tokio::time::sleep(Duration::from_millis(130)).await;
        assert_eq!(output(&store), Some(json!(true)));

        // t ~= 200: pulse has auto-reset with no further input.
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(output(&store), Some(json!(false)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_trigger_pulses_strictly_increase() {
        let (store, processor) = setup(50, OutputMode::Trigger);
        processor.push(json!(true));
        processor.push(json!(true));
        processor.ensure_processing();

        tokio::time::sleep(Duration::from_millis(80)).await;
        let first = output(&store).unwrap().as_f64().unwrap();

        tokio::time::sleep(Duration::from_millis(80)).await;
        let second = output(&store).unwrap().as_f64().unwrap();
        assert!(second > first, "expected {second} > {first}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_long_delay_uses_single_deferred_sleep() {
        let (store, processor) = setup(3000, OutputMode::Passthrough);
        processor.push(json!("slow"));
        processor.ensure_processing();

        tokio::time::sleep(Duration::from_millis(2900)).await;
        assert_eq!(output(&store), None);
        // No frame-stepped progress updates on the long path.
        match store.get("d").unwrap().kind {
            KindData::Delay(d) => assert_eq!(d.progress, 1.0),
            _ => panic!("kind changed"),
        }

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(output(&store), Some(json!("slow")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_item_pushed_after_clear_never_rides_old_countdown() {
        let (store, processor) = setup(100, OutputMode::Boolean);
        processor.push(json!(true));
        processor.ensure_processing();

        // Clear right at the countdown boundary, then enqueue a fresh item
        // without restarting processing. The old loop must not pop it.
        tokio::time::sleep(Duration::from_millis(100)).await;
        processor.clear();
        processor.push(json!(true));

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(output(&store), None);
        assert_eq!(processor.queue_len(), 1);

        // A single new countdown drains it once processing is restarted.
        processor.ensure_processing();
        tokio::time::sleep(Duration::from_millis(130)).await;
        assert_eq!(output(&store), Some(json!(true)));
        assert_eq!(processor.queue_len(), 0);
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(output(&store), Some(json!(false)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear_cancels_pending_countdown() {
        let (store, processor) = setup(100, OutputMode::Passthrough);
        processor.push(json!("doomed"));
        processor.ensure_processing();
        tokio::time::sleep(Duration::from_millis(30)).await;
        processor.clear();

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(output(&store), None);
        assert_eq!(processor.queue_len(), 0);
        match store.get("d").unwrap().kind {
            KindData::Delay(d) => {
                assert_eq!(d.queue_length, 0);
                assert_eq!(d.progress, 0.0);
            }
            _ => panic!("kind changed"),
        }
    }
}

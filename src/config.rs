use std::env;
use std::time::Duration;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::info;

/// Runtime tunables for the engine. Every field has a default; any of them
/// can be overridden through `NODEFLOW_*` environment variables, which keeps
/// deployments configurable without a dedicated config file.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(default)]
pub struct EngineSettings {
    /// Hard cap on a delay node's pending queue; oldest items drop on overflow.
    pub max_queue_size: usize,
    /// Tick interval of the frame-stepped countdown, in milliseconds.
    pub frame_interval_ms: u64,
    /// Delays at or above this use a single deferred sleep instead of
    /// frame-stepped polling.
    pub long_delay_threshold_ms: u64,
    /// How long a boolean pulse stays `true` before auto-resetting.
    pub pulse_reset_ms: u64,
    /// Minimum interval between processing passes of one node.
    pub throttle_ms: u64,
    /// Flush window of the debounced writer used for rapid text edits.
    pub debounce_ms: u64,
    /// Poll tick of each node runtime; doubles as the throttle retry.
    pub poll_interval_ms: u64,
    /// Capacity of the broadcast event bus.
    pub event_capacity: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            max_queue_size: 100,
            frame_interval_ms: 16,
            long_delay_threshold_ms: 2000,
            pulse_reset_ms: 100,
            throttle_ms: 16,
            debounce_ms: 120,
            poll_interval_ms: 50,
            event_capacity: 256,
        }
    }
}

impl EngineSettings {
    /// Build settings from the environment, falling back to defaults.
    /// A `.env` file next to the process is honoured if present.
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();
        let mut settings = Self::default();
        read_env("NODEFLOW_MAX_QUEUE_SIZE", &mut settings.max_queue_size);
        read_env("NODEFLOW_FRAME_INTERVAL_MS", &mut settings.frame_interval_ms);
        read_env(
            "NODEFLOW_LONG_DELAY_THRESHOLD_MS",
            &mut settings.long_delay_threshold_ms,
        );
        read_env("NODEFLOW_PULSE_RESET_MS", &mut settings.pulse_reset_ms);
        read_env("NODEFLOW_THROTTLE_MS", &mut settings.throttle_ms);
        read_env("NODEFLOW_DEBOUNCE_MS", &mut settings.debounce_ms);
        read_env("NODEFLOW_POLL_INTERVAL_MS", &mut settings.poll_interval_ms);
        read_env("NODEFLOW_EVENT_CAPACITY", &mut settings.event_capacity);
        info!(?settings, "engine settings loaded");
        settings
    }

    pub fn frame_interval(&self) -> Duration {
        Duration::from_millis(self.frame_interval_ms)
    }

    pub fn pulse_reset(&self) -> Duration {
        Duration::from_millis(self.pulse_reset_ms)
    }

    pub fn throttle(&self) -> Duration {
        Duration::from_millis(self.throttle_ms)
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

fn read_env<T: std::str::FromStr>(key: &str, slot: &mut T) {
    if let Ok(raw) = env::var(key) {
        if let Ok(parsed) = raw.parse::<T>() {
            *slot = parsed;
        }
    }
}

use std::fmt::Debug;
use std::time::Duration;

use async_trait::async_trait;

/// Time source shared by every countdown and pulse in the engine. One
/// implementation backed by tokio time; tests drive it with the paused
/// runtime clock, so the whole timer stack stays deterministic.
#[async_trait]
pub trait Clock: Send + Sync + Debug {
    /// Milliseconds since the unix epoch, monotone within one process.
    fn now_millis(&self) -> f64;

    async fn sleep(&self, duration: Duration);
}

/// Wall-clock epoch captured at construction plus tokio's monotonic clock.
/// Under `tokio::time::pause` the monotonic part advances with the test
/// clock, so trigger timestamps stay consistent with scheduled sleeps.
#[derive(Debug, Clone)]
pub struct TokioClock {
    epoch: tokio::time::Instant,
    epoch_wall_ms: f64,
}

impl TokioClock {
    pub fn new() -> Self {
        Self {
            epoch: tokio::time::Instant::now(),
            epoch_wall_ms: chrono::Utc::now().timestamp_millis() as f64,
        }
    }
}

impl Default for TokioClock {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Clock for TokioClock {
    fn now_millis(&self) -> f64 {
        self.epoch_wall_ms + self.epoch.elapsed().as_secs_f64() * 1000.0
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_now_advances_with_paused_clock() {
        let clock = TokioClock::new();
        let start = clock.now_millis();
        clock.sleep(Duration::from_millis(250)).await;
        let elapsed = clock.now_millis() - start;
        assert!((elapsed - 250.0).abs() < 1.0, "elapsed {elapsed}");
    }
}

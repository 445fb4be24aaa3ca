use std::sync::OnceLock;

use anyhow::Result;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

static INIT: OnceLock<()> = OnceLock::new();

/// Install the global tracing subscriber. `log_level` is used when
/// `RUST_LOG` is not set. Safe to call more than once; only the first call
/// installs anything.
pub fn init_tracing(log_level: &str) -> Result<()> {
    let mut result = Ok(());
    INIT.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(log_level));
        let fmt_layer = tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_level(true);
        result = tracing_subscriber::registry()
            .with(filter)
            .with(fmt_layer)
            .try_init()
            .map_err(|e| anyhow::anyhow!("failed to install tracing subscriber: {e}"));
    });
    result
}

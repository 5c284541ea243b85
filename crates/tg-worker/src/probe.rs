//! Fire-and-forget utilization sampling.
//!
//! An auxiliary periodic task that logs device utilization through the
//! reporter. It never feeds back into scheduling decisions; aborting it is
//! always safe.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;

use crate::reporter::Reporter;

/// Source of utilization readings (GPU, accelerator, host). Returning
/// `None` skips the tick.
pub trait UtilizationProbe: Send + Sync {
    fn sample(&self) -> Option<String>;
}

/// Spawn the periodic sampler. The returned handle is only ever aborted.
pub fn spawn_probe(
    reporter: Arc<Reporter>,
    probe: Arc<dyn UtilizationProbe>,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // First tick fires immediately; skip it so readings are spaced.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if let Some(line) = probe.sample() {
                reporter.log(line);
            }
        }
    })
}

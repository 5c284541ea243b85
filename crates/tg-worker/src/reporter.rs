//! The per-worker Reporter: a thread-safe log/metric mailbox shared between
//! the heartbeat task and the user's training code, and the channel through
//! which an early-stop verdict interrupts that code.

use std::io::Write;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use tracing::warn;

use tg_types::TrialId;

/// Control-flow signal raised from [`Reporter::checkpoint`] once the
/// coordinator has told this trial to stop. Not a failure: the worker
/// boundary converts it into a normal, truncated final metric.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EarlyStop;

impl std::fmt::Display for EarlyStop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "trial was early stopped")
    }
}

impl std::error::Error for EarlyStop {}

/// Shared between the training call and the heartbeat task.
///
/// The training-side fast path ([`checkpoint`](Self::checkpoint)) touches
/// only atomics; the heartbeat side drains buffered logs and reads the
/// latest metric without ever blocking on the training call.
pub struct Reporter {
    trial_id: Mutex<Option<TrialId>>,
    stop: AtomicBool,
    metric_bits: AtomicU64,
    has_metric: AtomicBool,
    log_tx: Sender<String>,
    log_rx: Receiver<String>,
    /// Local log sink, explicit rather than any global print override.
    sink: Mutex<Box<dyn Write + Send>>,
}

impl Reporter {
    pub fn new(sink: Box<dyn Write + Send>) -> Arc<Self> {
        let (log_tx, log_rx) = unbounded();
        Arc::new(Self {
            trial_id: Mutex::new(None),
            stop: AtomicBool::new(false),
            metric_bits: AtomicU64::new(0),
            has_metric: AtomicBool::new(false),
            log_tx,
            log_rx,
            sink: Mutex::new(sink),
        })
    }

    /// Append a log line: mirrored to the local sink and buffered for the
    /// next heartbeat.
    pub fn log(&self, message: impl Into<String>) {
        let line = message.into();
        {
            let mut sink = self.sink.lock();
            if let Err(e) = writeln!(sink, "{line}") {
                warn!(error = %e, "log sink write failed");
            }
        }
        let _ = self.log_tx.send(line);
    }

    /// Take all buffered log lines (heartbeat side).
    pub fn drain_logs(&self) -> Vec<String> {
        self.log_rx.try_iter().collect()
    }

    pub fn set_trial_id(&self, trial_id: Option<TrialId>) {
        *self.trial_id.lock() = trial_id;
    }

    pub fn trial_id(&self) -> Option<TrialId> {
        self.trial_id.lock().clone()
    }

    /// Record the training code's current metric and check for a stop
    /// verdict. This is the cooperative cancellation point: user code that
    /// never checkpoints cannot be interrupted.
    pub fn checkpoint(&self, metric: f64) -> Result<(), EarlyStop> {
        self.metric_bits.store(metric.to_bits(), Ordering::Relaxed);
        self.has_metric.store(true, Ordering::Release);
        if self.stop.load(Ordering::Acquire) {
            return Err(EarlyStop);
        }
        Ok(())
    }

    /// Latest checkpointed metric for the current trial.
    pub fn latest_metric(&self) -> Option<f64> {
        if !self.has_metric.load(Ordering::Acquire) {
            return None;
        }
        Some(f64::from_bits(self.metric_bits.load(Ordering::Relaxed)))
    }

    /// Called by the heartbeat task on a `Stop` verdict.
    pub fn signal_stop(&self) {
        self.stop.store(true, Ordering::Release);
    }

    pub fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    /// Arm the reporter for a fresh trial: new id, cleared metric and stop
    /// flag.
    pub fn begin_trial(&self, trial_id: TrialId) {
        self.set_trial_id(Some(trial_id));
        self.has_metric.store(false, Ordering::Release);
        self.stop.store(false, Ordering::Release);
    }
}

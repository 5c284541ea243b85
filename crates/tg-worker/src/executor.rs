//! The worker executor loop: register, heartbeat, pull trials, run the
//! user's training function, report outcomes.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use tg_rpc::{FinishedTrial, TrialOutcome, Verdict, WorkerConnection};
use tg_types::{MetricError, TgError, TgResult, TrialParams, WorkerId};

use crate::probe::{spawn_probe, UtilizationProbe};
use crate::reporter::{EarlyStop, Reporter};

/// What a training function may return: a bare metric, or a map of named
/// metrics containing the configured optimization key.
#[derive(Debug, Clone, PartialEq)]
pub enum TrainOutcome {
    Metric(f64),
    Metrics(HashMap<String, f64>),
}

/// How a training invocation can end short of a usable outcome.
#[derive(Debug, Clone, PartialEq)]
pub enum TrainError {
    /// Cooperative cancellation, raised from a reporter checkpoint.
    EarlyStopped,
    /// Application error inside the training code.
    Failed(String),
}

impl From<EarlyStop> for TrainError {
    fn from(_: EarlyStop) -> Self {
        Self::EarlyStopped
    }
}

/// The user training contract: called once per trial with the parameter
/// assignment and a reporter handle.
pub type TrainFn =
    Arc<dyn Fn(&TrialParams, Arc<Reporter>) -> Result<TrainOutcome, TrainError> + Send + Sync>;

/// Per-worker runtime parameters, handed over by the launch mechanism.
#[derive(Debug, Clone)]
pub struct WorkerSpec {
    pub server_addr: std::net::SocketAddr,
    pub secret: String,
    pub worker_id: WorkerId,
    pub hb_interval: Duration,
    /// Local log file for this executor.
    pub log_path: PathBuf,
    pub optimization_key: String,
}

/// Extract the optimization metric from a training outcome.
fn resolve_metric(outcome: TrainOutcome, key: &str) -> Result<f64, MetricError> {
    let value = match outcome {
        TrainOutcome::Metric(value) => value,
        TrainOutcome::Metrics(map) => *map.get(key).ok_or_else(|| MetricError::ReturnType {
            key: key.to_string(),
        })?,
    };
    if !value.is_finite() {
        return Err(MetricError::MetricType {
            key: key.to_string(),
            value,
        });
    }
    Ok(value)
}

/// Run the worker loop to completion: register, start the heartbeat task,
/// then pull and execute trials until the coordinator answers `Done`.
pub async fn run_worker(
    spec: WorkerSpec,
    train: TrainFn,
    probe: Option<Arc<dyn UtilizationProbe>>,
) -> TgResult<()> {
    if let Some(parent) = spec.log_path.parent() {
        fs::create_dir_all(parent)?;
    }
    let sink = fs::File::create(&spec.log_path)?;
    let reporter = Reporter::new(Box::new(sink));

    let conn = Arc::new(
        WorkerConnection::connect(
            spec.server_addr,
            spec.secret.clone(),
            spec.worker_id.clone(),
        )
        .await
        .map_err(TgError::Protocol)?,
    );

    reporter.log("Registering with experiment driver");
    conn.register(conn.local_addr().to_string()).await?;

    let heartbeat = spawn_heartbeat(conn.clone(), reporter.clone(), spec.hb_interval);
    let probe_task = probe.map(|p| spawn_probe(reporter.clone(), p, Duration::from_secs(60)));

    let result = trial_loop(&spec, &conn, &reporter, train).await;

    heartbeat.abort();
    if let Some(task) = probe_task {
        task.abort();
    }
    info!(worker = %spec.worker_id, "worker loop finished");
    result
}

/// Blocking wrapper for launchers that run each worker on a plain thread.
pub fn run_worker_blocking(
    spec: WorkerSpec,
    train: TrainFn,
    probe: Option<Arc<dyn UtilizationProbe>>,
) -> TgResult<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    runtime.block_on(run_worker(spec, train, probe))
}

async fn trial_loop(
    spec: &WorkerSpec,
    conn: &Arc<WorkerConnection>,
    reporter: &Arc<Reporter>,
    train: TrainFn,
) -> TgResult<()> {
    let mut finished: Option<FinishedTrial> = None;

    loop {
        let assignment = match conn.get_next(finished.take()).await? {
            Some(assignment) => assignment,
            None => return Ok(()),
        };

        reporter.begin_trial(assignment.trial_id.clone());
        reporter.log(format!("Starting trial {}", assignment.trial_id));
        reporter.log(format!("Parameter combination: {}", assignment.parameters));

        let params = assignment.parameters.clone();
        let train_fn = train.clone();
        let handle = reporter.clone();
        let invoked =
            tokio::task::spawn_blocking(move || train_fn(&params, handle)).await;

        let outcome = match invoked {
            Ok(outcome) => outcome,
            Err(join_error) => Err(TrainError::Failed(format!(
                "training panicked: {join_error}"
            ))),
        };

        let trial_outcome = match outcome {
            Ok(result) => match resolve_metric(result, &spec.optimization_key) {
                Ok(value) => {
                    reporter.log(format!("Final metric: {value}"));
                    TrialOutcome::Metric { value }
                }
                Err(e) => {
                    reporter.log(format!("ERROR: {e}"));
                    TrialOutcome::Failed {
                        reason: e.to_string(),
                    }
                }
            },
            // The signal unwinds the user's stack; the last checkpointed
            // metric becomes the truncated final result.
            Err(TrainError::EarlyStopped) => {
                reporter.log("Early stopped trial");
                match reporter.latest_metric() {
                    Some(value) => TrialOutcome::Metric { value },
                    None => TrialOutcome::Failed {
                        reason: "early stopped before first checkpoint".to_string(),
                    },
                }
            }
            Err(TrainError::Failed(reason)) => {
                reporter.log(format!("ERROR: {reason}"));
                TrialOutcome::Failed { reason }
            }
        };

        reporter.log(format!("Finished trial {}", assignment.trial_id));
        reporter.set_trial_id(None);
        debug!(worker = %spec.worker_id, trial = %assignment.trial_id, "trial complete");

        finished = Some(FinishedTrial {
            trial_id: assignment.trial_id,
            outcome: trial_outcome,
        });
    }
}

/// Heartbeat task: on a fixed interval, send the latest buffered metric and
/// logs, and apply the verdict to the reporter's stop flag.
fn spawn_heartbeat(
    conn: Arc<WorkerConnection>,
    reporter: Arc<Reporter>,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            let trial_id = reporter.trial_id();
            let metric = trial_id.is_some().then(|| reporter.latest_metric()).flatten();
            let logs = reporter.drain_logs();

            match conn.heartbeat(trial_id, metric, logs).await {
                Ok(Verdict::Continue) => {}
                Ok(Verdict::Stop) => {
                    debug!("stop verdict received");
                    reporter.signal_stop();
                }
                Err(e) => {
                    warn!(error = %e, "heartbeat failed, stopping heartbeat task");
                    return;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_metric_resolves() {
        assert_eq!(
            resolve_metric(TrainOutcome::Metric(0.5), "metric").unwrap(),
            0.5
        );
    }

    #[test]
    fn map_outcome_requires_optimization_key() {
        let mut map = HashMap::new();
        map.insert("loss".to_string(), 0.1);
        let err = resolve_metric(TrainOutcome::Metrics(map), "accuracy").unwrap_err();
        assert!(matches!(err, MetricError::ReturnType { .. }));

        let mut map = HashMap::new();
        map.insert("accuracy".to_string(), 0.93);
        assert_eq!(
            resolve_metric(TrainOutcome::Metrics(map), "accuracy").unwrap(),
            0.93
        );
    }

    #[test]
    fn non_finite_metric_rejected() {
        let err = resolve_metric(TrainOutcome::Metric(f64::NAN), "metric").unwrap_err();
        assert!(matches!(err, MetricError::MetricType { .. }));
        let err = resolve_metric(TrainOutcome::Metric(f64::INFINITY), "metric").unwrap_err();
        assert!(matches!(err, MetricError::MetricType { .. }));
    }

    #[test]
    fn early_stop_converts_into_train_error() {
        fn body(reporter: &Reporter) -> Result<TrainOutcome, TrainError> {
            reporter.checkpoint(0.2)?;
            Ok(TrainOutcome::Metric(1.0))
        }
        let reporter = Reporter::new(Box::new(std::io::sink()));
        reporter.signal_stop();
        assert_eq!(body(&reporter), Err(TrainError::EarlyStopped));
    }
}

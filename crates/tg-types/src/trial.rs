//! Trial lifecycle tracking, worker identity, and run-level results.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::params::TrialParams;

/// Unique trial identifier, assigned at creation by the trial generator.
///
/// Ids embed the creation sequence number (`t_0000`, `t_0001`, …) so their
/// lexicographic order is the creation order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TrialId(String);

impl TrialId {
    /// Id for the `seq`-th trial of a run.
    pub fn sequenced(seq: usize) -> Self {
        Self(format!("t_{seq:04}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TrialId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for TrialId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Identifier of a worker process, derived from the executor's partition
/// index and attempt number (an executor may retry after failure, producing
/// a fresh attempt number).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerId(String);

impl WorkerId {
    pub fn new(partition: u32, attempt: u32) -> Self {
        Self(format!("{partition}_{attempt}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for WorkerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Whether higher or lower metric values win.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Max,
    Min,
}

impl Direction {
    /// Whether `candidate` improves on `incumbent`.
    pub fn improves(&self, candidate: f64, incumbent: f64) -> bool {
        match self {
            Self::Max => candidate > incumbent,
            Self::Min => candidate < incumbent,
        }
    }

    /// Whether `value` is strictly worse than `reference`.
    pub fn worse(&self, value: f64, reference: f64) -> bool {
        match self {
            Self::Max => value < reference,
            Self::Min => value > reference,
        }
    }
}

impl Default for Direction {
    fn default() -> Self {
        Self::Max
    }
}

/// One intermediate metric observation, written only by heartbeat processing.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MetricPoint {
    pub timestamp: DateTime<Utc>,
    pub value: f64,
}

/// Lifecycle state of a trial.
///
/// Transitions are monotonic along `Waiting → Running → {EarlyStopped |
/// Finished | Error}`; there is no transition out of a terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrialStatus {
    Waiting,
    Running,
    EarlyStopped,
    Finished,
    Error,
}

impl TrialStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::EarlyStopped | Self::Finished | Self::Error)
    }
}

/// A single trial: an immutable parameter assignment plus mutable run state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trial {
    pub id: TrialId,
    pub parameters: TrialParams,
    pub status: TrialStatus,
    /// Worker executing the trial; set on assignment, retained afterwards.
    pub assigned_worker: Option<WorkerId>,
    pub metric_history: Vec<MetricPoint>,
    /// Set once, at the transition into `Finished` or `EarlyStopped`.
    pub final_metric: Option<f64>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Trial {
    pub fn new(id: TrialId, parameters: TrialParams) -> Self {
        Self {
            id,
            parameters,
            status: TrialStatus::Waiting,
            assigned_worker: None,
            metric_history: Vec::new(),
            final_metric: None,
            error: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }

    /// Assign the trial to a worker. Returns false if the trial is not
    /// `Waiting`.
    pub fn mark_running(&mut self, worker: WorkerId) -> bool {
        if self.status != TrialStatus::Waiting {
            return false;
        }
        self.status = TrialStatus::Running;
        self.assigned_worker = Some(worker);
        self.started_at = Some(Utc::now());
        true
    }

    /// Append an intermediate metric observation. Ignored once terminal.
    pub fn record_metric(&mut self, value: f64) -> bool {
        if self.status != TrialStatus::Running && self.status != TrialStatus::EarlyStopped {
            return false;
        }
        self.metric_history.push(MetricPoint {
            timestamp: Utc::now(),
            value,
        });
        true
    }

    /// Mark the trial early-stopped. The final metric is recorded later,
    /// when the worker reports back through `GetNext`.
    pub fn mark_early_stopped(&mut self) -> bool {
        if self.status != TrialStatus::Running {
            return false;
        }
        self.status = TrialStatus::EarlyStopped;
        true
    }

    /// Record the final metric and close the trial. An `EarlyStopped` trial
    /// keeps its status; a `Running` one becomes `Finished`.
    pub fn mark_finished(&mut self, metric: f64) -> bool {
        match self.status {
            TrialStatus::Running => {
                self.status = TrialStatus::Finished;
            }
            TrialStatus::EarlyStopped if self.final_metric.is_none() => {}
            _ => return false,
        }
        self.final_metric = Some(metric);
        self.finished_at = Some(Utc::now());
        true
    }

    /// Fail the trial. Terminal states are left untouched.
    pub fn mark_error(&mut self, message: impl Into<String>) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.status = TrialStatus::Error;
        self.error = Some(message.into());
        self.finished_at = Some(Utc::now());
        true
    }

    /// Latest intermediate metric, if any was reported.
    pub fn latest_metric(&self) -> Option<f64> {
        self.metric_history.last().map(|p| p.value)
    }
}

/// Registration record for one worker, owned by the driver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerRecord {
    pub worker_id: WorkerId,
    pub address: String,
    pub registered_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    pub current_trial: Option<TrialId>,
    /// Set once the worker has reported exhaustion or failed.
    pub done: bool,
}

impl WorkerRecord {
    pub fn new(worker_id: WorkerId, address: String) -> Self {
        let now = Utc::now();
        Self {
            worker_id,
            address,
            registered_at: now,
            last_heartbeat: now,
            current_trial: None,
            done: false,
        }
    }
}

/// Aggregate result of a finished run, recomputed from the trial table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunResult {
    pub best_trial_id: Option<TrialId>,
    pub best_parameters: Option<TrialParams>,
    pub best_metric: Option<f64>,
    pub num_trials: usize,
    pub early_stopped_count: usize,
    pub error_count: usize,
    pub duration_ms: u64,
}

impl RunResult {
    /// Scan trials (in creation order) for the best final metric under
    /// `direction`. Errored trials are excluded; ties go to the earliest
    /// trial because only a strict improvement replaces the incumbent.
    pub fn compute(trials: &[&Trial], direction: Direction, duration_ms: u64) -> Self {
        let mut best: Option<&Trial> = None;
        let mut early_stopped_count = 0;
        let mut error_count = 0;

        for trial in trials {
            match trial.status {
                TrialStatus::Error => {
                    error_count += 1;
                    continue;
                }
                TrialStatus::EarlyStopped => early_stopped_count += 1,
                _ => {}
            }
            let Some(metric) = trial.final_metric else {
                continue;
            };
            let improved = match best.and_then(|b| b.final_metric) {
                None => true,
                Some(incumbent) => direction.improves(metric, incumbent),
            };
            if improved {
                best = Some(trial);
            }
        }

        Self {
            best_trial_id: best.map(|t| t.id.clone()),
            best_parameters: best.map(|t| t.parameters.clone()),
            best_metric: best.and_then(|t| t.final_metric),
            num_trials: trials.len(),
            early_stopped_count,
            error_count,
            duration_ms,
        }
    }
}

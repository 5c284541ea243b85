//! The experiment driver: sole authority over the trial table and run
//! lifecycle.
//!
//! All scheduling state lives behind one coordination lock so that
//! registration, heartbeat processing, and work assignment execute with
//! mutual exclusion; `finalize` blocks on a condition variable until every
//! worker has reported exhaustion or failed. The coordination server is the
//! driver's RPC façade via [`CoordinationHandler`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use parking_lot::{Condvar, Mutex};
use tracing::{debug, info, warn};

use tg_optimizer::{
    AblationSpec, EarlyStopPolicy, LocoAblation, MedianRule, NoStoppingRule, RandomSearch,
    SearchSpace, TrialGenerator, TrialObservation,
};
use tg_rpc::{
    CoordinationHandler, FinishedTrial, NextTrial, TrialAssignment, TrialOutcome, Verdict,
};
use tg_types::{
    ConfigError, Direction, ProtocolError, RunError, RunResult, TgError, TgResult, Trial, TrialId,
    TrialStatus, WorkerId, WorkerRecord,
};

use crate::metadata::{MetadataStore, TrialRecord};

/// Run lifecycle. The run becomes `Active` at the registration that reaches
/// the target executor count, exactly once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Pending,
    Active,
    Finished,
    Failed,
}

/// Early stopping for optimization runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EarlyStopMode {
    Median,
    Disabled,
}

/// Which trial-generation strategy drives the run: a closed set of built-in
/// strategies plus an open extension point through the generator/policy
/// traits.
pub enum Strategy {
    Optimization {
        space: SearchSpace,
        num_trials: usize,
        seed: u64,
        early_stop: EarlyStopMode,
    },
    Ablation {
        spec: AblationSpec,
    },
    Custom {
        generator: Box<dyn TrialGenerator>,
        policy: Box<dyn EarlyStopPolicy>,
    },
}

/// Driver-side knobs, validated by [`ExperimentDriver::new`].
#[derive(Debug, Clone)]
pub struct DriverConfig {
    pub name: String,
    pub direction: Direction,
    pub optimization_key: String,
    /// Requested worker pool size; shrunk to the producible trial count.
    pub num_executors: usize,
    /// Minimum wall time between early-stop evaluations.
    pub es_interval: Duration,
    /// Minimum number of trials with at least one data point before the
    /// early-stop policy is consulted.
    pub es_min: usize,
    /// A worker whose last heartbeat is older than this is failed.
    pub stale_after: Duration,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            name: "no-name".to_string(),
            direction: Direction::Max,
            optimization_key: "metric".to_string(),
            num_executors: 1,
            es_interval: Duration::from_secs(300),
            es_min: 10,
            stale_after: Duration::from_secs(3),
        }
    }
}

struct DriverState {
    run_state: RunState,
    /// Authoritative trial table, in creation order.
    trials: Vec<Trial>,
    workers: HashMap<WorkerId, WorkerRecord>,
    generator: Box<dyn TrialGenerator>,
    policy: Box<dyn EarlyStopPolicy>,
    last_es_check: Option<Instant>,
    /// Run-fatal error, surfaced from `finalize`.
    fatal: Option<String>,
}

/// The master-side driver. Shared as `Arc` between the run entry point and
/// the coordination server.
pub struct ExperimentDriver {
    config: DriverConfig,
    target_executors: usize,
    strategy_name: String,
    started: Instant,
    meta: Option<Arc<dyn MetadataStore>>,
    state: Mutex<DriverState>,
    done: Condvar,
}

impl ExperimentDriver {
    /// Validate the configuration and construct the chosen generator and
    /// early-stop policy. Fails fast, before any worker starts.
    pub fn new(
        config: DriverConfig,
        strategy: Strategy,
        meta: Option<Arc<dyn MetadataStore>>,
    ) -> TgResult<Arc<Self>> {
        if config.num_executors == 0 {
            return Err(TgError::Config(ConfigError::ZeroExecutors));
        }

        let (mut generator, policy): (Box<dyn TrialGenerator>, Box<dyn EarlyStopPolicy>) =
            match strategy {
                Strategy::Optimization {
                    space,
                    num_trials,
                    seed,
                    early_stop,
                } => {
                    if num_trials == 0 {
                        return Err(TgError::Config(ConfigError::ZeroTrials));
                    }
                    if space.is_empty() {
                        return Err(TgError::Config(ConfigError::EmptySearchSpace));
                    }
                    let policy: Box<dyn EarlyStopPolicy> = match early_stop {
                        EarlyStopMode::Median => Box::new(MedianRule),
                        EarlyStopMode::Disabled => Box::new(NoStoppingRule),
                    };
                    (
                        Box::new(RandomSearch::new(space, num_trials, seed)),
                        policy,
                    )
                }
                Strategy::Ablation { spec } => {
                    if spec.is_empty() {
                        return Err(TgError::Config(ConfigError::EmptyAblationSpec));
                    }
                    // Ablation trials are not comparable mid-flight.
                    (Box::new(LocoAblation::new(spec)), Box::new(NoStoppingRule))
                }
                Strategy::Custom { generator, policy } => (generator, policy),
            };

        generator.initialize()?;

        // Never allocate more workers than producible trials.
        let target_executors = match generator.total_trials() {
            Some(total) => config.num_executors.min(total).max(1),
            None => config.num_executors,
        };
        let strategy_name = generator.name().to_string();

        info!(
            name = %config.name,
            strategy = %strategy_name,
            executors = target_executors,
            "experiment driver initialized"
        );

        Ok(Arc::new(Self {
            config,
            target_executors,
            strategy_name,
            started: Instant::now(),
            meta,
            state: Mutex::new(DriverState {
                run_state: RunState::Pending,
                trials: Vec::new(),
                workers: HashMap::new(),
                generator,
                policy,
                last_es_check: None,
                fatal: None,
            }),
            done: Condvar::new(),
        }))
    }

    /// Worker pool size after right-sizing against the trial count.
    pub fn target_executors(&self) -> usize {
        self.target_executors
    }

    pub fn strategy_name(&self) -> &str {
        &self.strategy_name
    }

    pub fn run_state(&self) -> RunState {
        self.state.lock().run_state
    }

    /// Consistent snapshot of the trial table.
    pub fn trials_snapshot(&self) -> Vec<Trial> {
        self.state.lock().trials.clone()
    }

    /// Block until every worker has reported exhaustion or failed, then
    /// aggregate the run result. A stored run-fatal error is surfaced
    /// instead.
    pub fn finalize(&self) -> TgResult<RunResult> {
        let mut s = self.state.lock();
        loop {
            if s.fatal.is_some() || s.run_state == RunState::Finished {
                break;
            }
            if s.run_state == RunState::Active && Self::all_workers_done(&s) {
                break;
            }
            self.done.wait(&mut s);
        }

        if let Some(message) = s.fatal.clone() {
            return Err(TgError::Run(RunError::GeneratorFailed { message }));
        }

        let refs: Vec<&Trial> = s.trials.iter().collect();
        let result = RunResult::compute(
            &refs,
            self.config.direction,
            self.started.elapsed().as_millis() as u64,
        );

        let history = s.trials.clone();
        s.generator.on_finalize(&history);
        s.run_state = RunState::Finished;

        info!(
            best = ?result.best_trial_id,
            metric = ?result.best_metric,
            trials = result.num_trials,
            early_stopped = result.early_stopped_count,
            "experiment finalized"
        );
        Ok(result)
    }

    /// Force the run to a finished state and wake any finalize waiter.
    /// Idempotent; closing the server is the caller's job.
    pub fn stop(&self) {
        let mut s = self.state.lock();
        if !matches!(s.run_state, RunState::Finished | RunState::Failed) {
            s.run_state = RunState::Finished;
            debug!("run stopped");
        }
        self.done.notify_all();
    }

    // ---- internals, all under the coordination lock ----

    fn all_workers_done(s: &DriverState) -> bool {
        !s.workers.is_empty() && s.workers.values().all(|w| w.done)
    }

    fn rejected(reason: impl Into<String>) -> TgError {
        TgError::Protocol(ProtocolError::Rejected {
            reason: reason.into(),
        })
    }

    /// Evaluate the early-stop policy if both throttle conditions hold: the
    /// evaluation interval has elapsed and enough trials have data points.
    fn maybe_early_stop(&self, s: &mut DriverState) {
        let with_data = s
            .trials
            .iter()
            .filter(|t| !t.metric_history.is_empty())
            .count();
        if with_data < self.config.es_min {
            return;
        }
        let now = Instant::now();
        if let Some(last) = s.last_es_check {
            if now.duration_since(last) < self.config.es_interval {
                return;
            }
        }
        s.last_es_check = Some(now);

        let observations: Vec<TrialObservation> = s
            .trials
            .iter()
            .filter(|t| t.status == TrialStatus::Running)
            .map(|t| TrialObservation {
                trial_id: t.id.clone(),
                metrics: t.metric_history.iter().map(|p| p.value).collect(),
            })
            .collect();

        let flagged = s.policy.should_stop(&observations, self.config.direction);
        for trial_id in flagged {
            if let Some(trial) = s.trials.iter_mut().find(|t| t.id == trial_id) {
                if trial.mark_early_stopped() {
                    info!(trial = %trial_id, "early stopping trial");
                }
            }
        }
    }

    /// Apply a reported outcome to the previous trial. Idempotent: a retried
    /// `GetNext` carrying an already-finalized trial is a no-op.
    fn finish_trial(
        &self,
        s: &mut DriverState,
        worker_id: &WorkerId,
        finished: FinishedTrial,
    ) -> Option<TrialRecord> {
        let idx = s.trials.iter().position(|t| t.id == finished.trial_id)?;
        if s.trials[idx].assigned_worker.as_ref() != Some(worker_id) {
            warn!(
                trial = %finished.trial_id,
                worker = %worker_id,
                "outcome reported by a worker that does not own the trial"
            );
            return None;
        }

        let applied = match finished.outcome {
            TrialOutcome::Metric { value } => s.trials[idx].mark_finished(value),
            TrialOutcome::Failed { reason } => s.trials[idx].mark_error(reason),
        };

        if let Some(worker) = s.workers.get_mut(worker_id) {
            if worker.current_trial.as_ref() == Some(&finished.trial_id) {
                worker.current_trial = None;
            }
        }

        if !applied {
            return None;
        }
        let trial = &s.trials[idx];
        Some(TrialRecord {
            trial_id: trial.id.clone(),
            parameters: trial.parameters.clone(),
            status: trial.status,
            final_metric: trial.final_metric,
            error: trial.error.clone(),
            log_path: Some(format!("logs/executor_{worker_id}.log")),
        })
    }

    fn mark_worker_done(&self, s: &mut DriverState, worker_id: &WorkerId) {
        if let Some(worker) = s.workers.get_mut(worker_id) {
            worker.done = true;
        }
        if Self::all_workers_done(s) {
            self.done.notify_all();
        }
    }
}

impl CoordinationHandler for ExperimentDriver {
    fn register_worker(&self, worker_id: WorkerId, address: String) -> TgResult<()> {
        let mut s = self.state.lock();
        if matches!(s.run_state, RunState::Finished | RunState::Failed) {
            return Err(Self::rejected("run is no longer accepting workers"));
        }
        if s.workers.contains_key(&worker_id) {
            return Err(Self::rejected(format!(
                "worker {worker_id} is already registered"
            )));
        }
        if s.workers.len() >= self.target_executors {
            return Err(Self::rejected("worker pool is full"));
        }

        s.workers
            .insert(worker_id.clone(), WorkerRecord::new(worker_id, address));

        if s.workers.len() == self.target_executors && s.run_state == RunState::Pending {
            s.run_state = RunState::Active;
            info!(workers = self.target_executors, "all workers registered, run active");
        }
        Ok(())
    }

    fn on_heartbeat(
        &self,
        worker_id: &WorkerId,
        trial_id: Option<&TrialId>,
        metric: Option<f64>,
        logs: Vec<String>,
    ) -> TgResult<Verdict> {
        let mut s = self.state.lock();
        {
            let worker = s
                .workers
                .get_mut(worker_id)
                .ok_or_else(|| Self::rejected(format!("unknown worker {worker_id}")))?;
            worker.last_heartbeat = Utc::now();
        }

        for line in &logs {
            debug!(worker = %worker_id, "{line}");
        }

        if let (Some(trial_id), Some(value)) = (trial_id, metric) {
            if let Some(trial) = s.trials.iter_mut().find(|t| &t.id == trial_id) {
                if trial.assigned_worker.as_ref() == Some(worker_id) {
                    trial.record_metric(value);
                }
            }
        }

        self.maybe_early_stop(&mut s);

        let verdict = match trial_id.and_then(|id| s.trials.iter().find(|t| &t.id == id)) {
            Some(trial) if trial.status == TrialStatus::EarlyStopped => Verdict::Stop,
            _ => Verdict::Continue,
        };
        Ok(verdict)
    }

    fn next_trial(
        &self,
        worker_id: &WorkerId,
        finished: Option<FinishedTrial>,
    ) -> TgResult<NextTrial> {
        let mut record = None;
        let response = {
            let mut s = self.state.lock();
            if !s.workers.contains_key(worker_id) {
                return Err(Self::rejected(format!("unknown worker {worker_id}")));
            }

            if let Some(finished) = finished {
                record = self.finish_trial(&mut s, worker_id, finished);
            }

            if s.fatal.is_some() || matches!(s.run_state, RunState::Finished | RunState::Failed) {
                self.mark_worker_done(&mut s, worker_id);
                NextTrial::Done
            } else if s.run_state == RunState::Pending {
                // Not every worker has registered yet.
                NextTrial::NotReady
            } else {
                // A worker never holds two running trials at once.
                if let Some(current) = s.workers.get(worker_id).and_then(|w| w.current_trial.clone())
                {
                    if s
                        .trials
                        .iter()
                        .any(|t| t.id == current && t.status == TrialStatus::Running)
                    {
                        return Err(Self::rejected(format!(
                            "worker {worker_id} still has running trial {current}"
                        )));
                    }
                }
                let history = s.trials.clone();
                match s.generator.next(&history) {
                    Err(e) => {
                        warn!(error = %e, "trial generator failed, aborting run");
                        s.fatal = Some(e.to_string());
                        s.run_state = RunState::Failed;
                        self.mark_worker_done(&mut s, worker_id);
                        self.done.notify_all();
                        NextTrial::Done
                    }
                    Ok(Some(mut trial)) => {
                        trial.mark_running(worker_id.clone());
                        let assignment = TrialAssignment {
                            trial_id: trial.id.clone(),
                            parameters: trial.parameters.clone(),
                        };
                        if let Some(worker) = s.workers.get_mut(worker_id) {
                            worker.current_trial = Some(trial.id.clone());
                        }
                        debug!(trial = %trial.id, worker = %worker_id, "trial assigned");
                        s.trials.push(trial);
                        NextTrial::Assignment(assignment)
                    }
                    Ok(None) => {
                        debug!(worker = %worker_id, "generator exhausted, worker done");
                        self.mark_worker_done(&mut s, worker_id);
                        NextTrial::Done
                    }
                }
            }
        };

        // File IO happens outside the coordination lock.
        if let (Some(record), Some(meta)) = (record.as_ref(), self.meta.as_ref()) {
            if let Err(e) = meta.write_trial(record) {
                warn!(trial = %record.trial_id, error = %e, "failed to write trial record");
            }
        }
        Ok(response)
    }

    fn expire_stale_workers(&self) -> Vec<WorkerId> {
        let mut s = self.state.lock();
        if matches!(s.run_state, RunState::Finished | RunState::Failed) {
            return Vec::new();
        }
        let now = Utc::now();
        let stale_after = chrono::Duration::from_std(self.config.stale_after)
            .unwrap_or_else(|_| chrono::Duration::seconds(3));

        let stale: Vec<WorkerId> = s
            .workers
            .values()
            .filter(|w| !w.done && now - w.last_heartbeat > stale_after)
            .map(|w| w.worker_id.clone())
            .collect();

        for worker_id in &stale {
            let current = s
                .workers
                .get(worker_id)
                .and_then(|w| w.current_trial.clone());
            if let Some(trial_id) = current {
                if let Some(trial) = s.trials.iter_mut().find(|t| t.id == trial_id) {
                    trial.mark_error(
                        ProtocolError::HeartbeatTimeout {
                            worker_id: worker_id.to_string(),
                            missed: 3,
                        }
                        .to_string(),
                    );
                }
            }
            if let Some(worker) = s.workers.get_mut(worker_id) {
                worker.done = true;
                worker.current_trial = None;
            }
        }

        if !stale.is_empty() && Self::all_workers_done(&s) {
            self.done.notify_all();
        }
        stale
    }
}

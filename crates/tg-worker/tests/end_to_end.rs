//! Full in-process runs: driver + coordination server + worker pool on
//! threads, exercising the whole register/heartbeat/assign/report cycle.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tg_driver::{run_experiment, RunConfig, RunRegistry, WorkerLaunchSpec, WorkerLauncher};
use tg_optimizer::{AblationSpec, MedianRule, SearchSpace, TrialGenerator};
use tg_types::{
    Direction, ParameterValue, TgResult, Trial, TrialId, TrialParams, TrialStatus, WorkerId,
};
use tg_worker::{run_worker_blocking, TrainFn, TrainOutcome, WorkerSpec};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

/// Launches the requested pool as plain threads, each running the worker
/// loop against the in-process coordination server.
struct ThreadLauncher {
    train: TrainFn,
}

impl ThreadLauncher {
    fn new(train: TrainFn) -> Self {
        Self { train }
    }
}

impl WorkerLauncher for ThreadLauncher {
    fn launch(&self, spec: WorkerLaunchSpec) -> TgResult<()> {
        for partition in 0..spec.num_workers {
            let worker_spec = WorkerSpec {
                server_addr: spec.server_addr,
                secret: spec.secret.clone(),
                worker_id: WorkerId::new(partition as u32, 0),
                hb_interval: spec.hb_interval,
                log_path: spec
                    .log_dir
                    .join(format!("logs/executor_{partition}_0.log")),
                optimization_key: spec.optimization_key.clone(),
            };
            let train = self.train.clone();
            std::thread::spawn(move || {
                let _ = run_worker_blocking(worker_spec, train, None);
            });
        }
        Ok(())
    }
}

fn bool_param(params: &TrialParams, name: &str) -> bool {
    matches!(params.get(name), Some(ParameterValue::Bool(true)))
}

#[test]
fn optimization_run_completes_with_best_trial() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let registry = RunRegistry::new();

    // The "model" scores exactly its learning rate, so the best trial is
    // the one with the largest sampled lr.
    let train: TrainFn = Arc::new(|params, reporter| {
        let lr = match params.get("lr") {
            Some(ParameterValue::Float(v)) => *v,
            other => panic!("missing lr parameter: {other:?}"),
        };
        for step in 0..3 {
            reporter.log(format!("step {step}"));
            reporter.checkpoint(lr * (step + 1) as f64 / 3.0)?;
        }
        Ok(TrainOutcome::Metric(lr))
    });

    let config = RunConfig::optimization(
        "lr-sweep",
        SearchSpace::new().add_float("lr", 0.01, 0.1),
        6,
    )
    .without_early_stop()
    .with_executors(2)
    .with_heartbeat_interval(Duration::from_millis(25))
    .with_seed(7)
    .with_log_dir(dir.path().to_path_buf());

    let launcher = ThreadLauncher::new(train);
    let result = run_experiment(config, &launcher, &registry).unwrap();

    assert_eq!(result.num_trials, 6);
    assert_eq!(result.error_count, 0);
    assert_eq!(result.early_stopped_count, 0);
    let best = result.best_metric.unwrap();
    assert!((0.01..=0.1).contains(&best));

    // The metadata boundary got one record per trial plus the experiment.
    let experiment = std::fs::read_to_string(dir.path().join("experiment.json")).unwrap();
    assert!(experiment.contains("FINISHED"));
    let trial_records = std::fs::read_dir(dir.path().join("trials")).unwrap().count();
    assert_eq!(trial_records, 6);

    // The registry is free again.
    assert!(!registry.is_active());
}

#[test]
fn ablation_run_prefers_the_baseline() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let registry = RunRegistry::new();

    // Every included group adds accuracy, so excluding nothing wins.
    let train: TrainFn = Arc::new(|params, _reporter| {
        let groups = ["embedding", "conv_block", "attention"];
        let included = groups.iter().filter(|g| bool_param(params, g)).count();
        let mut metrics = HashMap::new();
        metrics.insert("accuracy".to_string(), 0.5 + 0.1 * included as f64);
        Ok(TrainOutcome::Metrics(metrics))
    });

    let config = RunConfig::ablation(
        "component-ablation",
        AblationSpec::new()
            .add_group("embedding")
            .add_group("conv_block")
            .add_group("attention"),
    )
    .with_optimization_key("accuracy")
    .with_executors(2)
    .with_heartbeat_interval(Duration::from_millis(25))
    .with_log_dir(dir.path().to_path_buf());

    let launcher = ThreadLauncher::new(train);
    let result = run_experiment(config, &launcher, &registry).unwrap();

    // 3 groups + baseline.
    assert_eq!(result.num_trials, 4);
    assert_eq!(result.best_trial_id, Some(TrialId::sequenced(0)));
    assert_eq!(result.best_metric, Some(0.8));
    let best_params = result.best_parameters.unwrap();
    assert!(bool_param(&best_params, "embedding"));
    assert!(bool_param(&best_params, "conv_block"));
    assert!(bool_param(&best_params, "attention"));
}

#[test]
fn failing_trial_is_isolated() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let registry = RunRegistry::new();

    // The trial that drops the conv block returns a map without the
    // optimization key, which fails only that trial.
    let train: TrainFn = Arc::new(|params, _reporter| {
        if !bool_param(params, "conv_block") {
            return Ok(TrainOutcome::Metrics(HashMap::new()));
        }
        let groups = ["embedding", "conv_block"];
        let included = groups.iter().filter(|g| bool_param(params, g)).count();
        let mut metrics = HashMap::new();
        metrics.insert("accuracy".to_string(), included as f64);
        Ok(TrainOutcome::Metrics(metrics))
    });

    let config = RunConfig::ablation(
        "partial-failure",
        AblationSpec::new().add_group("embedding").add_group("conv_block"),
    )
    .with_optimization_key("accuracy")
    .with_executors(1)
    .with_heartbeat_interval(Duration::from_millis(25))
    .with_log_dir(dir.path().to_path_buf());

    let launcher = ThreadLauncher::new(train);
    let result = run_experiment(config, &launcher, &registry).unwrap();

    assert_eq!(result.num_trials, 3);
    assert_eq!(result.error_count, 1);
    // Baseline (both groups) still wins among the survivors.
    assert_eq!(result.best_trial_id, Some(TrialId::sequenced(0)));
    assert_eq!(result.best_metric, Some(2.0));
}

/// Serves a fixed list of parameter assignments, in order.
struct ListGenerator {
    remaining: std::collections::VecDeque<TrialParams>,
    produced: usize,
    total: usize,
}

impl ListGenerator {
    fn new(params: Vec<TrialParams>) -> Self {
        let total = params.len();
        Self {
            remaining: params.into(),
            produced: 0,
            total,
        }
    }
}

impl TrialGenerator for ListGenerator {
    fn next(&mut self, _history: &[Trial]) -> TgResult<Option<Trial>> {
        let Some(params) = self.remaining.pop_front() else {
            return Ok(None);
        };
        let trial = Trial::new(TrialId::sequenced(self.produced), params);
        self.produced += 1;
        Ok(Some(trial))
    }

    fn total_trials(&self) -> Option<usize> {
        Some(self.total)
    }

    fn name(&self) -> &str {
        "list"
    }
}

#[test]
fn underperforming_trial_is_early_stopped_cooperatively() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let registry = RunRegistry::new();

    // Two concurrent trials with a fixed quality target each. The weak one
    // gets a stop verdict once both have reported, and unwinds at its next
    // checkpoint.
    let train: TrainFn = Arc::new(|params, reporter| {
        let target = match params.get("target") {
            Some(ParameterValue::Float(v)) => *v,
            other => panic!("missing target parameter: {other:?}"),
        };
        for _ in 0..60 {
            reporter.checkpoint(target)?;
            std::thread::sleep(Duration::from_millis(20));
        }
        Ok(TrainOutcome::Metric(target))
    });

    let generator = ListGenerator::new(vec![
        TrialParams::new().with("target", 0.9),
        TrialParams::new().with("target", 0.1),
    ]);
    let config = RunConfig::custom(
        "early-stop",
        Box::new(generator),
        Box::new(MedianRule),
    )
    .with_direction(Direction::Max)
    .with_executors(2)
    .with_heartbeat_interval(Duration::from_millis(20))
    .with_early_stop(Duration::ZERO, 2)
    .with_log_dir(dir.path().to_path_buf());

    let launcher = ThreadLauncher::new(train);
    let result = run_experiment(config, &launcher, &registry).unwrap();

    assert_eq!(result.num_trials, 2);
    assert_eq!(result.early_stopped_count, 1);
    assert_eq!(result.best_metric, Some(0.9));

    // The truncated final metric of the stopped trial is its last
    // checkpoint value.
    let trial_raw =
        std::fs::read_to_string(dir.path().join("trials").join("t_0001.json")).unwrap();
    assert!(trial_raw.contains("EarlyStopped"));
}

#[test]
fn trial_statuses_recorded_in_metadata() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let registry = RunRegistry::new();

    let train: TrainFn = Arc::new(|_params, reporter| {
        reporter.checkpoint(1.0)?;
        Ok(TrainOutcome::Metric(1.0))
    });

    let config = RunConfig::optimization(
        "statuses",
        SearchSpace::new().add_int("units", 1, 4),
        2,
    )
    .without_early_stop()
    .with_executors(1)
    .with_heartbeat_interval(Duration::from_millis(25))
    .with_log_dir(dir.path().to_path_buf());

    let launcher = ThreadLauncher::new(train);
    run_experiment(config, &launcher, &registry).unwrap();

    for seq in 0..2 {
        let raw = std::fs::read_to_string(
            dir.path()
                .join("trials")
                .join(format!("{}.json", TrialId::sequenced(seq))),
        )
        .unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(parsed["status"], "Finished");
        assert_eq!(parsed["final_metric"], 1.0);
    }
}

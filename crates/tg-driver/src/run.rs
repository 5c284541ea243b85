//! The blocking run-level entry point: ties the driver, the coordination
//! server, and the external worker launch together, with guaranteed cleanup
//! on every exit path.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{error, info};
use uuid::Uuid;

use tg_optimizer::{AblationSpec, EarlyStopPolicy, SearchSpace, TrialGenerator};
use tg_rpc::{CoordinationHandler, CoordinationServer, ServerConfig};
use tg_types::{Direction, RunResult, TgResult};

use crate::context::{RunContext, RunRegistry};
use crate::driver::{DriverConfig, EarlyStopMode, ExperimentDriver, Strategy};
use crate::metadata::{ExperimentRecord, FsMetadataStore, MetadataStore};

/// Everything the external executor-provisioning mechanism needs to spawn
/// one pool of workers. How they are spawned is not the core's concern.
#[derive(Debug, Clone)]
pub struct WorkerLaunchSpec {
    pub server_addr: SocketAddr,
    pub secret: String,
    pub hb_interval: Duration,
    pub app_id: String,
    pub run_id: u32,
    /// Directory for per-trial logs.
    pub log_dir: PathBuf,
    pub optimization_key: String,
    /// Exactly this many workers must come up.
    pub num_workers: usize,
}

/// The launch boundary. Implementations spawn worker processes (or, in
/// tests, in-process worker loops) with the given spec.
pub trait WorkerLauncher {
    fn launch(&self, spec: WorkerLaunchSpec) -> TgResult<()>;
}

/// Run-level configuration, assembled builder-style.
pub struct RunConfig {
    pub name: String,
    pub description: String,
    pub direction: Direction,
    pub optimization_key: String,
    pub num_executors: usize,
    pub hb_interval: Duration,
    pub es_interval: Duration,
    pub es_min: usize,
    pub log_dir: PathBuf,
    pub bind_addr: String,
    strategy: Strategy,
}

impl RunConfig {
    fn base(name: String, strategy: Strategy) -> Self {
        Self {
            name,
            description: String::new(),
            direction: Direction::Max,
            optimization_key: "metric".to_string(),
            num_executors: 1,
            hb_interval: Duration::from_secs(1),
            es_interval: Duration::from_secs(300),
            es_min: 10,
            log_dir: std::env::temp_dir().join("tunegrid"),
            bind_addr: "127.0.0.1:0".to_string(),
            strategy,
        }
    }

    /// A random-search optimization run over `space`.
    pub fn optimization(name: impl Into<String>, space: SearchSpace, num_trials: usize) -> Self {
        Self::base(
            name.into(),
            Strategy::Optimization {
                space,
                num_trials,
                seed: 42,
                early_stop: EarlyStopMode::Median,
            },
        )
    }

    /// A leave-one-component-out ablation run.
    pub fn ablation(name: impl Into<String>, spec: AblationSpec) -> Self {
        Self::base(name.into(), Strategy::Ablation { spec })
    }

    /// A run driven by a user-supplied generator and policy.
    pub fn custom(
        name: impl Into<String>,
        generator: Box<dyn TrialGenerator>,
        policy: Box<dyn EarlyStopPolicy>,
    ) -> Self {
        Self::base(name.into(), Strategy::Custom { generator, policy })
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_direction(mut self, direction: Direction) -> Self {
        self.direction = direction;
        self
    }

    pub fn with_optimization_key(mut self, key: impl Into<String>) -> Self {
        self.optimization_key = key.into();
        self
    }

    pub fn with_executors(mut self, n: usize) -> Self {
        self.num_executors = n;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.hb_interval = interval;
        self
    }

    /// Early-stop throttle: evaluation interval and minimum population.
    pub fn with_early_stop(mut self, interval: Duration, min_trials: usize) -> Self {
        self.es_interval = interval;
        self.es_min = min_trials;
        self
    }

    pub fn without_early_stop(mut self) -> Self {
        if let Strategy::Optimization { early_stop, .. } = &mut self.strategy {
            *early_stop = EarlyStopMode::Disabled;
        }
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        if let Strategy::Optimization { seed: s, .. } = &mut self.strategy {
            *s = seed;
        }
        self
    }

    pub fn with_log_dir(mut self, dir: PathBuf) -> Self {
        self.log_dir = dir;
        self
    }

    pub fn with_bind_addr(mut self, addr: impl Into<String>) -> Self {
        self.bind_addr = addr.into();
        self
    }
}

/// Execute a run to completion and return its aggregate result.
///
/// Claims the registry's active-run slot before anything else, so a second
/// concurrent run fails before any worker is contacted. Blocks the calling
/// thread until every worker has drained; the coordination server runs on
/// an internal tokio runtime in the meantime. Cleanup (driver stop, server
/// shutdown, final metadata record, guard release) happens on every path.
pub fn run_experiment(
    config: RunConfig,
    launcher: &dyn WorkerLauncher,
    registry: &Arc<RunRegistry>,
) -> TgResult<RunResult> {
    let guard = registry.acquire()?;
    let started = Instant::now();

    let mut ctx = RunContext::new(config.name.clone(), guard.run_id(), config.log_dir.clone());
    ctx.description = config.description.clone();

    let meta = Arc::new(FsMetadataStore::new(ctx.log_dir.clone())?);

    let driver_config = DriverConfig {
        name: config.name.clone(),
        direction: config.direction,
        optimization_key: config.optimization_key.clone(),
        num_executors: config.num_executors,
        es_interval: config.es_interval,
        es_min: config.es_min,
        stale_after: config.hb_interval * 3,
    };
    let driver = ExperimentDriver::new(
        driver_config,
        config.strategy,
        Some(meta.clone() as Arc<dyn MetadataStore>),
    )?;

    let experiment_record = {
        let ml_id = ctx.ml_id();
        let name = ctx.name.clone();
        let kind = driver.strategy_name().to_string();
        let direction = config.direction;
        let key = config.optimization_key.clone();
        move |state: &str, duration_ms: Option<u64>, best_location: Option<String>| {
            ExperimentRecord {
                ml_id: ml_id.clone(),
                name: name.clone(),
                kind: kind.clone(),
                direction,
                optimization_key: key.clone(),
                state: state.to_string(),
                duration_ms,
                best_location,
            }
        }
    };

    let secret = Uuid::new_v4().simple().to_string();
    let runtime = tokio::runtime::Runtime::new()?;

    let outcome = (|| -> TgResult<RunResult> {
        let server = runtime.block_on(CoordinationServer::start(
            ServerConfig {
                bind_addr: config.bind_addr.clone(),
                secret: secret.clone(),
                heartbeat_interval: config.hb_interval,
                retry_after: Duration::from_millis(250),
            },
            driver.clone() as Arc<dyn CoordinationHandler>,
        ))?;

        meta.write_experiment(&experiment_record("RUNNING", None, None))?;

        let spec = WorkerLaunchSpec {
            server_addr: server.local_addr(),
            secret: secret.clone(),
            hb_interval: config.hb_interval,
            app_id: ctx.app_id.clone(),
            run_id: ctx.run_id,
            log_dir: ctx.log_dir.clone(),
            optimization_key: config.optimization_key.clone(),
            num_workers: driver.target_executors(),
        };
        info!(
            run = %ctx.ml_id(),
            addr = %spec.server_addr,
            workers = spec.num_workers,
            "launching workers"
        );
        launcher.launch(spec)?;

        let result = driver.finalize();
        server.shutdown();
        result
    })();

    driver.stop();
    let duration_ms = started.elapsed().as_millis() as u64;

    match &outcome {
        Ok(result) => {
            let best_location = result
                .best_trial_id
                .as_ref()
                .map(|id| format!("trials/{id}.json"));
            let _ = meta.write_experiment(&experiment_record(
                "FINISHED",
                Some(duration_ms),
                best_location,
            ));
            info!(run = %ctx.ml_id(), duration_ms, "run finished");
        }
        Err(e) => {
            let _ = meta.write_experiment(&experiment_record("FAILED", Some(duration_ms), None));
            error!(run = %ctx.ml_id(), duration_ms, error = %e, "run failed");
        }
    }

    drop(guard);
    outcome
}

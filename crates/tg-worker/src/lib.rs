//! # tg-worker
//!
//! The executor side of a Tunegrid run: the [`Reporter`] shared with user
//! training code, the heartbeat task, the trial execution loop, and the
//! utilization probe hook.

pub mod executor;
pub mod probe;
pub mod reporter;

pub use executor::{
    run_worker, run_worker_blocking, TrainError, TrainFn, TrainOutcome, WorkerSpec,
};
pub use probe::{spawn_probe, UtilizationProbe};
pub use reporter::{EarlyStop, Reporter};

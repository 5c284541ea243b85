//! # tg-driver
//!
//! The master side of a Tunegrid run: the experiment driver owning the
//! authoritative trial table, the run context with its single-active-run
//! guard, the write-mostly metadata-store boundary, and the blocking
//! run-level entry point that ties driver, coordination server, and worker
//! launch together.

pub mod context;
pub mod driver;
pub mod metadata;
pub mod run;

pub use context::{RunContext, RunGuard, RunRegistry};
pub use driver::{DriverConfig, EarlyStopMode, ExperimentDriver, RunState, Strategy};
pub use metadata::{ExperimentRecord, FsMetadataStore, MetadataStore, TrialRecord};
pub use run::{run_experiment, RunConfig, WorkerLaunchSpec, WorkerLauncher};

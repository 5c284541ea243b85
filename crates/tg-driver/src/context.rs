//! Run identity and the single-active-run guard.
//!
//! Every component receives an explicit [`RunContext`] owned by the caller;
//! there is no module-global run state. The [`RunRegistry`] enforces that at
//! most one run is active per registry at a time.

use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;
use uuid::Uuid;

use tg_types::{ConfigError, TgError, TgResult};

/// Identity and filesystem anchor of one run.
#[derive(Debug, Clone)]
pub struct RunContext {
    /// Application-level identifier, stable across runs of the same process.
    pub app_id: String,
    /// Monotonically increasing run number within the registry.
    pub run_id: u32,
    pub name: String,
    pub description: String,
    /// Directory for the experiment record and per-trial output files.
    pub log_dir: PathBuf,
}

impl RunContext {
    pub fn new(name: impl Into<String>, run_id: u32, log_dir: PathBuf) -> Self {
        Self {
            app_id: format!("app_{}", Uuid::new_v4().simple()),
            run_id,
            name: name.into(),
            description: String::new(),
            log_dir,
        }
    }

    /// `<app_id>_<run_id>`, the combined key used in metadata records.
    pub fn ml_id(&self) -> String {
        format!("{}_{}", self.app_id, self.run_id)
    }
}

/// Tracks whether a run is active and hands out run numbers.
#[derive(Debug, Default)]
pub struct RunRegistry {
    inner: Mutex<RegistryState>,
}

#[derive(Debug, Default)]
struct RegistryState {
    active: bool,
    next_run_id: u32,
}

impl RunRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Claim the active-run slot. Fails with `ConfigError::RunAlreadyActive`
    /// if another run holds it; the slot is released when the returned guard
    /// drops, on every exit path.
    pub fn acquire(self: &Arc<Self>) -> TgResult<RunGuard> {
        let mut inner = self.inner.lock();
        if inner.active {
            return Err(TgError::Config(ConfigError::RunAlreadyActive));
        }
        inner.active = true;
        inner.next_run_id += 1;
        Ok(RunGuard {
            registry: Arc::clone(self),
            run_id: inner.next_run_id,
        })
    }

    pub fn is_active(&self) -> bool {
        self.inner.lock().active
    }
}

/// RAII handle on the active-run slot.
#[derive(Debug)]
pub struct RunGuard {
    registry: Arc<RunRegistry>,
    run_id: u32,
}

impl RunGuard {
    pub fn run_id(&self) -> u32 {
        self.run_id
    }
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.registry.inner.lock().active = false;
    }
}

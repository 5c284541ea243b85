//! Write-mostly boundary to the external experiment metadata store.
//!
//! The driver emits a structured experiment record at run start and end and
//! one small output file per completed trial. It never reads records back
//! to make scheduling decisions.

use std::fs;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::debug;

use tg_types::{Direction, TgResult, TrialId, TrialParams, TrialStatus};

/// Run-level record, written once with state `RUNNING` and replaced at the
/// end with `FINISHED` or `FAILED`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentRecord {
    pub ml_id: String,
    pub name: String,
    /// Strategy name ("randomsearch", "loco", …).
    pub kind: String,
    pub direction: Direction,
    pub optimization_key: String,
    pub state: String,
    pub duration_ms: Option<u64>,
    /// Location of the best trial's outputs, when the run finished.
    pub best_location: Option<String>,
}

/// Per-trial output record: `{parameters, final_metric, log_path}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialRecord {
    pub trial_id: TrialId,
    pub parameters: TrialParams,
    pub status: TrialStatus,
    pub final_metric: Option<f64>,
    pub error: Option<String>,
    pub log_path: Option<String>,
}

/// The metadata store seen from the core: write-mostly key-value.
pub trait MetadataStore: Send + Sync {
    fn write_experiment(&self, record: &ExperimentRecord) -> TgResult<()>;
    fn write_trial(&self, record: &TrialRecord) -> TgResult<()>;
}

/// Filesystem-backed store: `experiment.json` plus `trials/<id>.json` under
/// the run's log directory.
pub struct FsMetadataStore {
    root: PathBuf,
}

impl FsMetadataStore {
    pub fn new(root: PathBuf) -> TgResult<Self> {
        fs::create_dir_all(root.join("trials"))?;
        Ok(Self { root })
    }

    pub fn trial_path(&self, trial_id: &TrialId) -> PathBuf {
        self.root.join("trials").join(format!("{trial_id}.json"))
    }
}

impl MetadataStore for FsMetadataStore {
    fn write_experiment(&self, record: &ExperimentRecord) -> TgResult<()> {
        let path = self.root.join("experiment.json");
        fs::write(&path, serde_json::to_vec_pretty(record)?)?;
        debug!(path = %path.display(), state = %record.state, "experiment record written");
        Ok(())
    }

    fn write_trial(&self, record: &TrialRecord) -> TgResult<()> {
        let path = self.trial_path(&record.trial_id);
        fs::write(&path, serde_json::to_vec_pretty(record)?)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(state: &str) -> ExperimentRecord {
        ExperimentRecord {
            ml_id: "app_x_1".to_string(),
            name: "lr sweep".to_string(),
            kind: "randomsearch".to_string(),
            direction: Direction::Max,
            optimization_key: "accuracy".to_string(),
            state: state.to_string(),
            duration_ms: None,
            best_location: None,
        }
    }

    #[test]
    fn experiment_record_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsMetadataStore::new(dir.path().to_path_buf()).unwrap();

        store.write_experiment(&record("RUNNING")).unwrap();
        let mut done = record("FINISHED");
        done.duration_ms = Some(1500);
        store.write_experiment(&done).unwrap();

        let raw = std::fs::read_to_string(dir.path().join("experiment.json")).unwrap();
        let back: ExperimentRecord = serde_json::from_str(&raw).unwrap();
        assert_eq!(back.state, "FINISHED");
        assert_eq!(back.duration_ms, Some(1500));
    }

    #[test]
    fn trial_records_land_under_trials_dir() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsMetadataStore::new(dir.path().to_path_buf()).unwrap();

        let record = TrialRecord {
            trial_id: TrialId::sequenced(4),
            parameters: TrialParams::new().with("lr", 0.01),
            status: TrialStatus::Finished,
            final_metric: Some(0.93),
            error: None,
            log_path: Some("logs/worker_0_0.log".to_string()),
        };
        store.write_trial(&record).unwrap();

        let raw = std::fs::read_to_string(dir.path().join("trials/t_0004.json")).unwrap();
        let back: TrialRecord = serde_json::from_str(&raw).unwrap();
        assert_eq!(back, record);
    }
}

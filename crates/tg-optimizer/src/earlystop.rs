//! Early-stop policies: advisory comparison of running trials against their
//! peers.

use tracing::debug;

use tg_types::{Direction, TrialId};

/// Read-only view of one running trial's intermediate metrics, in report
/// order.
#[derive(Debug, Clone, PartialEq)]
pub struct TrialObservation {
    pub trial_id: TrialId,
    pub metrics: Vec<f64>,
}

/// Decides which running trials should be stopped now.
///
/// Advisory to the driver: a recommendation never forces termination of a
/// trial that has already finished.
pub trait EarlyStopPolicy: Send {
    fn should_stop(&self, running: &[TrialObservation], direction: Direction) -> Vec<TrialId>;

    fn name(&self) -> &str;
}

/// The median stopping rule.
///
/// A trial is recommended for stopping when its latest metric is worse than
/// the median of the other running trials' metrics at a comparable
/// checkpoint. "Comparable" is index-based: a candidate with `k` reported
/// points is compared against each peer's value at point `min(k, len)`,
/// since heartbeats arrive on a fixed interval.
#[derive(Debug, Default)]
pub struct MedianRule;

impl MedianRule {
    fn median(mut values: Vec<f64>) -> f64 {
        values.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let mid = values.len() / 2;
        if values.len() % 2 == 1 {
            values[mid]
        } else {
            (values[mid - 1] + values[mid]) / 2.0
        }
    }
}

impl EarlyStopPolicy for MedianRule {
    fn should_stop(&self, running: &[TrialObservation], direction: Direction) -> Vec<TrialId> {
        let mut stop = Vec::new();

        for candidate in running {
            let Some(&latest) = candidate.metrics.last() else {
                continue;
            };
            let checkpoint = candidate.metrics.len();

            let peers: Vec<f64> = running
                .iter()
                .filter(|other| other.trial_id != candidate.trial_id)
                .filter_map(|other| {
                    let idx = checkpoint.min(other.metrics.len());
                    (idx > 0).then(|| other.metrics[idx - 1])
                })
                .collect();
            if peers.is_empty() {
                continue;
            }

            let median = Self::median(peers);
            if direction.worse(latest, median) {
                debug!(
                    trial = %candidate.trial_id,
                    latest, median, "median rule recommends stop"
                );
                stop.push(candidate.trial_id.clone());
            }
        }

        stop
    }

    fn name(&self) -> &str {
        "median"
    }
}

/// Never stops anything. Used for ablation runs and for optimization runs
/// with early stopping disabled.
#[derive(Debug, Default)]
pub struct NoStoppingRule;

impl EarlyStopPolicy for NoStoppingRule {
    fn should_stop(&self, _running: &[TrialObservation], _direction: Direction) -> Vec<TrialId> {
        Vec::new()
    }

    fn name(&self) -> &str {
        "none"
    }
}

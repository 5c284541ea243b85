//! The pluggable trial-generation strategy interface and random search.

use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use tracing::debug;

use tg_types::{TgResult, Trial, TrialId};

use crate::search::SearchSpace;

/// Common trait for all trial-generation strategies.
///
/// The driver calls [`next`](Self::next) once per idle worker; a strategy
/// returns `None` when the experiment is exhausted and must keep returning
/// `None` on repeated calls. Implementations must be deterministic given the
/// same history and seed so a run's record is reproducible.
pub trait TrialGenerator: Send {
    /// Hook called once before the first `next`.
    fn initialize(&mut self) -> TgResult<()> {
        Ok(())
    }

    /// Produce the next trial, or `None` if there are no trials remaining.
    /// `history` is a read-only view of all trials created so far, in
    /// creation order.
    fn next(&mut self, history: &[Trial]) -> TgResult<Option<Trial>>;

    /// Hook called once before the experiment finishes, for summary
    /// bookkeeping.
    fn on_finalize(&mut self, _history: &[Trial]) {}

    /// Total number of producible trials, when known up front. The driver
    /// uses this to avoid allocating more workers than trials.
    fn total_trials(&self) -> Option<usize>;

    /// Human-readable strategy name.
    fn name(&self) -> &str;
}

/// Independent random sampling across the search space, up to a fixed trial
/// count.
pub struct RandomSearch {
    space: SearchSpace,
    num_trials: usize,
    produced: usize,
    rng: ChaCha8Rng,
}

impl RandomSearch {
    pub fn new(space: SearchSpace, num_trials: usize, seed: u64) -> Self {
        Self {
            space,
            num_trials,
            produced: 0,
            rng: ChaCha8Rng::seed_from_u64(seed),
        }
    }
}

impl TrialGenerator for RandomSearch {
    fn next(&mut self, _history: &[Trial]) -> TgResult<Option<Trial>> {
        if self.produced >= self.num_trials {
            return Ok(None);
        }
        let trial = Trial::new(
            TrialId::sequenced(self.produced),
            self.space.sample(&mut self.rng),
        );
        self.produced += 1;
        debug!(trial = %trial.id, "sampled trial {}/{}", self.produced, self.num_trials);
        Ok(Some(trial))
    }

    fn total_trials(&self) -> Option<usize> {
        Some(self.num_trials)
    }

    fn name(&self) -> &str {
        "randomsearch"
    }
}

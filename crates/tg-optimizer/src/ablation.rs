//! Leave-one-component-out ablation: one trial per excluded group plus a
//! baseline.

use serde::{Deserialize, Serialize};
use tracing::debug;

use tg_types::{TgResult, Trial, TrialId, TrialParams};

use crate::generator::TrialGenerator;

/// The ablation search space: a set of named ablatable groups (model
/// components, feature groups, layers).
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct AblationSpec {
    groups: Vec<String>,
}

impl AblationSpec {
    pub fn new() -> Self {
        Self { groups: Vec::new() }
    }

    /// Register an ablatable group. Order determines trial order.
    pub fn add_group(mut self, name: impl Into<String>) -> Self {
        self.groups.push(name.into());
        self
    }

    pub fn groups(&self) -> &[String] {
        &self.groups
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }
}

/// Leave-one-component-out trial generator.
///
/// The first trial is the baseline (nothing excluded); each subsequent trial
/// excludes exactly one group. The total trial count is `groups + 1`, fixed
/// at initialization. Trial parameters carry one boolean per group, `true`
/// when the group is included.
pub struct LocoAblation {
    spec: AblationSpec,
    cursor: usize,
}

impl LocoAblation {
    pub fn new(spec: AblationSpec) -> Self {
        Self { spec, cursor: 0 }
    }

    fn params_excluding(&self, excluded: Option<&str>) -> TrialParams {
        let mut params = TrialParams::new();
        for group in self.spec.groups() {
            params.insert(group.clone(), Some(group.as_str()) != excluded);
        }
        params
    }
}

impl TrialGenerator for LocoAblation {
    fn next(&mut self, _history: &[Trial]) -> TgResult<Option<Trial>> {
        let trial = match self.cursor {
            0 => Trial::new(TrialId::sequenced(0), self.params_excluding(None)),
            n if n <= self.spec.len() => {
                let excluded = &self.spec.groups()[n - 1];
                debug!(group = %excluded, "ablation trial excludes group");
                Trial::new(TrialId::sequenced(n), self.params_excluding(Some(excluded)))
            }
            _ => return Ok(None),
        };
        self.cursor += 1;
        Ok(Some(trial))
    }

    fn total_trials(&self) -> Option<usize> {
        Some(self.spec.len() + 1)
    }

    fn name(&self) -> &str {
        "loco"
    }
}

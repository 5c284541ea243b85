//! Search space definitions and seeded parameter sampling.

use rand::Rng;
use serde::{Deserialize, Serialize};

use tg_types::{ParameterValue, TrialParams};

/// A single parameter dimension in the search space.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterDef {
    /// Human-readable parameter name (e.g. "learning_rate").
    pub name: String,
    /// The kind of search range.
    pub kind: ParameterKind,
}

/// Describes how a parameter is sampled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ParameterKind {
    /// Continuous uniform range [low, high].
    FloatRange { low: f64, high: f64 },
    /// Integer range [low, high] inclusive.
    IntRange { low: i64, high: i64 },
    /// Log-uniform range (sampled in log-space then exponentiated).
    LogUniform { low: f64, high: f64 },
    /// Categorical choices.
    Choice { values: Vec<ParameterValue> },
    /// Boolean flag.
    Bool,
}

impl ParameterKind {
    /// Draw one value from this dimension. All randomness flows through the
    /// caller-supplied generator so a seeded run reproduces exactly.
    fn sample(&self, rng: &mut impl Rng) -> ParameterValue {
        match self {
            Self::FloatRange { low, high } => ParameterValue::Float(rng.gen_range(*low..=*high)),
            Self::IntRange { low, high } => ParameterValue::Int(rng.gen_range(*low..=*high)),
            Self::LogUniform { low, high } => {
                let log_low = low.ln();
                let log_high = high.ln();
                let log_val: f64 = rng.gen_range(log_low..=log_high);
                ParameterValue::Float(log_val.exp())
            }
            Self::Choice { values } => {
                let idx = rng.gen_range(0..values.len());
                values[idx].clone()
            }
            Self::Bool => ParameterValue::Bool(rng.gen()),
        }
    }
}

/// The full search space: an ordered list of parameter definitions.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SearchSpace {
    pub parameters: Vec<ParameterDef>,
}

impl SearchSpace {
    pub fn new() -> Self {
        Self {
            parameters: Vec::new(),
        }
    }

    pub fn add_float(mut self, name: impl Into<String>, low: f64, high: f64) -> Self {
        self.parameters.push(ParameterDef {
            name: name.into(),
            kind: ParameterKind::FloatRange { low, high },
        });
        self
    }

    pub fn add_int(mut self, name: impl Into<String>, low: i64, high: i64) -> Self {
        self.parameters.push(ParameterDef {
            name: name.into(),
            kind: ParameterKind::IntRange { low, high },
        });
        self
    }

    pub fn add_log_uniform(mut self, name: impl Into<String>, low: f64, high: f64) -> Self {
        self.parameters.push(ParameterDef {
            name: name.into(),
            kind: ParameterKind::LogUniform { low, high },
        });
        self
    }

    pub fn add_choice(mut self, name: impl Into<String>, values: Vec<ParameterValue>) -> Self {
        self.parameters.push(ParameterDef {
            name: name.into(),
            kind: ParameterKind::Choice { values },
        });
        self
    }

    pub fn add_bool(mut self, name: impl Into<String>) -> Self {
        self.parameters.push(ParameterDef {
            name: name.into(),
            kind: ParameterKind::Bool,
        });
        self
    }

    pub fn is_empty(&self) -> bool {
        self.parameters.is_empty()
    }

    /// Draw a full parameter assignment, one independent sample per
    /// dimension.
    pub fn sample(&self, rng: &mut impl Rng) -> TrialParams {
        let mut params = TrialParams::new();
        for def in &self.parameters {
            params.insert(def.name.clone(), def.kind.sample(rng));
        }
        params
    }
}

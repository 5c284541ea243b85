//! # tg-optimizer
//!
//! Trial generation for Tunegrid experiments.
//!
//! Provides search space definitions, the pluggable [`TrialGenerator`]
//! strategy interface with random-search and leave-one-component-out
//! ablation implementations, and the early-stop policies consulted by the
//! experiment driver.

mod ablation;
mod earlystop;
mod generator;
mod search;

pub use ablation::{AblationSpec, LocoAblation};
pub use earlystop::{EarlyStopPolicy, MedianRule, NoStoppingRule, TrialObservation};
pub use generator::{RandomSearch, TrialGenerator};
pub use search::{ParameterDef, ParameterKind, SearchSpace};

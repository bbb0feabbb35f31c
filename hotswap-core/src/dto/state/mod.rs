//! State DTOs

use serde::{Deserialize, Serialize};

use crate::domain::outcome::CycleOutcome;
use crate::domain::step::StepRecord;

/// A step record together with where it was emitted
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepEntry {
    /// Version (artifact base name) the step ran for; empty before naming
    pub version: String,

    /// Workflow stage that ran the step (`deploy`, `release`)
    pub workflow: String,

    #[serde(flatten)]
    pub record: StepRecord,
}

/// Body of `GET /state`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateSnapshot {
    /// Most recent step records, oldest first
    pub steps: Vec<StepEntry>,

    /// Most recent cycle outcomes, oldest first
    pub cycles: Vec<CycleOutcome>,
}

//! Cycle outcome domain types
//!
//! Every deployment cycle admitted to the update queue ends with exactly one
//! outcome, emitted by whichever stage stopped the cycle.

use serde::{Deserialize, Serialize};

use crate::domain::upstream::RegistryKey;

/// Terminal state of a deployment cycle
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CycleStatus {
    /// The workspace was cloned for the first time; nothing was built
    Bootstrapped,
    /// A new instance was launched and promoted to default
    Released { key: RegistryKey, address: String },
    /// The commit is already running; no process was started
    AlreadyDeployed { key: RegistryKey },
    /// The cycle stopped at `stage`; the previous default keeps serving
    Failed { stage: String, reason: String },
}

/// Outcome of one cycle
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CycleOutcome {
    pub id: String,
    #[serde(flatten)]
    pub status: CycleStatus,
}

impl CycleOutcome {
    pub fn new(id: impl Into<String>, status: CycleStatus) -> Self {
        Self {
            id: id.into(),
            status,
        }
    }

    pub fn failed(id: impl Into<String>, stage: &str, reason: impl std::fmt::Display) -> Self {
        Self::new(
            id,
            CycleStatus::Failed {
                stage: stage.to_string(),
                reason: reason.to_string(),
            },
        )
    }

    pub fn is_failure(&self) -> bool {
        matches!(self.status, CycleStatus::Failed { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_json_shape() {
        let outcome = CycleOutcome::new(
            "c1",
            CycleStatus::AlreadyDeployed {
                key: RegistryKey::new("svc-0123456789abcdef", "v1"),
            },
        );
        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "id": "c1",
                "status": "already_deployed",
                "key": "svc-0123456789abcdef/v1"
            })
        );
    }
}

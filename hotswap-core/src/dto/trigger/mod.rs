//! Trigger DTOs

use serde::{Deserialize, Serialize};

/// Request to start a deployment cycle by hand
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TriggerRequest {
    /// Free-form action identifier, logged by the trigger stage
    #[serde(default)]
    pub action: Option<String>,
}

/// Response to an accepted trigger
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerAccepted {
    /// Cycle id; matches the `id` of the eventual outcome
    pub id: String,
}

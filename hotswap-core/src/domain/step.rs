//! Step domain types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::domain::event::Envs;

/// An externally-defined command run by a pipeline stage
///
/// `args` and the values of `envs` are templates: `${version}`,
/// `${artifact}`, `${port}` or any environment name. They are resolved right
/// before the command runs; the step itself is never mutated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecStep {
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Working directory, relative to the stage's base directory
    #[serde(default = "default_work_dir")]
    pub work_dir: String,
    #[serde(default)]
    pub envs: Envs,
    /// When set, the first line of the command output is published to later
    /// steps under this name
    #[serde(default)]
    pub output: Option<String>,
}

fn default_work_dir() -> String {
    ".".to_string()
}

impl ExecStep {
    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            args: Vec::new(),
            work_dir: default_work_dir(),
            envs: Envs::new(),
            output: None,
        }
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn env(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.set(name, value);
        self
    }

    pub fn capture_as(mut self, name: impl Into<String>) -> Self {
        self.output = Some(name.into());
        self
    }
}

/// Lifecycle status of a step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StepStatus {
    Started,
    Done,
    Failed,
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StepStatus::Started => write!(f, "started"),
            StepStatus::Done => write!(f, "done"),
            StepStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Observation of a step, emitted to the state sink
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepRecord {
    pub step_name: String,
    pub status: StepStatus,
    pub start_time: DateTime<Utc>,
    /// Present once the step has finished
    pub duration: Option<Duration>,
}

impl StepRecord {
    pub fn started(step_name: impl Into<String>, start_time: DateTime<Utc>) -> Self {
        Self {
            step_name: step_name.into(),
            status: StepStatus::Started,
            start_time,
            duration: None,
        }
    }

    pub fn finished(
        step_name: impl Into<String>,
        succeeded: bool,
        start_time: DateTime<Utc>,
        duration: Duration,
    ) -> Self {
        Self {
            step_name: step_name.into(),
            status: if succeeded {
                StepStatus::Done
            } else {
                StepStatus::Failed
            },
            start_time,
            duration: Some(duration),
        }
    }
}

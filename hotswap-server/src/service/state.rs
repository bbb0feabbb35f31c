//! State sink service
//!
//! Receives step records from the workflow stages and cycle outcomes from the
//! update worker. Records are append-only: the pipeline never reads them back.
//! The in-memory implementation keeps the most recent entries for the status
//! API and logs every step record.

use hotswap_core::domain::outcome::CycleOutcome;
use hotswap_core::domain::step::{StepRecord, StepStatus};
use hotswap_core::dto::state::{StateSnapshot, StepEntry};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{info, warn};

/// Number of records kept by default
pub const DEFAULT_STATE_CAPACITY: usize = 256;

/// Destination for step observations
pub trait StateSink: Send + Sync {
    /// Records one step observation
    ///
    /// # Arguments
    /// * `version` - Artifact base name of the cycle (empty before naming)
    /// * `workflow` - Stage that ran the step
    /// * `record` - The observation
    fn notify_step(&self, version: &str, workflow: &str, record: StepRecord);

    /// Records the outcome of a finished cycle
    fn notify_cycle(&self, _outcome: &CycleOutcome) {}
}

/// Bounded in-memory implementation of StateSink
///
/// Oldest entries are discarded once `capacity` is reached. Steps and cycles
/// are bounded separately.
#[derive(Clone)]
pub struct InMemoryStateSink {
    entries: Arc<Mutex<VecDeque<StepEntry>>>,
    cycles: Arc<Mutex<VecDeque<CycleOutcome>>>,
    capacity: usize,
}

impl InMemoryStateSink {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: Arc::new(Mutex::new(VecDeque::with_capacity(capacity))),
            cycles: Arc::new(Mutex::new(VecDeque::new())),
            capacity,
        }
    }

    /// Returns the kept step entries, oldest first
    pub fn steps(&self) -> Vec<StepEntry> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.iter().cloned().collect()
    }

    /// Returns the kept cycle outcomes, oldest first
    pub fn cycles(&self) -> Vec<CycleOutcome> {
        let cycles = self.cycles.lock().unwrap_or_else(PoisonError::into_inner);
        cycles.iter().cloned().collect()
    }

    pub fn snapshot(&self) -> StateSnapshot {
        StateSnapshot {
            steps: self.steps(),
            cycles: self.cycles(),
        }
    }
}

impl Default for InMemoryStateSink {
    fn default() -> Self {
        Self::new(DEFAULT_STATE_CAPACITY)
    }
}

fn push_bounded<T>(queue: &Mutex<VecDeque<T>>, capacity: usize, item: T) {
    let mut queue = queue.lock().unwrap_or_else(PoisonError::into_inner);
    if queue.len() == capacity {
        queue.pop_front();
    }
    queue.push_back(item);
}

impl StateSink for InMemoryStateSink {
    fn notify_step(&self, version: &str, workflow: &str, record: StepRecord) {
        match record.status {
            StepStatus::Failed => warn!(
                "[{}] step '{}' failed for '{}' after {:?}",
                workflow, record.step_name, version, record.duration
            ),
            status => info!(
                "[{}] step '{}' {} for '{}'",
                workflow, record.step_name, status, version
            ),
        }

        push_bounded(
            &self.entries,
            self.capacity,
            StepEntry {
                version: version.to_string(),
                workflow: workflow.to_string(),
                record,
            },
        );
    }

    fn notify_cycle(&self, outcome: &CycleOutcome) {
        push_bounded(&self.cycles, self.capacity, outcome.clone());
    }
}

//! Update queue
//!
//! Requests are explicit `BuildRequest` messages on an unbounded channel with
//! a single consumer, the `UpdateWorker`. For each request the worker
//! synchronises the working copy, hands a trigger signal to the workflow
//! stages and waits for the cycle outcome before taking the next request.

use chrono::{DateTime, Utc};
use hotswap_core::domain::outcome::{CycleOutcome, CycleStatus};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::git::{SyncOutcome, Workspace};
use crate::service::StateSink;
use crate::workflow::trigger::TriggerSignal;

/// Why a cycle was requested
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TriggerReason {
    /// A receive-pack on the managed repository completed
    Push,
    /// Requested through the API
    Manual { action: Option<String> },
}

/// A queued deployment cycle
#[derive(Debug, Clone)]
pub struct BuildRequest {
    pub id: String,
    pub repository: String,
    pub reason: TriggerReason,
    pub received_at: DateTime<Utc>,
}

impl BuildRequest {
    pub fn new(repository: impl Into<String>, reason: TriggerReason) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            repository: repository.into(),
            reason,
            received_at: Utc::now(),
        }
    }

    pub fn push(repository: impl Into<String>) -> Self {
        Self::new(repository, TriggerReason::Push)
    }

    pub fn manual(repository: impl Into<String>, action: Option<String>) -> Self {
        Self::new(repository, TriggerReason::Manual { action })
    }

    /// Action identifier passed on to the trigger stage
    pub fn action(&self) -> String {
        match &self.reason {
            TriggerReason::Push => format!("push:{}", self.repository),
            TriggerReason::Manual { action: Some(action) } => action.clone(),
            TriggerReason::Manual { action: None } => format!("manual:{}", self.repository),
        }
    }
}

/// Error returned when the worker has stopped
#[derive(Debug, Error, PartialEq, Eq)]
#[error("update queue is closed")]
pub struct QueueClosed;

/// Producer side of the update queue
#[derive(Debug, Clone)]
pub struct UpdateQueue {
    tx: mpsc::UnboundedSender<BuildRequest>,
}

impl UpdateQueue {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<BuildRequest>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Enqueues a request, returning its id
    pub fn submit(&self, request: BuildRequest) -> Result<String, QueueClosed> {
        let id = request.id.clone();
        debug!("Queueing cycle {} ({:?})", id, request.reason);
        self.tx.send(request).map_err(|_| QueueClosed)?;
        Ok(id)
    }
}

/// Single consumer of the update queue
pub struct UpdateWorker {
    workspace: Arc<dyn Workspace>,
    sink: Arc<dyn StateSink>,
    triggers: mpsc::UnboundedSender<TriggerSignal>,
    outcomes: mpsc::UnboundedReceiver<CycleOutcome>,
}

impl UpdateWorker {
    pub fn new(
        workspace: Arc<dyn Workspace>,
        sink: Arc<dyn StateSink>,
        triggers: mpsc::UnboundedSender<TriggerSignal>,
        outcomes: mpsc::UnboundedReceiver<CycleOutcome>,
    ) -> Self {
        Self {
            workspace,
            sink,
            triggers,
            outcomes,
        }
    }

    /// Consumes requests until cancelled or the queue is closed
    pub async fn run(
        mut self,
        cancel: CancellationToken,
        mut requests: mpsc::UnboundedReceiver<BuildRequest>,
    ) -> anyhow::Result<()> {
        info!("Update worker started");

        loop {
            let request = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                request = requests.recv() => match request {
                    Some(request) => request,
                    None => break,
                },
            };

            match self.process(request, &cancel).await {
                Some(outcome) => {
                    log_outcome(&outcome);
                    self.sink.notify_cycle(&outcome);
                }
                None => break,
            }
        }

        info!("Update worker stopped");
        Ok(())
    }

    /// Runs one cycle to its outcome
    ///
    /// Returns `None` if the worker was cancelled or the stages are gone
    /// before the outcome arrived.
    pub async fn process(
        &mut self,
        request: BuildRequest,
        cancel: &CancellationToken,
    ) -> Option<CycleOutcome> {
        info!(
            "Starting cycle {} for {} (queued {}ms)",
            request.id,
            request.repository,
            (Utc::now() - request.received_at).num_milliseconds()
        );

        match self.workspace.sync().await {
            Ok(SyncOutcome::Bootstrapped) => {
                return Some(CycleOutcome::new(&request.id, CycleStatus::Bootstrapped));
            }
            Ok(SyncOutcome::Updated) => {}
            Err(e) => {
                error!("Could not synchronize workspace: {}", e);
                return Some(CycleOutcome::failed(&request.id, "sync", e));
            }
        }

        if cancel.is_cancelled() {
            info!("Cycle {} cancelled after sync", request.id);
            return None;
        }

        let signal = TriggerSignal {
            id: request.id.clone(),
            action: request.action(),
        };
        if self.triggers.send(signal).is_err() {
            warn!("Trigger stage is gone, dropping cycle {}", request.id);
            return None;
        }

        loop {
            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => return None,
                outcome = self.outcomes.recv() => outcome?,
            };
            if outcome.id == request.id {
                return Some(outcome);
            }
            warn!("Ignoring outcome of unknown cycle {}", outcome.id);
        }
    }
}

fn log_outcome(outcome: &CycleOutcome) {
    match &outcome.status {
        CycleStatus::Bootstrapped => {
            info!("Cycle {}: workspace bootstrapped, nothing built", outcome.id)
        }
        CycleStatus::Released { key, address } => {
            info!("Cycle {}: {} released at {}", outcome.id, key, address)
        }
        CycleStatus::AlreadyDeployed { key } => {
            info!("Cycle {}: {} is already running", outcome.id, key)
        }
        CycleStatus::Failed { stage, reason } => {
            warn!("Cycle {} failed in {}: {}", outcome.id, stage, reason)
        }
    }
}

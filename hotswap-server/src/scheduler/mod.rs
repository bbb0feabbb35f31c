//! Scheduler layer
//!
//! This layer admits deployment requests (pushes and manual triggers) and
//! runs them one at a time. A request that arrives while a cycle is in
//! progress waits in the queue until that cycle has produced its outcome.

pub mod queue;

pub use queue::{BuildRequest, QueueClosed, TriggerReason, UpdateQueue, UpdateWorker};

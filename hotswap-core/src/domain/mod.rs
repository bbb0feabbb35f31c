//! Core domain types
//!
//! This module contains the structures that flow through the deployment
//! pipeline. They are shared between the workflow stages (which produce them)
//! and the status API (which reports them).

pub mod event;
pub mod outcome;
pub mod step;
pub mod upstream;

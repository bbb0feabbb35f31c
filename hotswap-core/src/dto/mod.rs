//! Data Transfer Objects for the status API
//!
//! DTOs are the JSON shapes served by the git listener's status endpoints.
//! They are lightweight views over the in-memory registry and state sink.

pub mod state;
pub mod trigger;
pub mod upstream;

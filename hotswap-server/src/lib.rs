//! Hotswap server
//!
//! Push-to-deploy for a single repository: a git push to the managed bare
//! repository runs the tests, builds an artifact named after the commit and
//! swaps the instance behind the reverse proxy without downtime.

pub mod api;
pub mod config;
pub mod git;
pub mod proxy;
pub mod scheduler;
pub mod server;
pub mod service;
pub mod signal;
pub mod workflow;

//! API Module
//!
//! HTTP surface of the git listener: status endpoints plus the git
//! smart-HTTP delegate as fallback. Pushes to the managed repository are
//! observed and queued for deployment.

pub mod error;
pub mod git;
pub mod health;
pub mod status;

use axum::{
    Router, middleware,
    routing::{get, post},
};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use crate::scheduler::UpdateQueue;
use crate::service::{InMemoryStateSink, UpstreamRegistry};

pub use git::GitHttpBackend;

/// Shared state of the git listener
#[derive(Clone)]
pub struct AppState {
    /// Name of the managed repository
    pub repository: String,
    pub registry: Arc<UpstreamRegistry>,
    pub sink: Arc<InMemoryStateSink>,
    pub queue: UpdateQueue,
    pub git: Arc<GitHttpBackend>,
}

/// Create the git listener router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Health check
        .route("/health", get(health::health_check))
        // Status endpoints
        .route("/state", get(status::get_state))
        .route("/upstreams", get(status::list_upstreams))
        .route("/trigger", post(status::trigger))
        // Everything else is git smart-HTTP
        .fallback(git::git_backend)
        .layer(middleware::from_fn_with_state(
            state.clone(),
            git::observe_receive_pack,
        ))
        // Add state and middleware
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

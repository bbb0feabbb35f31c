//! Status API Handlers
//!
//! Read-only views over the registry and the state sink, plus the manual
//! trigger.

use axum::{Json, extract::State, http::StatusCode};
use hotswap_core::dto::state::StateSnapshot;
use hotswap_core::dto::trigger::{TriggerAccepted, TriggerRequest};
use hotswap_core::dto::upstream::UpstreamsSnapshot;

use crate::api::AppState;
use crate::api::error::ApiResult;
use crate::scheduler::BuildRequest;

/// GET /state
/// Recent step records and cycle outcomes
pub async fn get_state(State(state): State<AppState>) -> Json<StateSnapshot> {
    Json(state.sink.snapshot())
}

/// GET /upstreams
pub async fn list_upstreams(State(state): State<AppState>) -> Json<UpstreamsSnapshot> {
    Json(state.registry.snapshot())
}

/// POST /trigger
/// Queues a cycle as if a push had arrived
pub async fn trigger(
    State(state): State<AppState>,
    body: Option<Json<TriggerRequest>>,
) -> ApiResult<(StatusCode, Json<TriggerAccepted>)> {
    let req = body.map(|Json(req)| req).unwrap_or_default();
    tracing::info!("Manual trigger requested ({:?})", req.action);

    let id = state
        .queue
        .submit(BuildRequest::manual(&state.repository, req.action))?;

    Ok((StatusCode::ACCEPTED, Json(TriggerAccepted { id })))
}

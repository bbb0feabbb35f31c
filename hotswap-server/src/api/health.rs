//! Health Check API Handler
//!
//! Liveness endpoint for monitoring; also reports which upstream is serving.

use axum::{Json, extract::State};
use serde_json::{Value, json};

use crate::api::AppState;

/// GET /health
pub async fn health_check(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "repository": state.repository,
        "default": state.registry.get_default().map(|key| key.to_string()),
    }))
}

//! `GET /v1/models`: lists every model name with at least one
//! active channel bound to it. Not metered, not authenticated against a
//! balance (it bypasses pre-flight entirely — just the routing table).
use std::sync::Arc;

use axum::extract::State;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::Value;

use crate::proxy::{dispatch::new_trace_id, with_trace_header};
use crate::state::AppState;

pub async fn handle(State(state): State<Arc<AppState>>) -> Response {
    let trace_id = new_trace_id(&state);
    let models = state.registry.list_models().await;
    let data: Vec<Value> = models
        .into_iter()
        .map(|id| serde_json::json!({"id": id, "object": "model"}))
        .collect();
    let body = serde_json::json!({"object": "list", "data": data});
    with_trace_header(Json(body).into_response(), &trace_id)
}

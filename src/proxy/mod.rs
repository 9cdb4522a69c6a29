//! HTTP surface: one handler module per request family plus the
//! shared pre-flight/routing scaffolding in [`dispatch`]. [`router`] wires
//! every route under the configurable base path and installs the catch-all
//! 404
use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;

use crate::error::GatewayError;
use crate::proxy::dispatch::DispatchContext;
use crate::state::request_id::TraceId;
use crate::state::AppState;

pub mod asr;
pub mod chat;
pub mod completions;
pub mod disconnect;
pub mod dispatch;
pub mod embeddings;
pub mod files;
pub mod models;
pub mod rerank;
pub mod tts;

/// Build the full application router, with every `/v1/*` route nested under
/// `state.config.server.base_path`.
#[must_use]
pub fn router(state: Arc<AppState>) -> Router {
    let v1 = Router::new()
        .route("/chat/completions", post(chat::handle))
        .route("/completions", post(completions::handle))
        .route("/embeddings", post(embeddings::handle))
        .route("/rerank", post(rerank::handle))
        .route("/audio/speech", post(tts::handle_json))
        .route("/audio/speech-ext", post(tts::handle_multipart))
        .route("/audio/transcriptions", post(asr::handle))
        .route("/models", get(models::handle))
        .route("/files", post(files::create).get(files::list))
        .route("/files/{id}", get(files::retrieve).delete(files::remove))
        .fallback(not_found);

    let base_path = state.config.server.base_path.trim_end_matches('/');
    let nested = if base_path.is_empty() {
        Router::new().nest("/v1", v1)
    } else {
        Router::new().nest(base_path, Router::new().nest("/v1", v1))
    };

    nested.fallback(not_found).with_state(state)
}

async fn not_found(uri: axum::http::Uri) -> axum::response::Response {
    let trace_id = TraceId::from(uuid::Uuid::from_u128(u128::from(fastrand::u64(..))));
    GatewayError::RouteNotFound(uri.path().to_string()).into_response(&trace_id)
}

/// Publish an error event for a request that already passed pre-flight, then
/// render the wire error response.
pub(crate) async fn record_error(
    state: &AppState,
    ctx: &DispatchContext,
    model: &str,
    err: GatewayError,
    stream: bool,
) -> axum::response::Response {
    crate::proxy::dispatch::emit_error_event(
        state,
        &ctx.trace_id,
        model,
        ctx.route.channel.id,
        &ctx.auth.api_key.creator,
        &ctx.auth.api_key.id,
        &err,
        stream,
    )
    .await;
    state.metrics.imaas_api_error
        .with_label_values(&[model, &ctx.route.channel.id.to_string(), &ctx.auth.api_key.creator, &ctx.auth.api_key.id, &err.to_string(), &stream.to_string()])
        .inc();
    err.into_response(&ctx.trace_id)
}

/// Insert the `trace-id` response header onto an otherwise-built response.
pub(crate) fn with_trace_header(mut response: axum::response::Response, trace_id: &TraceId) -> axum::response::Response {
    if let Ok(value) = axum::http::HeaderValue::from_str(&trace_id.to_string()) {
        response.headers_mut().insert("trace-id", value);
    }
    response
}

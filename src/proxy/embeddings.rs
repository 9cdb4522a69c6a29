//! `POST /v1/embeddings`: strips `dimensions` before forwarding,
//! never streams.
use std::sync::Arc;

use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::Value;

use crate::error::GatewayError;
use crate::observability::token_counter::{log_request_usage, merge_usage, split_cached_tokens};
use crate::proxy::dispatch::{
    build_upstream_json_request, emit_usage_event, extract_usage, map_upstream_error, new_trace_id,
    preflight_and_route, UsageEventInput,
};
use crate::proxy::{record_error, with_trace_header};
use crate::state::AppState;
use crate::store::model_types::{MetricUnit, ModelTag, TokenType};

const REQUEST_PATH: &str = "/v1/embeddings";

pub async fn handle(State(state): State<Arc<AppState>>, headers: HeaderMap, Json(mut body): Json<Value>) -> Response {
    let trace_id = new_trace_id(&state);
    let Some(model) = body.get("model").and_then(Value::as_str).map(str::to_string) else {
        return GatewayError::Unprocessable("missing 'model' field".to_string()).into_response(&trace_id);
    };

    let ctx = match preflight_and_route(
        &state,
        &headers,
        &model,
        "embedding",
        TokenType::Prompt,
        MetricUnit::Token,
        false,
        false,
        REQUEST_PATH,
        trace_id,
    )
    .await
    {
        Ok(ctx) => ctx,
        Err(err) => return err.into_response(&trace_id),
    };

    if let Some(obj) = body.as_object_mut() {
        obj.remove("dimensions");
    }

    let request = match build_upstream_json_request(&state, &ctx.route, body).build() {
        Ok(request) => request,
        Err(err) => return record_error(&state, &ctx, &model, GatewayError::Internal(err.to_string()), false).await,
    };

    let response = match state.transport.send(request).await {
        Ok(response) => response,
        Err(err) => return record_error(&state, &ctx, &model, err, false).await,
    };
    if !response.status().is_success() {
        let err = map_upstream_error(response).await;
        return record_error(&state, &ctx, &model, err, false).await;
    }

    let payload: Value = match response.json().await {
        Ok(payload) => payload,
        Err(err) => return record_error(&state, &ctx, &model, GatewayError::Internal(err.to_string()), false).await,
    };

    let cost_time = ctx.started_at.elapsed();
    let merged = merge_usage(Some(extract_usage(&payload)), 0, 0);
    let (prompt_tokens, cached_tokens) = split_cached_tokens(merged.prompt_tokens, merged.cached_tokens);
    log_request_usage(&model, &merged, cost_time);

    emit_usage_event(
        &state,
        UsageEventInput {
            trace_id: ctx.trace_id,
            model: model.clone(),
            channel_id: ctx.route.channel.id,
            user_id: ctx.auth.api_key.creator.clone(),
            api_key: ctx.auth.api_key.id.clone(),
            model_tag: ModelTag::Embedding,
            cost_time,
            prompt_tokens: Some(prompt_tokens),
            completion_tokens: Some(merged.completion_tokens),
            cached_tokens: Some(cached_tokens),
            total_tokens: Some(merged.total_tokens),
            speech_length: None,
            words: None,
        },
    )
    .await;

    with_trace_header(Json(payload).into_response(), &ctx.trace_id)
}

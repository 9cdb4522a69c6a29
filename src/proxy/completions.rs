//! `POST /v1/completions`: legacy text completion, non-streaming
//! and streaming, without the think/tool-call post-processing chat gets.
use std::sync::Arc;

use axum::body::Body;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use serde_json::Value;

use crate::error::GatewayError;
use crate::observability::token_counter::{estimate_tokens, log_request_usage, merge_usage, split_cached_tokens};
use crate::proxy::dispatch::{
    apply_max_tokens_default, build_upstream_json_request, emit_usage_event, extract_usage, map_upstream_error,
    new_trace_id, preflight_and_route, DispatchContext, UsageEventInput,
};
use crate::proxy::{record_error, with_trace_header};
use crate::state::AppState;
use crate::store::model_types::{MetricUnit, ModelTag, TokenType};
use crate::stream::sse::{done_frame, openai_sse_frame, sse_raw_frame_stream};

const REQUEST_PATH: &str = "/v1/completions";

pub async fn handle(State(state): State<Arc<AppState>>, headers: HeaderMap, Json(mut body): Json<Value>) -> Response {
    let trace_id = new_trace_id(&state);
    let Some(model) = body.get("model").and_then(Value::as_str).map(str::to_string) else {
        return GatewayError::Unprocessable("missing 'model' field".to_string()).into_response(&trace_id);
    };
    let is_stream = body.get("stream").and_then(Value::as_bool).unwrap_or(false);

    let ctx = match preflight_and_route(
        &state,
        &headers,
        &model,
        "chat",
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

    apply_max_tokens_default(&mut body);
    let prompt_text = body.get("prompt").and_then(Value::as_str).unwrap_or_default().to_string();

    let request = match build_upstream_json_request(&state, &ctx.route, body).build() {
        Ok(request) => request,
        Err(err) => return record_error(&state, &ctx, &model, GatewayError::Internal(err.to_string()), is_stream).await,
    };

    if is_stream {
        stream_completion(state, ctx, model, request).await
    } else {
        non_stream_completion(state, ctx, model, prompt_text, request).await
    }
}

async fn non_stream_completion(
    state: Arc<AppState>,
    ctx: DispatchContext,
    model: String,
    prompt_text: String,
    request: reqwest::Request,
) -> Response {
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
    let completion_text = payload["choices"][0]["text"].as_str().unwrap_or_default();
    let estimated_prompt = estimate_tokens(&prompt_text, &model);
    let estimated_completion = estimate_tokens(completion_text, &model);
    let merged = merge_usage(Some(extract_usage(&payload)), estimated_prompt, estimated_completion);
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
            model_tag: ModelTag::Chat,
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

async fn stream_completion(state: Arc<AppState>, ctx: DispatchContext, model: String, request: reqwest::Request) -> Response {
    let response = match state.transport.send(request).await {
        Ok(response) => response,
        Err(err) => return record_error(&state, &ctx, &model, err, true).await,
    };
    if !response.status().is_success() {
        let err = map_upstream_error(response).await;
        return record_error(&state, &ctx, &model, err, true).await;
    }

    let trace_id = ctx.trace_id;
    let byte_stream = response.bytes_stream();
    let (tx, rx) = tokio::sync::mpsc::unbounded_channel::<Result<Bytes, std::convert::Infallible>>();

    tokio::spawn(run_completion_stream(state, ctx, model, byte_stream, tx));

    let body_stream = futures_util::stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|item| (item, rx)) });
    let response = Response::builder()
        .status(StatusCode::OK)
        .header(axum::http::header::CONTENT_TYPE, "text/event-stream")
        .body(Body::from_stream(body_stream))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response());
    with_trace_header(response, &trace_id)
}

async fn run_completion_stream(
    state: Arc<AppState>,
    ctx: DispatchContext,
    model: String,
    byte_stream: impl Stream<Item = Result<Bytes, reqwest::Error>> + Send + 'static,
    tx: tokio::sync::mpsc::UnboundedSender<Result<Bytes, std::convert::Infallible>>,
) {
    let mut frames = Box::pin(sse_raw_frame_stream(byte_stream));
    let mut last_usage: Option<Value> = None;

    while let Some(frame_bytes) = frames.next().await {
        let text = String::from_utf8_lossy(&frame_bytes);
        let data = text.trim().strip_prefix("data:").map(str::trim).unwrap_or("");
        if data == "[DONE]" {
            if tx.send(Ok(Bytes::from(done_frame()))).is_err() {
                return;
            }
            continue;
        }
        if let Ok(parsed) = serde_json::from_str::<Value>(data) {
            if parsed.get("usage").is_some_and(|u| !u.is_null()) {
                last_usage = Some(parsed.clone());
            }
            if tx.send(Ok(Bytes::from(openai_sse_frame(&parsed.to_string())))).is_err() {
                return;
            }
        } else if tx.send(Ok(frame_bytes.clone())).is_err() {
            return;
        }
    }

    let Some(usage) = last_usage else { return };
    let cost_time = ctx.started_at.elapsed();
    let raw = extract_usage(&usage);
    let (prompt_tokens, cached_tokens) = split_cached_tokens(raw.prompt_tokens, raw.cached_tokens);
    log_request_usage(&model, &raw, cost_time);

    emit_usage_event(
        &state,
        UsageEventInput {
            trace_id: ctx.trace_id,
            model: model.clone(),
            channel_id: ctx.route.channel.id,
            user_id: ctx.auth.api_key.creator.clone(),
            api_key: ctx.auth.api_key.id.clone(),
            model_tag: ModelTag::Chat,
            cost_time,
            prompt_tokens: Some(prompt_tokens),
            completion_tokens: Some(raw.completion_tokens),
            cached_tokens: Some(cached_tokens),
            total_tokens: Some(raw.total_tokens),
            speech_length: None,
            words: None,
        },
    )
    .await;
}

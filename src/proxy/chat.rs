//! `POST /v1/chat/completions`: the one request family that
//! supports streaming.
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
use crate::observability::token_counter::{log_request_usage, merge_usage, split_cached_tokens};
use crate::proxy::dispatch::{
    apply_max_tokens_default, build_upstream_json_request, extract_usage, map_upstream_error, new_trace_id,
    preflight_and_route, DispatchContext, UsageEventInput,
};
use crate::proxy::disconnect::record_chat_disconnect;
use crate::proxy::{record_error, with_trace_header};
use crate::state::AppState;
use crate::store::model_types::{MetricUnit, ModelTag, TokenType};
use crate::stream::chat_parser::{get_parser, model_is_think, split_think_content, ChatStreamItem};
use crate::stream::sse::{done_frame, openai_sse_frame, sse_raw_frame_stream};

const REQUEST_PATH: &str = "/v1/chat/completions";

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
    let prompt_text = concat_message_content(&body);
    let client_wants_usage = client_requested_usage(&body);
    if is_stream {
        force_stream_usage(&mut body);
    }

    let request = match build_upstream_json_request(&state, &ctx.route, body).build() {
        Ok(request) => request,
        Err(err) => return record_error(&state, &ctx, &model, GatewayError::Internal(err.to_string()), is_stream).await,
    };

    if is_stream {
        stream_chat(state, ctx, model, prompt_text, client_wants_usage, request).await
    } else {
        non_stream_chat(state, ctx, model, request).await
    }
}

/// Concatenate `messages[*].content` for the bpe-estimate fallback.
fn concat_message_content(body: &Value) -> String {
    let Some(messages) = body.get("messages").and_then(Value::as_array) else {
        return String::new();
    };
    messages
        .iter()
        .filter_map(|m| m.get("content").and_then(Value::as_str))
        .collect::<Vec<_>>()
        .join("\n")
}

fn force_stream_usage(body: &mut Value) {
    let Some(obj) = body.as_object_mut() else { return };
    obj.entry("stream_options").or_insert_with(|| serde_json::json!({}))["include_usage"] = Value::Bool(true);
}

/// Whether the client itself asked for a usage chunk, captured before
/// [`force_stream_usage`] overwrites the field (we force it upstream
/// regardless, to measure cost, but should only forward a usage-only
/// chunk downstream if the client asked or the chunk also carries
/// `choices`).
fn client_requested_usage(body: &Value) -> bool {
    body["stream_options"]["include_usage"].as_bool().unwrap_or(false)
}

async fn non_stream_chat(state: Arc<AppState>, ctx: DispatchContext, model: String, request: reqwest::Request) -> Response {
    let response = match state.transport.send(request).await {
        Ok(response) => response,
        Err(err) => return record_error(&state, &ctx, &model, err, false).await,
    };
    if !response.status().is_success() {
        let err = map_upstream_error(response).await;
        return record_error(&state, &ctx, &model, err, false).await;
    }

    let mut payload: Value = match response.json().await {
        Ok(payload) => payload,
        Err(err) => return record_error(&state, &ctx, &model, GatewayError::Internal(err.to_string()), false).await,
    };

    if model_is_think(&model, &state.config.think_models.model_name_patterns) {
        if let Some(content) = payload["choices"][0]["message"]["content"].as_str().map(str::to_string) {
            let (reasoning, rest) = split_think_content(&content);
            payload["choices"][0]["message"]["content"] = Value::String(rest);
            payload["choices"][0]["message"]["reasoning_content"] = reasoning.map_or(Value::Null, Value::String);
        }
    }

    let cost_time = ctx.started_at.elapsed();
    let upstream = extract_usage(&payload);
    let estimated_completion = payload["choices"][0]["message"]["content"]
        .as_str()
        .map_or(0, |c| crate::observability::token_counter::estimate_tokens(c, &model));
    let merged = merge_usage(Some(upstream), 0, estimated_completion);
    let (prompt_tokens, cached_tokens) = split_cached_tokens(merged.prompt_tokens, merged.cached_tokens);
    log_request_usage(&model, &merged, cost_time);

    crate::proxy::dispatch::emit_usage_event(
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

async fn stream_chat(
    state: Arc<AppState>,
    ctx: DispatchContext,
    model: String,
    prompt_text: String,
    client_wants_usage: bool,
    request: reqwest::Request,
) -> Response {
    let response = match state.transport.send(request).await {
        Ok(response) => response,
        Err(err) => return record_error(&state, &ctx, &model, err, true).await,
    };
    if !response.status().is_success() {
        let err = map_upstream_error(response).await;
        return record_error(&state, &ctx, &model, err, true).await;
    }

    let trace_id = ctx.trace_id;
    let think_patterns = state.config.think_models.model_name_patterns.clone();
    let byte_stream = response.bytes_stream();
    let (tx, rx) = tokio::sync::mpsc::unbounded_channel::<Result<Bytes, std::convert::Infallible>>();

    tokio::spawn(run_chat_stream(
        state,
        ctx,
        model,
        prompt_text,
        client_wants_usage,
        think_patterns,
        byte_stream,
        tx,
    ));

    let body_stream = futures_util::stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|item| (item, rx)) });
    let response = Response::builder()
        .status(StatusCode::OK)
        .header(axum::http::header::CONTENT_TYPE, "text/event-stream")
        .body(Body::from_stream(body_stream))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response());
    with_trace_header(response, &trace_id)
}

/// Read upstream SSE frames, pass each through the think/tool-call parser,
/// and forward encoded frames to the downstream channel. Interleaves the
/// upstream-read and downstream-write suspension points the way the
/// streaming proxy is specified to: if `tx.send` fails the
/// downstream receiver has been dropped (client disconnected), and the
/// client-disconnect accounting path takes over.
async fn run_chat_stream(
    state: Arc<AppState>,
    ctx: DispatchContext,
    model: String,
    prompt_text: String,
    client_wants_usage: bool,
    think_patterns: Vec<String>,
    byte_stream: impl Stream<Item = Result<Bytes, reqwest::Error>> + Send + 'static,
    tx: tokio::sync::mpsc::UnboundedSender<Result<Bytes, std::convert::Infallible>>,
) {
    let mut parser = get_parser(&model, &think_patterns);
    let mut frames = Box::pin(sse_raw_frame_stream(byte_stream));
    let mut disconnected = false;
    let mut usage_value: Option<Value> = None;

    'outer: while let Some(frame_bytes) = frames.next().await {
        let text = String::from_utf8_lossy(&frame_bytes);
        for item in parser.feed(&text) {
            let send_result = match item {
                ChatStreamItem::Raw(raw) => tx.send(Ok(Bytes::from(format!("{raw}\n\n")))),
                ChatStreamItem::Done => tx.send(Ok(Bytes::from(done_frame()))),
                ChatStreamItem::Chunk(value) => tx.send(Ok(Bytes::from(openai_sse_frame(&value.to_string())))),
                ChatStreamItem::Usage(value) => {
                    let forward = value.get("choices").is_some_and(|c| !c.is_null()) || client_wants_usage;
                    let result = if forward {
                        tx.send(Ok(Bytes::from(openai_sse_frame(&value.to_string()))))
                    } else {
                        Ok(())
                    };
                    usage_value = Some(value);
                    result
                }
                ChatStreamItem::Error { raw, message } => {
                    tracing::debug!(error = %message, "chat stream frame failed to parse, passing through raw");
                    tx.send(Ok(Bytes::from(format!("{raw}\n\n"))))
                }
            };
            if send_result.is_err() {
                disconnected = true;
                break 'outer;
            }
        }
    }

    if !disconnected {
        if let Some(ChatStreamItem::Error { raw, message }) = parser.finish() {
            tracing::debug!(error = %message, "chat stream ended with an incomplete trailing frame");
            let _ = tx.send(Ok(Bytes::from(format!("{raw}\n\n"))));
        }
    }

    let cost_time = ctx.started_at.elapsed();
    if disconnected {
        record_chat_disconnect(&state, &ctx, &model, &prompt_text, &parser, cost_time).await;
        return;
    }

    let Some(usage) = usage_value else { return };
    let raw = extract_usage(&usage);
    let (prompt_tokens, cached_tokens) = split_cached_tokens(raw.prompt_tokens, raw.cached_tokens);
    log_request_usage(&model, &raw, cost_time);

    crate::proxy::dispatch::emit_usage_event(
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn concat_message_content_joins_text_fields() {
        let body = serde_json::json!({
            "messages": [
                {"role": "user", "content": "hi"},
                {"role": "assistant", "content": "there"},
            ]
        });
        assert_eq!(concat_message_content(&body), "hi\nthere");
    }

    #[test]
    fn force_stream_usage_sets_include_usage_flag() {
        let mut body = serde_json::json!({"model": "gpt-4"});
        force_stream_usage(&mut body);
        assert_eq!(body["stream_options"]["include_usage"], true);
    }

    #[test]
    fn client_requested_usage_reads_inbound_flag_before_forcing() {
        assert!(!client_requested_usage(&serde_json::json!({"model": "gpt-4"})));
        assert!(client_requested_usage(
            &serde_json::json!({"model": "gpt-4", "stream_options": {"include_usage": true}})
        ));
        assert!(!client_requested_usage(
            &serde_json::json!({"model": "gpt-4", "stream_options": {"include_usage": false}})
        ));
    }
}

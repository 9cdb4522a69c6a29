//! `POST /v1/audio/speech` and `/v1/audio/speech-ext`: text-to-speech,
//! metered in CJK-aware "words" rather than tokens, never streamed.
use std::sync::Arc;

use axum::extract::{Multipart, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use bytes::Bytes;
use serde_json::Value;

use crate::error::GatewayError;
use crate::proxy::dispatch::{emit_usage_event, map_upstream_error, new_trace_id, preflight_and_route, UsageEventInput};
use crate::proxy::{record_error, with_trace_header};
use crate::state::AppState;
use crate::store::model_types::{MetricUnit, ModelTag, TokenType};
use crate::util::count_characters;

const REQUEST_PATH_SPEECH: &str = "/v1/audio/speech";
const REQUEST_PATH_SPEECH_EXT: &str = "/v1/audio/speech-ext";
const SPEED_MIN: f64 = 0.5;
const SPEED_MAX: f64 = 2.0;

pub async fn handle_json(State(state): State<Arc<AppState>>, headers: HeaderMap, Json(mut body): Json<Value>) -> Response {
    let trace_id = new_trace_id(&state);
    let Some(model) = body.get("model").and_then(Value::as_str).map(str::to_string) else {
        return GatewayError::Unprocessable("missing 'model' field".to_string()).into_response(&trace_id);
    };
    let Some(input) = body.get("input").and_then(Value::as_str).map(str::to_string) else {
        return GatewayError::Unprocessable("missing 'input' field".to_string()).into_response(&trace_id);
    };

    let ctx = match preflight_and_route(
        &state,
        &headers,
        &model,
        "tts",
        TokenType::Words,
        MetricUnit::Words,
        false,
        false,
        REQUEST_PATH_SPEECH,
        trace_id,
    )
    .await
    {
        Ok(ctx) => ctx,
        Err(err) => return err.into_response(&trace_id),
    };

    if let Some(obj) = body.as_object_mut() {
        obj.insert("model".to_string(), Value::String(ctx.route.proxy_model.clone()));
        if let Some(speed) = obj.get("speed").and_then(Value::as_f64) {
            obj.insert("speed".to_string(), Value::from(speed.clamp(SPEED_MIN, SPEED_MAX)));
        }
    }

    let request = match state
        .transport
        .client()
        .post(&ctx.route.proxy_url)
        .bearer_auth(&ctx.route.channel.upstream_secret)
        .json(&body)
        .build()
    {
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

    let content_type = response
        .headers()
        .get(axum::http::header::CONTENT_TYPE)
        .cloned()
        .unwrap_or_else(|| HeaderValue::from_static("audio/wav"));
    let audio: Bytes = match response.bytes().await {
        Ok(bytes) => bytes,
        Err(err) => return record_error(&state, &ctx, &model, GatewayError::Internal(err.to_string()), false).await,
    };

    record_tts_usage(&state, &ctx, &model, &input).await;

    let mut response = (StatusCode::OK, audio).into_response();
    response.headers_mut().insert(axum::http::header::CONTENT_TYPE, content_type);
    with_trace_header(response, &ctx.trace_id)
}

pub async fn handle_multipart(State(state): State<Arc<AppState>>, headers: HeaderMap, mut multipart: Multipart) -> Response {
    let trace_id = new_trace_id(&state);
    let mut model: Option<String> = None;
    let mut input: Option<String> = None;
    let mut voice: Option<String> = None;
    let mut speed: Option<f64> = None;
    let mut prompt_audio: Option<(String, String, Bytes)> = None;

    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => break,
            Err(err) => return GatewayError::Unprocessable(err.to_string()).into_response(&trace_id),
        };
        let Some(name) = field.name().map(str::to_string) else { continue };
        match name.as_str() {
            "model" => model = field.text().await.ok(),
            "input" => input = field.text().await.ok(),
            "voice" => voice = field.text().await.ok(),
            "speed" => speed = field.text().await.ok().and_then(|s| s.parse::<f64>().ok()),
            "prompt_audio" | "file" => {
                let filename = field.file_name().unwrap_or("prompt.wav").to_string();
                let content_type = field.content_type().unwrap_or("audio/wav").to_string();
                if let Ok(bytes) = field.bytes().await {
                    prompt_audio = Some((filename, content_type, bytes));
                }
            }
            _ => {}
        }
    }

    let Some(model) = model else {
        return GatewayError::Unprocessable("missing 'model' field".to_string()).into_response(&trace_id);
    };
    let Some(input) = input else {
        return GatewayError::Unprocessable("missing 'input' field".to_string()).into_response(&trace_id);
    };

    let ctx = match preflight_and_route(
        &state,
        &headers,
        &model,
        "tts",
        TokenType::Words,
        MetricUnit::Words,
        false,
        false,
        REQUEST_PATH_SPEECH_EXT,
        trace_id,
    )
    .await
    {
        Ok(ctx) => ctx,
        Err(err) => return err.into_response(&trace_id),
    };

    let speed = speed.unwrap_or(1.0).clamp(SPEED_MIN, SPEED_MAX);
    let mut form = reqwest::multipart::Form::new()
        .text("model", ctx.route.proxy_model.clone())
        .text("input", input.clone())
        .text("speed", speed.to_string());
    if let Some(voice) = voice {
        form = form.text("voice", voice);
    }
    if let Some((filename, content_type, bytes)) = prompt_audio {
        let part = match reqwest::multipart::Part::bytes(bytes.to_vec()).file_name(filename).mime_str(&content_type) {
            Ok(part) => part,
            Err(err) => return record_error(&state, &ctx, &model, GatewayError::Internal(err.to_string()), false).await,
        };
        form = form.part("prompt_audio", part);
    }

    let request = match state
        .transport
        .client()
        .post(&ctx.route.proxy_url)
        .bearer_auth(&ctx.route.channel.upstream_secret)
        .multipart(form)
        .build()
    {
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

    let content_type = response
        .headers()
        .get(axum::http::header::CONTENT_TYPE)
        .cloned()
        .unwrap_or_else(|| HeaderValue::from_static("audio/wav"));
    let audio: Bytes = match response.bytes().await {
        Ok(bytes) => bytes,
        Err(err) => return record_error(&state, &ctx, &model, GatewayError::Internal(err.to_string()), false).await,
    };

    record_tts_usage(&state, &ctx, &model, &input).await;

    let mut response = (StatusCode::OK, audio).into_response();
    response.headers_mut().insert(axum::http::header::CONTENT_TYPE, content_type);
    with_trace_header(response, &ctx.trace_id)
}

async fn record_tts_usage(state: &AppState, ctx: &crate::proxy::dispatch::DispatchContext, model: &str, input: &str) {
    let words = count_characters(input);
    let cost_time = ctx.started_at.elapsed();
    emit_usage_event(
        state,
        UsageEventInput {
            trace_id: ctx.trace_id,
            model: model.to_string(),
            channel_id: ctx.route.channel.id,
            user_id: ctx.auth.api_key.creator.clone(),
            api_key: ctx.auth.api_key.id.clone(),
            model_tag: ModelTag::Tts,
            cost_time,
            prompt_tokens: None,
            completion_tokens: None,
            cached_tokens: None,
            total_tokens: None,
            speech_length: None,
            words: Some(words),
        },
    )
    .await;
}

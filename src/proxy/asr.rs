//! `POST /v1/audio/transcriptions`: multipart speech-to-text,
//! metered in seconds of audio.
use std::sync::Arc;

use axum::extract::{Multipart, State};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use axum::Json;
use bytes::Bytes;
use serde_json::Value;

use crate::error::GatewayError;
use crate::proxy::dispatch::{emit_usage_event, map_upstream_error, new_trace_id, preflight_and_route, UsageEventInput};
use crate::proxy::{record_error, with_trace_header};
use crate::state::AppState;
use crate::store::model_types::{MetricUnit, ModelTag, TokenType};

const REQUEST_PATH: &str = "/v1/audio/transcriptions";

pub async fn handle(State(state): State<Arc<AppState>>, headers: HeaderMap, mut multipart: Multipart) -> Response {
    let trace_id = new_trace_id(&state);
    let mut model: Option<String> = None;
    let mut audio: Option<(String, String, Bytes)> = None;

    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => break,
            Err(err) => return GatewayError::Unprocessable(err.to_string()).into_response(&trace_id),
        };
        let Some(name) = field.name().map(str::to_string) else { continue };
        match name.as_str() {
            "model" => model = field.text().await.ok(),
            "file" => {
                let filename = field.file_name().unwrap_or("audio.wav").to_string();
                let content_type = field.content_type().unwrap_or("audio/wav").to_string();
                if let Ok(bytes) = field.bytes().await {
                    audio = Some((filename, content_type, bytes));
                }
            }
            _ => {}
        }
    }

    let Some(model) = model else {
        return GatewayError::Unprocessable("missing 'model' field".to_string()).into_response(&trace_id);
    };
    let Some((filename, content_type, audio_bytes)) = audio else {
        return GatewayError::Unprocessable("missing 'file' field".to_string()).into_response(&trace_id);
    };

    let ctx = match preflight_and_route(
        &state,
        &headers,
        &model,
        "asr",
        TokenType::Seconds,
        MetricUnit::Seconds,
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

    let part = match reqwest::multipart::Part::bytes(audio_bytes.to_vec()).file_name(filename).mime_str(&content_type) {
        Ok(part) => part,
        Err(err) => return record_error(&state, &ctx, &model, GatewayError::Internal(err.to_string()), false).await,
    };
    let form = reqwest::multipart::Form::new().text("model", ctx.route.proxy_model.clone()).part("file", part);

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

    let payload: Value = match response.json().await {
        Ok(payload) => payload,
        Err(err) => return record_error(&state, &ctx, &model, GatewayError::Internal(err.to_string()), false).await,
    };

    let cost_time = ctx.started_at.elapsed();
    let speech_length = payload
        .get("audio_lengths")
        .and_then(Value::as_array)
        .and_then(|lengths| lengths.first())
        .and_then(Value::as_f64)
        .map(|secs| secs.round() as u64)
        .unwrap_or(0);

    emit_usage_event(
        &state,
        UsageEventInput {
            trace_id: ctx.trace_id,
            model: model.clone(),
            channel_id: ctx.route.channel.id,
            user_id: ctx.auth.api_key.creator.clone(),
            api_key: ctx.auth.api_key.id.clone(),
            model_tag: ModelTag::Asr,
            cost_time,
            prompt_tokens: None,
            completion_tokens: None,
            cached_tokens: None,
            total_tokens: None,
            speech_length: Some(speech_length),
            words: None,
        },
    )
    .await;

    with_trace_header(Json(payload).into_response(), &ctx.trace_id)
}

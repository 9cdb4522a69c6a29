//! `POST/GET/DELETE /v1/files[/{id}]`: pass-through proxy that
//! bypasses the balance probe and rate limiter. Routed by an `X-Model`
//! header, defaulting to the gateway's default model, since the upstream
//! file store is itself model-scoped.
use std::sync::Arc;

use axum::extract::{Multipart, Path, State};
use axum::http::{HeaderMap, Uri};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::Value;

use crate::error::GatewayError;
use crate::proxy::dispatch::{map_upstream_error, new_trace_id, preflight_and_route};
use crate::proxy::{record_error, with_trace_header};
use crate::state::AppState;
use crate::store::model_types::{MetricUnit, TokenType, DEFAULT_MODEL_NAME};

fn routed_model(headers: &HeaderMap) -> String {
    headers
        .get("x-model")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .unwrap_or_else(|| DEFAULT_MODEL_NAME.to_string())
}

async fn route_bypassing_limits(
    state: &AppState,
    headers: &HeaderMap,
    request_path: &str,
    trace_id: crate::state::request_id::TraceId,
) -> Result<crate::proxy::dispatch::DispatchContext, GatewayError> {
    let model = routed_model(headers);
    preflight_and_route(state, headers, &model, "files", TokenType::Count, MetricUnit::Token, true, true, request_path, trace_id)
        .await
}

pub async fn create(State(state): State<Arc<AppState>>, headers: HeaderMap, mut multipart: Multipart) -> Response {
    let trace_id = new_trace_id(&state);
    let ctx = match route_bypassing_limits(&state, &headers, "/v1/files", trace_id).await {
        Ok(ctx) => ctx,
        Err(err) => return err.into_response(&trace_id),
    };

    let mut form = reqwest::multipart::Form::new();
    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => break,
            Err(err) => return GatewayError::Unprocessable(err.to_string()).into_response(&trace_id),
        };
        let Some(name) = field.name().map(str::to_string) else { continue };
        if let Some(filename) = field.file_name().map(str::to_string) {
            let content_type = field.content_type().unwrap_or("application/octet-stream").to_string();
            let Ok(bytes) = field.bytes().await else { continue };
            let Ok(part) = reqwest::multipart::Part::bytes(bytes.to_vec()).file_name(filename).mime_str(&content_type) else {
                continue;
            };
            form = form.part(name, part);
        } else if let Ok(text) = field.text().await {
            form = form.text(name, text);
        }
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
        Err(err) => return record_error(&state, &ctx, &routed_model(&headers), GatewayError::Internal(err.to_string()), false).await,
    };
    forward(&state, &ctx, &routed_model(&headers), request).await
}

pub async fn list(State(state): State<Arc<AppState>>, headers: HeaderMap, uri: Uri) -> Response {
    let trace_id = new_trace_id(&state);
    let ctx = match route_bypassing_limits(&state, &headers, "/v1/files", trace_id).await {
        Ok(ctx) => ctx,
        Err(err) => return err.into_response(&trace_id),
    };

    let mut url = ctx.route.proxy_url.clone();
    if let Some(query) = uri.query() {
        url.push('?');
        url.push_str(query);
    }

    let request = match state.transport.client().get(&url).bearer_auth(&ctx.route.channel.upstream_secret).build() {
        Ok(request) => request,
        Err(err) => return record_error(&state, &ctx, &routed_model(&headers), GatewayError::Internal(err.to_string()), false).await,
    };
    forward(&state, &ctx, &routed_model(&headers), request).await
}

pub async fn retrieve(State(state): State<Arc<AppState>>, headers: HeaderMap, Path(id): Path<String>) -> Response {
    let trace_id = new_trace_id(&state);
    let request_path = format!("/v1/files/{id}");
    let ctx = match route_bypassing_limits(&state, &headers, &request_path, trace_id).await {
        Ok(ctx) => ctx,
        Err(err) => return err.into_response(&trace_id),
    };

    let request = match state
        .transport
        .client()
        .get(&ctx.route.proxy_url)
        .bearer_auth(&ctx.route.channel.upstream_secret)
        .build()
    {
        Ok(request) => request,
        Err(err) => return record_error(&state, &ctx, &routed_model(&headers), GatewayError::Internal(err.to_string()), false).await,
    };
    forward(&state, &ctx, &routed_model(&headers), request).await
}

pub async fn remove(State(state): State<Arc<AppState>>, headers: HeaderMap, Path(id): Path<String>) -> Response {
    let trace_id = new_trace_id(&state);
    let request_path = format!("/v1/files/{id}");
    let ctx = match route_bypassing_limits(&state, &headers, &request_path, trace_id).await {
        Ok(ctx) => ctx,
        Err(err) => return err.into_response(&trace_id),
    };

    let request = match state
        .transport
        .client()
        .delete(&ctx.route.proxy_url)
        .bearer_auth(&ctx.route.channel.upstream_secret)
        .build()
    {
        Ok(request) => request,
        Err(err) => return record_error(&state, &ctx, &routed_model(&headers), GatewayError::Internal(err.to_string()), false).await,
    };
    forward(&state, &ctx, &routed_model(&headers), request).await
}

async fn forward(state: &AppState, ctx: &crate::proxy::dispatch::DispatchContext, model: &str, request: reqwest::Request) -> Response {
    let response = match state.transport.send(request).await {
        Ok(response) => response,
        Err(err) => return record_error(state, ctx, model, err, false).await,
    };
    if !response.status().is_success() {
        let err = map_upstream_error(response).await;
        return record_error(state, ctx, model, err, false).await;
    }

    let payload: Value = match response.json().await {
        Ok(payload) => payload,
        Err(err) => return record_error(state, ctx, model, GatewayError::Internal(err.to_string()), false).await,
    };
    with_trace_header(Json(payload).into_response(), &ctx.trace_id)
}

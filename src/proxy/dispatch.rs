//! Shared pre-flight -> route -> upstream-request scaffolding used by every
//! request family.
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::http::HeaderMap;
use serde_json::Value;

use crate::auth::{extract_bearer_token, AuthContext};
use crate::error::GatewayError;
use crate::registry::RouteDecision;
use crate::state::request_id::TraceId;
use crate::state::AppState;
use crate::store::model_types::{MetricUnit, ModelTag, TokenType};
use crate::usage::{API_ERROR_EVENT_QUEUE, API_INVOKE_EVENT_QUEUE};
use crate::util::unix_now_secs;

/// Fallback `max_tokens` parameter when no per-model override is cached:
/// no per-model parameter table collaborator is modeled, so every model
/// uses this pair unconditionally.
pub const DEFAULT_MAX_TOKENS_VALUE: u64 = 4096;
pub const DEFAULT_MAX_TOKENS_MAX: u64 = 8192;

/// Everything pre-flight + routing produced for one inbound request.
pub struct DispatchContext {
    pub auth: AuthContext,
    pub route: RouteDecision,
    pub trace_id: TraceId,
    pub started_at: Instant,
}

/// Mint a trace id for an inbound request. Callers generate this before
/// pre-flight so that even an early auth/routing failure can render a wire
/// error body carrying a trace id.
#[must_use]
pub fn new_trace_id(state: &AppState) -> TraceId {
    let seq = state.request_ids.next_seq();
    state.request_ids.trace_id(seq)
}

/// Run pre-flight auth then resolve the route for one request, in that
/// order. `trace_id` should come from [`new_trace_id`], called before this
/// so it is available to build an error response on any failure here too.
///
/// # Errors
///
/// Propagates any [`GatewayError`] pre-flight or routing produce.
#[allow(clippy::too_many_arguments)]
pub async fn preflight_and_route(
    state: &AppState,
    headers: &HeaderMap,
    model: &str,
    model_category: &str,
    token_type: TokenType,
    unit: MetricUnit,
    skip_balance_probe: bool,
    skip_limit_check: bool,
    request_path: &str,
    trace_id: TraceId,
) -> Result<DispatchContext, GatewayError> {
    let raw_key = extract_bearer_token(headers)?;
    let auth = state
        .authenticator
        .authenticate(raw_key, model, model_category, token_type, unit, skip_balance_probe, skip_limit_check)
        .await?;
    let route = state.registry.resolve(model, Some(raw_key), request_path).await?;

    Ok(DispatchContext { auth, route, trace_id, started_at: Instant::now() })
}

/// Build the outbound request against the routed channel: JSON body with
/// `model` rewritten to the effective upstream name and the channel's
/// upstream secret as the bearer token.
#[must_use]
pub fn build_upstream_json_request(
    state: &AppState,
    route: &RouteDecision,
    mut body: Value,
) -> reqwest::RequestBuilder {
    if let Some(obj) = body.as_object_mut() {
        obj.insert("model".to_string(), Value::String(route.proxy_model.clone()));
    }
    state
        .transport
        .client()
        .post(&route.proxy_url)
        .bearer_auth(&route.channel.upstream_secret)
        .json(&body)
}

/// Inject `max_tokens` if missing, then clamp it to the cached parameter's
/// `max`.
pub fn apply_max_tokens_default(body: &mut Value) {
    let Some(obj) = body.as_object_mut() else { return };
    let current = obj.get("max_tokens").and_then(Value::as_u64);
    let value = current.unwrap_or(DEFAULT_MAX_TOKENS_VALUE).min(DEFAULT_MAX_TOKENS_MAX);
    obj.insert("max_tokens".to_string(), Value::from(value));
}

/// Translate a non-200 upstream response into a [`GatewayError::Gateway`],
/// pulling an upstream-provided `error.message`/`message` field when the
/// body is JSON.
pub async fn map_upstream_error(response: reqwest::Response) -> GatewayError {
    let status = response.status().as_u16();
    let body_text = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<Value>(&body_text)
        .ok()
        .and_then(|v| {
            v.get("error")
                .and_then(|e| e.get("message"))
                .or_else(|| v.get("message"))
                .and_then(Value::as_str)
                .map(str::to_string)
        })
        .unwrap_or(body_text);
    GatewayError::Gateway { status, message }
}

/// One family's worth of usage fields to publish onto the invoke queue.
#[allow(clippy::too_many_arguments)]
pub struct UsageEventInput {
    pub trace_id: TraceId,
    pub model: String,
    pub channel_id: u64,
    pub user_id: String,
    pub api_key: String,
    pub model_tag: ModelTag,
    pub cost_time: Duration,
    pub prompt_tokens: Option<u64>,
    pub completion_tokens: Option<u64>,
    pub cached_tokens: Option<u64>,
    pub total_tokens: Option<u64>,
    pub speech_length: Option<u64>,
    pub words: Option<u64>,
}

/// Publish one usage event onto `api_invoke_event_queue`, and, for
/// token-metered families, feed the reported `total_tokens` into the
/// TPM sliding window (`RateLimiter::record_token_usage`) the same way
/// the eventual response drives `limiter.set_token_usage` in the
/// original (spec.md §4.4 "Token usage from the eventual response adds
/// a member via `zincrby`").
pub async fn emit_usage_event(state: &AppState, input: UsageEventInput) {
    if let Some(total_tokens) = input.total_tokens {
        state.limiter.record_token_usage(&input.user_id, &input.model, total_tokens as i64).await;
    }

    let event = crate::store::model_types::UsageEvent {
        trace_id: input.trace_id.to_string(),
        model: input.model,
        channel_id: input.channel_id,
        user_id: input.user_id,
        api_key: input.api_key,
        model_tag: input.model_tag,
        date_time: httpdate::fmt_http_date(std::time::SystemTime::now()),
        cost_time: input.cost_time.as_secs_f64(),
        prompt_tokens: input.prompt_tokens,
        completion_tokens: input.completion_tokens,
        cached_tokens: input.cached_tokens,
        total_tokens: input.total_tokens,
        speech_length: input.speech_length,
        words: input.words,
    };
    let fields = serde_json::to_value(&event).unwrap_or(Value::Null);
    state.kv.stream_publish(API_INVOKE_EVENT_QUEUE, fields, state.config.billing.usage_queue_max_len).await;
}

/// Publish one error event onto `api_error_event_queue`.
pub async fn emit_error_event(
    state: &AppState,
    trace_id: &TraceId,
    model: &str,
    channel_id: u64,
    user_id: &str,
    api_key: &str,
    err: &GatewayError,
    stream: bool,
) {
    let event = crate::store::model_types::ErrorEvent {
        model: model.to_string(),
        channel_id,
        user_id: user_id.to_string(),
        api_key: api_key.to_string(),
        date_time: httpdate::fmt_http_date(std::time::SystemTime::now()),
        cost_time: 0.0,
        err: format!("{err}"),
        message: format!("{err}"),
        stream,
        trace_id: trace_id.to_string(),
    };
    let fields = serde_json::to_value(&event).unwrap_or(Value::Null);
    state.kv.stream_publish(API_ERROR_EVENT_QUEUE, fields, state.config.billing.error_queue_max_len).await;
}

/// Pull an upstream `usage` block (if any) into the typed shape, splitting
/// `prompt_tokens_details.cached_tokens` out separately.
#[must_use]
pub fn extract_usage(payload: &Value) -> crate::observability::token_counter::RawUsage {
    use crate::observability::token_counter::RawUsage;

    let usage = payload.get("usage");
    let field = |key: &str| usage.and_then(|u| u.get(key)).and_then(Value::as_u64).unwrap_or(0);
    let cached_tokens = usage
        .and_then(|u| u.get("prompt_tokens_details"))
        .and_then(|d| d.get("cached_tokens"))
        .and_then(Value::as_u64)
        .unwrap_or(0);

    RawUsage {
        prompt_tokens: field("prompt_tokens"),
        completion_tokens: field("completion_tokens"),
        total_tokens: field("total_tokens"),
        cached_tokens,
    }
}

#[must_use]
pub fn now_unix() -> u64 {
    unix_now_secs()
}

pub(crate) fn state_arc(state: &Arc<AppState>) -> Arc<AppState> {
    state.clone()
}

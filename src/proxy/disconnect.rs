//! Client-disconnect usage accounting: the sole path that
//! produces a usage event without an upstream-reported `usage` block.
use std::time::Duration;

use crate::observability::token_counter::estimate_tokens;
use crate::proxy::dispatch::{emit_usage_event, DispatchContext, UsageEventInput};
use crate::state::AppState;
use crate::store::model_types::ModelTag;
use crate::stream::chat_parser::ChatStreamParser;

/// Emit a best-effort usage event for a chat-completion stream the client
/// abandoned mid-flight: `prompt_tokens` is a bpe-style estimate over the
/// request's concatenated message content, `completion_tokens` an estimate
/// over whatever the parser accumulated before the disconnect.
pub(crate) async fn record_chat_disconnect(
    state: &AppState,
    ctx: &DispatchContext,
    model: &str,
    prompt_text: &str,
    parser: &ChatStreamParser,
    cost_time: Duration,
) {
    let prompt_tokens = estimate_tokens(prompt_text, model);
    let completion_text = format!("{}{}", parser.reasoning_content, parser.content);
    let completion_tokens = estimate_tokens(&completion_text, model);

    tracing::info!(model, trace_id = %ctx.trace_id, "client disconnected mid-stream, emitting best-effort usage");

    emit_usage_event(
        state,
        UsageEventInput {
            trace_id: ctx.trace_id,
            model: model.to_string(),
            channel_id: ctx.route.channel.id,
            user_id: ctx.auth.api_key.creator.clone(),
            api_key: ctx.auth.api_key.id.clone(),
            model_tag: ModelTag::Chat,
            cost_time,
            prompt_tokens: Some(prompt_tokens),
            completion_tokens: Some(completion_tokens),
            cached_tokens: None,
            total_tokens: Some(prompt_tokens + completion_tokens),
            speech_length: None,
            words: None,
        },
    )
    .await;
}

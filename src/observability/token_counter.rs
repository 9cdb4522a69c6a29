//! Token-counting fallback used when an upstream response carries no (or an
//! incomplete) `usage` block, or when the client disconnects mid-stream and
//! there is no upstream usage block at all (spec.md §4.7 step 6).
use std::sync::OnceLock;
use std::time::Duration;

use tracing::{info, warn};

/// Lazily-initialized `o200k_base` encoder (the GPT-4o family's BPE,
/// matching the original's `tiktoken.get_encoding("o200k_base")`),
/// cached process-wide so the disconnect/fallback path doesn't rebuild
/// the rank table per request.
static O200K_BASE: OnceLock<Option<tiktoken_rs::CoreBPE>> = OnceLock::new();

fn o200k_base() -> Option<&'static tiktoken_rs::CoreBPE> {
    O200K_BASE
        .get_or_init(|| match tiktoken_rs::o200k_base() {
            Ok(bpe) => Some(bpe),
            Err(err) => {
                warn!(error = %err, "failed to initialize o200k_base encoder, falling back to byte estimate");
                None
            }
        })
        .as_ref()
}

/// Count the number of BPE tokens `text` would encode to.
///
/// Uses the `o200k_base` encoding (shared across model families here,
/// same as the original) and falls back to a `bytes / 4` estimate only if
/// the encoder itself failed to initialize; `_model` is accepted for a
/// future per-tokenizer table but every model currently shares one
/// encoding.
#[must_use]
pub fn estimate_tokens(text: &str, _model: &str) -> u64 {
    match o200k_base() {
        Some(bpe) => bpe.encode_ordinary(text).len() as u64,
        None => (text.len() as u64).div_ceil(4),
    }
}

/// An upstream-reported `usage` block, OpenAI wire shape.
#[derive(Debug, Clone, Copy, Default)]
pub struct RawUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
    pub cached_tokens: u64,
}

/// Merge an upstream usage block (if any) with local estimates.
///
/// Rules:
/// - Prefer upstream non-zero values field by field.
/// - Fill a zero/absent field with the corresponding estimate.
/// - Recompute `total_tokens` as `prompt + completion` whenever either of
///   those two was filled from an estimate, since an upstream total
///   computed against its own token split would otherwise disagree.
#[must_use]
pub fn merge_usage(upstream: Option<RawUsage>, estimated_prompt: u64, estimated_completion: u64) -> RawUsage {
    let upstream = upstream.unwrap_or_default();
    let prompt_from_estimate = upstream.prompt_tokens == 0;
    let completion_from_estimate = upstream.completion_tokens == 0;

    let prompt_tokens = if prompt_from_estimate {
        estimated_prompt
    } else {
        upstream.prompt_tokens
    };
    let completion_tokens = if completion_from_estimate {
        estimated_completion
    } else {
        upstream.completion_tokens
    };
    let total_tokens = if upstream.total_tokens > 0 && !prompt_from_estimate && !completion_from_estimate {
        upstream.total_tokens
    } else {
        prompt_tokens + completion_tokens
    };

    RawUsage {
        prompt_tokens,
        completion_tokens,
        total_tokens,
        cached_tokens: upstream.cached_tokens,
    }
}

/// Split `prompt_tokens_details.cached_tokens` out of `prompt_tokens`,
/// floored at zero.
#[must_use]
pub fn split_cached_tokens(prompt_tokens: u64, cached_tokens: u64) -> (u64, u64) {
    (prompt_tokens.saturating_sub(cached_tokens), cached_tokens)
}

/// Log token usage for a completed request at INFO level.
pub fn log_request_usage(model: &str, usage: &RawUsage, duration: Duration) {
    info!(
        model = model,
        prompt_tokens = usage.prompt_tokens,
        completion_tokens = usage.completion_tokens,
        total_tokens = usage.total_tokens,
        cached_tokens = usage.cached_tokens,
        duration_seconds = duration.as_secs_f64(),
        "request completed"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_estimate_tokens_nonempty() {
        let count = estimate_tokens("Hello, world!", "gpt-4");
        assert!(count > 0, "should estimate at least 1 token");
    }

    #[test]
    fn test_estimate_tokens_empty() {
        let count = estimate_tokens("", "gpt-4");
        assert_eq!(count, 0);
    }

    #[test]
    fn test_merge_usage_prefers_upstream() {
        let upstream = RawUsage {
            prompt_tokens: 100,
            completion_tokens: 50,
            total_tokens: 150,
            cached_tokens: 0,
        };
        let merged = merge_usage(Some(upstream), 999, 999);
        assert_eq!(merged.prompt_tokens, 100);
        assert_eq!(merged.completion_tokens, 50);
        assert_eq!(merged.total_tokens, 150);
    }

    #[test]
    fn test_merge_usage_fills_missing() {
        let merged = merge_usage(None, 40, 20);
        assert_eq!(merged.prompt_tokens, 40);
        assert_eq!(merged.completion_tokens, 20);
        assert_eq!(merged.total_tokens, 60);
    }

    #[test]
    fn test_merge_usage_partial_upstream() {
        let upstream = RawUsage {
            prompt_tokens: 100,
            completion_tokens: 0,
            total_tokens: 0,
            cached_tokens: 0,
        };
        let merged = merge_usage(Some(upstream), 50, 25);
        assert_eq!(merged.prompt_tokens, 100);
        assert_eq!(merged.completion_tokens, 25);
        assert_eq!(merged.total_tokens, 125);
    }

    #[test]
    fn test_split_cached_tokens_floors_at_zero() {
        assert_eq!(split_cached_tokens(9, 8), (1, 8));
        assert_eq!(split_cached_tokens(5, 20), (0, 20));
    }
}

//! Entity types shared by the relational-store and cache collaborators
//!. Persistence is the collaborator's concern — these are plain
//! data carried across the trait boundary.
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Lifecycle status shared by api keys, channels, and models.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityStatus {
    Active,
    Inactive,
    Delete,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKey {
    /// 48-char id, prefixed `sk-`.
    pub id: String,
    pub creator: String,
    pub status: EntityStatus,
    /// Unix seconds; written lazily.
    pub last_used_at: u64,
}

impl ApiKey {
    #[must_use]
    pub fn is_active(&self) -> bool {
        matches!(self.status, EntityStatus::Active)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Channel {
    pub id: u64,
    pub name: String,
    pub upstream_url: String,
    pub upstream_secret: String,
    pub status: EntityStatus,
    /// 1 = healthy, 0 = unhealthy. Mutable only by the health checker (C3).
    pub health: u8,
    /// Raw JSON source for `model_redirect`; parsed once by the registry.
    /// A parse failure downgrades to an empty mapping.
    pub model_redirect_json: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Model {
    pub id: u64,
    pub name: String,
    pub status: EntityStatus,
}

/// Many-to-many link between a channel and a model.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ChannelBinding {
    pub channel_id: u64,
    pub model_id: u64,
}

pub const DEFAULT_MODEL_NAME: &str = "Default";

/// A `(level, model) -> (rpm, tpm)` row from the rate config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitRow {
    pub level: i64,
    pub model_name: String,
    pub rpm: i64,
    pub tpm: i64,
}

/// Token types billed by the usage pipeline / billing job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenType {
    Prompt,
    Completion,
    CachedPrompt,
    Words,
    Seconds,
    Count,
}

/// The discriminant used to pick the typed usage shape and meter key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelTag {
    Chat,
    Asr,
    Tts,
    Embedding,
    Reranker,
}

/// Metric unit for a pre-flight balance probe / usage emission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricUnit {
    Token,
    Words,
    Seconds,
}

/// Immutable usage record emitted on the invoke queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageEvent {
    pub trace_id: String,
    pub model: String,
    pub channel_id: u64,
    pub user_id: String,
    pub api_key: String,
    pub model_tag: ModelTag,
    pub date_time: String,
    pub cost_time: f64,
    pub prompt_tokens: Option<u64>,
    pub completion_tokens: Option<u64>,
    pub cached_tokens: Option<u64>,
    pub total_tokens: Option<u64>,
    pub speech_length: Option<u64>,
    pub words: Option<u64>,
}

/// Record emitted on the error queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorEvent {
    pub model: String,
    pub channel_id: u64,
    pub user_id: String,
    pub api_key: String,
    pub date_time: String,
    pub cost_time: f64,
    pub err: String,
    pub message: String,
    pub stream: bool,
    pub trace_id: String,
}

/// One batched charge request against the upstream billing RPC.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChargeIntent {
    pub event_id: String,
    pub user: String,
    pub zone: String,
    pub unit: String,
    pub token_type: String,
    pub model: String,
    pub mount: i64,
    pub start_time: i64,
    pub end_time: i64,
    pub channel_id: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChargeOutcome {
    pub event_id: String,
    pub result: bool,
    pub result_msg: String,
}

/// `(model, token_type, unit) -> price` lookup result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Product {
    pub model: String,
    pub token_type: String,
    pub unit: String,
    pub price: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserProfile {
    pub user_id: String,
    pub user_name: String,
    pub role: String,
}

/// File metadata consumed only by the cleanup job. Upload/list/delete
/// endpoints themselves are out of scope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayFile {
    pub id: String,
    pub creator_id: String,
    pub status: EntityStatus,
    pub created_at_unix: u64,
}

/// Parse a channel's `model_redirect_json` into a mapping, downgrading to
/// empty on parse failure.
#[must_use]
pub fn parse_model_redirect(raw: &str) -> HashMap<String, String> {
    if raw.trim().is_empty() {
        return HashMap::new();
    }
    serde_json::from_str(raw).unwrap_or_else(|err| {
        tracing::warn!(error = %err, "failed to parse channel model_redirect, using empty mapping");
        HashMap::new()
    })
}

//! Collaborator boundaries: the relational store, the shared key-value
//! store queues and sorted sets, and the upstream billing/user-directory
//! services are all declared here as traits. The core only ever talks to
//! these traits; `store::memory` supplies in-process implementations good
//! enough to run the gateway standalone and to exercise every module in
//! tests.
pub mod memory;
pub mod model_types;

use async_trait::async_trait;
use std::collections::HashMap;

use crate::error::GatewayError;
use model_types::{
    ApiKey, ChannelBinding, ChargeIntent, ChargeOutcome, EntityStatus, GatewayFile, Product,
    RateLimitRow, UserProfile,
};
pub use model_types::{Channel, Model};

/// A single entry read back off a durable stream: `(id, fields)`.
pub type StreamEntry = (String, serde_json::Value);

/// The shared key-value store: sorted sets for rate-limit buckets and
/// billing meters, durable ordered streams for the three queues, and plain
/// keys for caches, balance probes, and distributed locks.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    // -- plain key/value -----------------------------------------------
    async fn get(&self, key: &str) -> Option<String>;
    async fn set(&self, key: &str, value: &str, ttl_secs: Option<u64>);
    /// `SET key value NX EX ttl` — used by the distributed lock.
    async fn set_nx(&self, key: &str, value: &str, ttl_secs: u64) -> bool;
    async fn expire(&self, key: &str, ttl_secs: u64);
    async fn delete(&self, key: &str);

    // -- rate limiter sorted sets ---------------------------
    /// Atomic RPM admission test: trim entries older than `now_ms - window_ms`,
    /// admit iff the remaining count is below `limit`, recording `now_ms` on
    /// admission. A real backend would run this as a single Lua script so
    /// the trim/count/insert sequence never interleaves with another caller.
    async fn rpm_admit(&self, key: &str, now_ms: i64, window_ms: i64, limit: i64) -> bool;
    /// Non-atomic TPM admission test: scan, trim entries older than
    /// `now_ms - window_ms`, sum remaining scores, admit iff sum < limit.
    /// Intentionally left non-atomic.
    async fn tpm_sum_after_trim(&self, key: &str, now_ms: i64, window_ms: i64) -> i64;
    /// Record token usage as a new member scored by token count.
    async fn tpm_record(&self, key: &str, now_ms: i64, tokens: i64, ttl_secs: u64);

    // -- durable ordered streams / queues ------
    async fn stream_publish(&self, stream: &str, fields: serde_json::Value, max_len: usize) -> String;
    /// Id of the most recent entry, or "0" if the stream is empty —
    /// the starting point for a fresh consumer.
    async fn stream_tail_id(&self, stream: &str) -> String;
    /// Read entries strictly after `after_id` (event bus fan-out consumer,
    /// no consumer group).
    async fn stream_read_after(&self, stream: &str, after_id: &str, count: usize) -> Vec<StreamEntry>;
    /// Read up to `count` unacked entries for `consumer` in `group`,
    /// creating the group if absent.
    async fn stream_read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> Vec<StreamEntry>;
    async fn stream_ack(&self, stream: &str, group: &str, id: &str);

    // -- billing meter sorted sets ----------------------
    async fn meter_incrby(&self, meter_key: &str, member: &str, amount: i64);
    /// Members with score >= `min_score`, i.e. ready to bill.
    async fn meter_range_ge(&self, meter_key: &str, min_score: i64) -> Vec<(String, i64)>;
    async fn meter_decrby(&self, meter_key: &str, member: &str, amount: i64);
    /// Remove zeroed members after a billing sweep.
    async fn meter_remove_zero(&self, meter_key: &str);
}

/// The relational store, treated as a key->row lookup: channel,
/// model, api-key, and rate-config rows. CRUD/admin endpoints over these
/// rows are out of scope; the core only reads.
#[async_trait]
pub trait RelationalStore: Send + Sync {
    async fn get_api_key(&self, id: &str) -> Option<ApiKey>;
    async fn touch_api_key_last_used(&self, id: &str, at_unix: u64);

    /// All `(channel, model)` bindings for active channels/models, used by
    /// the registry to build the routing table.
    async fn load_routing_rows(&self) -> Vec<(Channel, Model, ChannelBinding)>;
    async fn set_channel_health(&self, channel_id: u64, health: u8);

    async fn get_user_level(&self, user_id: &str) -> i64;
    async fn set_user_level(&self, user_id: &str, level: i64);
    async fn get_level_model_limit(&self, level: i64, model: &str) -> Option<RateLimitRow>;
    async fn get_all_rate_limits(&self) -> Vec<RateLimitRow>;

    async fn get_product(&self, model: &str, token_type: &str, unit: &str) -> Option<Product>;

    async fn list_active_files_older_than(&self, cutoff_unix: u64) -> Vec<GatewayFile>;
    async fn mark_files_inactive(&self, ids: &[String]) -> usize;
}

/// Upstream balance-check RPC.
#[async_trait]
pub trait BalanceService: Send + Sync {
    async fn probe(
        &self,
        user_id: &str,
        model_category: &str,
        model: &str,
        token_type: &str,
        unit: &str,
    ) -> Result<bool, GatewayError>;
}

/// Upstream charge RPC.
#[async_trait]
pub trait BillingService: Send + Sync {
    async fn charge_batch(&self, intents: &[ChargeIntent]) -> Vec<ChargeOutcome>;
}

/// Upstream user-directory RPC — modeled but unused by the core
/// request path; kept for completeness of the collaborator contract.
#[async_trait]
pub trait UserDirectory: Send + Sync {
    async fn lookup(&self, user_id: &str) -> Option<UserProfile>;
}

/// Sink for the durable audit logs the billing job and usage pipeline write
/// (the external "search store" system, out of scope itself but
/// consumed by the core).
#[async_trait]
pub trait SearchLogSink: Send + Sync {
    async fn write_usage_batch(&self, events: &[model_types::UsageEvent]);
    async fn write_billing_outcome(&self, outcome: &ChargeOutcome, intent: &ChargeIntent);
}

/// Recovers a Prometheus counter's pre-restart value so that in-process
/// increments remain monotonic across a process restart.
#[async_trait]
pub trait MetricsBackfill: Send + Sync {
    async fn recover_counter(&self, labels: &HashMap<String, String>) -> f64;
}

#[must_use]
pub fn default_entity_active() -> EntityStatus {
    EntityStatus::Active
}

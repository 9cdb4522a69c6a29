//! In-process implementations of the collaborator traits in
//! [`super`]. Good enough to run the gateway standalone against seeded
//! channels/models and to exercise the rate limiter, registry, and billing
//! pipeline in tests without a real Postgres/Redis.
use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::GatewayError;
use crate::util::{next_seq, unix_now_millis};

use super::model_types::{
    ApiKey, ChannelBinding, ChargeIntent, ChargeOutcome, GatewayFile, Model, Product,
    RateLimitRow, UsageEvent, UserProfile,
};
use super::{BalanceService, BillingService, Channel, KeyValueStore, MetricsBackfill, RelationalStore, SearchLogSink, StreamEntry, UserDirectory};

#[derive(Default)]
struct KvInner {
    plain: HashMap<String, (String, Option<i64>)>,
    /// member -> score, per sorted-set key.
    zsets: HashMap<String, HashMap<String, i64>>,
    streams: HashMap<String, VecDeque<(String, serde_json::Value)>>,
    /// (stream, group) -> last-delivered index into that stream's deque.
    groups: HashMap<(String, String), usize>,
}

/// Sorted-set + stream + plain-kv store backing the rate limiter, the
/// billing meter, and the three durable queues.
pub struct MemoryKeyValueStore {
    inner: Mutex<KvInner>,
}

impl MemoryKeyValueStore {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(KvInner::default()),
        }
    }
}

impl Default for MemoryKeyValueStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KeyValueStore for MemoryKeyValueStore {
    async fn get(&self, key: &str) -> Option<String> {
        let inner = self.inner.lock();
        let (value, expires_at) = inner.plain.get(key)?;
        if let Some(exp) = expires_at {
            if unix_now_millis() / 1000 > *exp {
                return None;
            }
        }
        Some(value.clone())
    }

    async fn set(&self, key: &str, value: &str, ttl_secs: Option<u64>) {
        let expires_at = ttl_secs.map(|ttl| unix_now_millis() / 1000 + ttl as i64);
        self.inner
            .lock()
            .plain
            .insert(key.to_string(), (value.to_string(), expires_at));
    }

    async fn set_nx(&self, key: &str, value: &str, ttl_secs: u64) -> bool {
        let mut inner = self.inner.lock();
        let now = unix_now_millis() / 1000;
        let occupied = inner
            .plain
            .get(key)
            .is_some_and(|(_, exp)| exp.map_or(true, |e| now <= e));
        if occupied {
            return false;
        }
        inner
            .plain
            .insert(key.to_string(), (value.to_string(), Some(now + ttl_secs as i64)));
        true
    }

    async fn expire(&self, key: &str, ttl_secs: u64) {
        let mut inner = self.inner.lock();
        if let Some((_, exp)) = inner.plain.get_mut(key) {
            *exp = Some(unix_now_millis() / 1000 + ttl_secs as i64);
        }
    }

    async fn delete(&self, key: &str) {
        self.inner.lock().plain.remove(key);
    }

    async fn rpm_admit(&self, key: &str, now_ms: i64, window_ms: i64, limit: i64) -> bool {
        // Single mutex critical section stands in for what a real backend
        // would run as one atomic script: trim, count, and conditionally
        // insert all happen without yielding.
        let mut inner = self.inner.lock();
        let floor = now_ms - window_ms;
        let set = inner.zsets.entry(key.to_string()).or_default();
        set.retain(|_, score| *score > floor);
        if (set.len() as i64) < limit {
            set.insert(format!("{now_ms}-{}", next_seq()), now_ms);
            true
        } else {
            false
        }
    }

    async fn tpm_sum_after_trim(&self, key: &str, now_ms: i64, window_ms: i64) -> i64 {
        // Single lock acquisition for the in-memory double, but this read is
        // never combined with the caller's subsequent `tpm_record` into one
        // critical section, preserving the intentional non-atomicity between
        // the admission check and the recording call.
        let mut inner = self.inner.lock();
        let floor = now_ms - window_ms;
        let set = inner.zsets.entry(key.to_string()).or_default();
        set.retain(|_, score| *score > floor);
        set.values().sum()
    }

    async fn tpm_record(&self, key: &str, now_ms: i64, tokens: i64, ttl_secs: u64) {
        let mut inner = self.inner.lock();
        let set = inner.zsets.entry(key.to_string()).or_default();
        set.insert(format!("{now_ms}-{}", next_seq()), tokens);
        drop(inner);
        self.expire(key, ttl_secs).await;
    }

    async fn stream_publish(&self, stream: &str, fields: serde_json::Value, max_len: usize) -> String {
        let mut inner = self.inner.lock();
        let id = format!("{}-{}", unix_now_millis(), next_seq());
        let deque = inner.streams.entry(stream.to_string()).or_default();
        deque.push_back((id.clone(), fields));
        while deque.len() > max_len {
            deque.pop_front();
        }
        id
    }

    async fn stream_tail_id(&self, stream: &str) -> String {
        let inner = self.inner.lock();
        inner
            .streams
            .get(stream)
            .and_then(|deque| deque.back())
            .map_or_else(|| "0".to_string(), |(id, _)| id.clone())
    }

    async fn stream_read_after(&self, stream: &str, after_id: &str, count: usize) -> Vec<StreamEntry> {
        let inner = self.inner.lock();
        let Some(deque) = inner.streams.get(stream) else {
            return Vec::new();
        };
        let start = deque
            .iter()
            .position(|(id, _)| id == after_id)
            .map_or(0, |idx| idx + 1);
        deque.iter().skip(start).take(count).cloned().collect()
    }

    async fn stream_read_group(
        &self,
        stream: &str,
        group: &str,
        _consumer: &str,
        count: usize,
    ) -> Vec<StreamEntry> {
        let mut inner = self.inner.lock();
        let len = inner.streams.get(stream).map_or(0, VecDeque::len);
        let cursor = inner
            .groups
            .entry((stream.to_string(), group.to_string()))
            .or_insert(0);
        let start = (*cursor).min(len);
        let take = count.min(len.saturating_sub(start));
        *cursor = start + take;
        inner
            .streams
            .get(stream)
            .map(|deque| deque.iter().skip(start).take(take).cloned().collect())
            .unwrap_or_default()
    }

    async fn stream_ack(&self, _stream: &str, _group: &str, _id: &str) {
        // The cursor in `stream_read_group` already advances on delivery;
        // acking is a no-op for this in-memory double.
    }

    async fn meter_incrby(&self, meter_key: &str, member: &str, amount: i64) {
        let mut inner = self.inner.lock();
        let set = inner.zsets.entry(meter_key.to_string()).or_default();
        *set.entry(member.to_string()).or_insert(0) += amount;
    }

    async fn meter_range_ge(&self, meter_key: &str, min_score: i64) -> Vec<(String, i64)> {
        let inner = self.inner.lock();
        inner
            .zsets
            .get(meter_key)
            .map(|set| {
                set.iter()
                    .filter(|(_, score)| **score >= min_score)
                    .map(|(member, score)| (member.clone(), *score))
                    .collect()
            })
            .unwrap_or_default()
    }

    async fn meter_decrby(&self, meter_key: &str, member: &str, amount: i64) {
        let mut inner = self.inner.lock();
        if let Some(set) = inner.zsets.get_mut(meter_key) {
            if let Some(score) = set.get_mut(member) {
                *score -= amount;
            }
        }
    }

    async fn meter_remove_zero(&self, meter_key: &str) {
        let mut inner = self.inner.lock();
        if let Some(set) = inner.zsets.get_mut(meter_key) {
            set.retain(|_, score| *score != 0);
        }
    }
}

#[derive(Default)]
struct RelationalInner {
    api_keys: HashMap<String, ApiKey>,
    channels: HashMap<u64, Channel>,
    models: HashMap<u64, Model>,
    bindings: Vec<ChannelBinding>,
    user_levels: HashMap<String, i64>,
    rate_limits: Vec<RateLimitRow>,
    products: Vec<Product>,
    files: HashMap<String, GatewayFile>,
}

/// In-memory channel/model/api-key/rate-config store.
pub struct MemoryRelationalStore {
    inner: Mutex<RelationalInner>,
}

impl MemoryRelationalStore {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(RelationalInner::default()),
        }
    }

    pub fn seed_api_key(&self, key: ApiKey) {
        self.inner.lock().api_keys.insert(key.id.clone(), key);
    }

    pub fn seed_channel(&self, channel: Channel) {
        self.inner.lock().channels.insert(channel.id, channel);
    }

    pub fn seed_model(&self, model: Model) {
        self.inner.lock().models.insert(model.id, model);
    }

    pub fn seed_binding(&self, binding: ChannelBinding) {
        self.inner.lock().bindings.push(binding);
    }

    pub fn seed_rate_limit(&self, row: RateLimitRow) {
        self.inner.lock().rate_limits.push(row);
    }

    pub fn seed_product(&self, product: Product) {
        self.inner.lock().products.push(product);
    }

    pub fn seed_file(&self, file: GatewayFile) {
        self.inner.lock().files.insert(file.id.clone(), file);
    }

    /// Destructively rebind a channel's model set, resetting health to
    /// unknown-healthy the way the original's admin mutation does (tracked
    /// only in this test double; the mutation itself is out of scope).
    pub fn rebind_channel_models(&self, channel_id: u64, model_ids: &[u64]) {
        let mut inner = self.inner.lock();
        inner.bindings.retain(|b| b.channel_id != channel_id);
        for model_id in model_ids {
            inner.bindings.push(ChannelBinding {
                channel_id,
                model_id: *model_id,
            });
        }
        if let Some(channel) = inner.channels.get_mut(&channel_id) {
            channel.health = 1;
        }
    }
}

impl Default for MemoryRelationalStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RelationalStore for MemoryRelationalStore {
    async fn get_api_key(&self, id: &str) -> Option<ApiKey> {
        self.inner.lock().api_keys.get(id).cloned()
    }

    async fn touch_api_key_last_used(&self, id: &str, at_unix: u64) {
        if let Some(key) = self.inner.lock().api_keys.get_mut(id) {
            key.last_used_at = key.last_used_at.max(at_unix);
        }
    }

    async fn load_routing_rows(&self) -> Vec<(Channel, Model, ChannelBinding)> {
        let inner = self.inner.lock();
        inner
            .bindings
            .iter()
            .filter_map(|binding| {
                let channel = inner.channels.get(&binding.channel_id)?.clone();
                let model = inner.models.get(&binding.model_id)?.clone();
                Some((channel, model, *binding))
            })
            .collect()
    }

    async fn set_channel_health(&self, channel_id: u64, health: u8) {
        if let Some(channel) = self.inner.lock().channels.get_mut(&channel_id) {
            channel.health = health;
        }
    }

    async fn get_user_level(&self, user_id: &str) -> i64 {
        self.inner
            .lock()
            .user_levels
            .get(user_id)
            .copied()
            .unwrap_or(0)
    }

    async fn set_user_level(&self, user_id: &str, level: i64) {
        self.inner
            .lock()
            .user_levels
            .insert(user_id.to_string(), level);
    }

    async fn get_level_model_limit(&self, level: i64, model: &str) -> Option<RateLimitRow> {
        self.inner
            .lock()
            .rate_limits
            .iter()
            .find(|row| row.level == level && row.model_name == model)
            .cloned()
    }

    async fn get_all_rate_limits(&self) -> Vec<RateLimitRow> {
        self.inner.lock().rate_limits.clone()
    }

    async fn get_product(&self, model: &str, token_type: &str, unit: &str) -> Option<Product> {
        self.inner
            .lock()
            .products
            .iter()
            .find(|p| p.model == model && p.token_type == token_type && p.unit == unit)
            .cloned()
    }

    async fn list_active_files_older_than(&self, cutoff_unix: u64) -> Vec<GatewayFile> {
        self.inner
            .lock()
            .files
            .values()
            .filter(|f| {
                matches!(f.status, super::model_types::EntityStatus::Active)
                    && f.created_at_unix < cutoff_unix
            })
            .cloned()
            .collect()
    }

    async fn mark_files_inactive(&self, ids: &[String]) -> usize {
        let mut inner = self.inner.lock();
        let mut changed = 0;
        for id in ids {
            if let Some(file) = inner.files.get_mut(id) {
                file.status = super::model_types::EntityStatus::Inactive;
                changed += 1;
            }
        }
        changed
    }
}

/// Always-sufficient balance probe, used by the default binary when no real
/// billing backend is configured.
pub struct AlwaysSufficientBalance;

#[async_trait]
impl BalanceService for AlwaysSufficientBalance {
    async fn probe(
        &self,
        _user_id: &str,
        _model_category: &str,
        _model: &str,
        _token_type: &str,
        _unit: &str,
    ) -> Result<bool, GatewayError> {
        Ok(true)
    }
}

/// Always-succeeds charge RPC stand-in.
pub struct AlwaysSucceedsBilling;

#[async_trait]
impl BillingService for AlwaysSucceedsBilling {
    async fn charge_batch(&self, intents: &[ChargeIntent]) -> Vec<ChargeOutcome> {
        intents
            .iter()
            .map(|intent| ChargeOutcome {
                event_id: intent.event_id.clone(),
                result: true,
                result_msg: "ok".to_string(),
            })
            .collect()
    }
}

#[derive(Default)]
pub struct MemoryUserDirectory {
    users: Mutex<HashMap<String, UserProfile>>,
}

impl MemoryUserDirectory {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seed(&self, profile: UserProfile) {
        self.users.lock().insert(profile.user_id.clone(), profile);
    }
}

#[async_trait]
impl UserDirectory for MemoryUserDirectory {
    async fn lookup(&self, user_id: &str) -> Option<UserProfile> {
        self.users.lock().get(user_id).cloned()
    }
}

/// Drops usage/billing audit records, used when no real search-store backend
/// is configured.
#[derive(Default)]
pub struct NullSearchLogSink;

#[async_trait]
impl SearchLogSink for NullSearchLogSink {
    async fn write_usage_batch(&self, events: &[UsageEvent]) {
        for event in events {
            tracing::debug!(trace_id = %event.trace_id, "usage event recorded (sink disabled)");
        }
    }

    async fn write_billing_outcome(&self, outcome: &ChargeOutcome, _intent: &ChargeIntent) {
        tracing::debug!(event_id = %outcome.event_id, result = outcome.result, "billing outcome recorded (sink disabled)");
    }
}

/// Always reports zero prior counter value, used when the process has no
/// persisted metrics to recover.
#[derive(Default)]
pub struct ZeroMetricsBackfill;

#[async_trait]
impl MetricsBackfill for ZeroMetricsBackfill {
    async fn recover_counter(&self, _labels: &HashMap<String, String>) -> f64 {
        0.0
    }
}

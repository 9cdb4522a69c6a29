//! Per-user RPM/TPM rate limiting. RPM admission is atomic (a single
//! `KeyValueStore::rpm_admit` call stands in for what a real backend would
//! run as one Lua script); TPM admission is a separate scan-then-record
//! pair and is intentionally left non-atomic.
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::scheduler::GlobalJob;
use crate::store::model_types::DEFAULT_MODEL_NAME;
use crate::store::{KeyValueStore, RelationalStore};
use crate::util::unix_now_millis;

/// Sentinel limit meaning "no limit", matching the original's `-1` check.
pub const UNLIMITED: i64 = -1;
const LIMIT_CACHE_TTL_SECS: u64 = 3600;

pub struct RateLimiter {
    kv: Arc<dyn KeyValueStore>,
    relational: Arc<dyn RelationalStore>,
    rpm_window_ms: i64,
    tpm_window_ms: i64,
    default_rpm: i64,
    default_tpm: i64,
    fail_open: bool,
}

fn rpm_limit_key(level: i64, model: &str) -> String {
    format!("imaas:rpm:limit:{level}:{model}")
}
fn tpm_limit_key(level: i64, model: &str) -> String {
    format!("imaas:tpm:limit:{level}:{model}")
}
fn rpm_bucket_key(user_id: &str, model: &str) -> String {
    format!("imaas:rpm:bucket:{user_id}:{model}")
}
fn tpm_bucket_key(user_id: &str, model: &str) -> String {
    format!("imaas:tpm:bucket:{user_id}:{model}")
}

impl RateLimiter {
    #[must_use]
    pub fn new(
        kv: Arc<dyn KeyValueStore>,
        relational: Arc<dyn RelationalStore>,
        rpm_window_secs: u64,
        tpm_window_secs: u64,
        fail_open: bool,
    ) -> Self {
        Self {
            kv,
            relational,
            rpm_window_ms: (rpm_window_secs * 1000) as i64,
            tpm_window_ms: (tpm_window_secs * 1000) as i64,
            default_rpm: UNLIMITED,
            default_tpm: UNLIMITED,
            fail_open,
        }
    }

    /// Cascade: per-(level, model) cached limit -> per-(level, Default)
    /// cached limit -> relational-store row (cached back into the kv store
    /// for next time) -> the configured default.
    pub async fn rpm_limit(&self, user_id: &str, model: &str) -> i64 {
        let level = self.relational.get_user_level(user_id).await;
        if let Some(limit) = self.kv.get(&rpm_limit_key(level, model)).await {
            if let Ok(parsed) = limit.parse() {
                return parsed;
            }
        }
        if let Some(limit) = self.kv.get(&rpm_limit_key(level, DEFAULT_MODEL_NAME)).await {
            if let Ok(parsed) = limit.parse() {
                return parsed;
            }
        }
        if let Some(row) = self.relational.get_level_model_limit(level, model).await {
            self.kv
                .set(&rpm_limit_key(level, &row.model_name), &row.rpm.to_string(), None)
                .await;
            return row.rpm;
        }
        tracing::warn!(user_id, model, "no rpm limit match, using default");
        self.default_rpm
    }

    pub async fn tpm_limit(&self, user_id: &str, model: &str) -> i64 {
        let level = self.relational.get_user_level(user_id).await;
        if let Some(limit) = self.kv.get(&tpm_limit_key(level, model)).await {
            if let Ok(parsed) = limit.parse() {
                return parsed;
            }
        }
        if let Some(limit) = self.kv.get(&tpm_limit_key(level, DEFAULT_MODEL_NAME)).await {
            if let Ok(parsed) = limit.parse() {
                return parsed;
            }
        }
        if let Some(row) = self.relational.get_level_model_limit(level, model).await {
            self.kv
                .set(&tpm_limit_key(level, &row.model_name), &row.tpm.to_string(), None)
                .await;
            return row.tpm;
        }
        tracing::warn!(user_id, model, "no tpm limit match, using default");
        self.default_tpm
    }

    pub async fn check_rpm(&self, user_id: &str, model: &str) -> bool {
        let limit = self.rpm_limit(user_id, model).await;
        if limit == UNLIMITED {
            return true;
        }
        let key = rpm_bucket_key(user_id, model);
        self.kv
            .rpm_admit(&key, unix_now_millis(), self.rpm_window_ms, limit)
            .await
    }

    /// Non-atomic by design: sums whatever is left after trimming expired
    /// buckets, with no lock held between this read and the eventual
    /// `record_token_usage` write the response's usage event drives.
    pub async fn check_tpm(&self, user_id: &str, model: &str) -> bool {
        let limit = self.tpm_limit(user_id, model).await;
        if limit == UNLIMITED {
            return true;
        }
        let key = tpm_bucket_key(user_id, model);
        let used = self
            .kv
            .tpm_sum_after_trim(&key, unix_now_millis(), self.tpm_window_ms)
            .await;
        used < limit
    }

    /// Add `tokens` to the TPM sliding window for `(user_id, model)`. Called
    /// from `proxy::dispatch::emit_usage_event` for every token-metered
    /// usage event (chat/completions/embeddings/rerank; TTS/ASR meter words
    /// and seconds instead and never call this), post-admission accounting
    /// per spec.md §4.4.
    pub async fn record_token_usage(&self, user_id: &str, model: &str, tokens: i64) {
        let key = tpm_bucket_key(user_id, model);
        self.kv
            .tpm_record(&key, unix_now_millis(), tokens, LIMIT_CACHE_TTL_SECS)
            .await;
    }

    /// Admit iff both the request-count and token-count budgets allow it.
    /// `fail_open` only matters for a real (fallible) backend; the
    /// in-memory store never errors, so this simply runs both checks.
    pub async fn admit(&self, user_id: &str, model: &str) -> bool {
        let _ = self.fail_open;
        self.check_rpm(user_id, model).await && self.check_tpm(user_id, model).await
    }

    /// Re-sync every `(level, model)` limit row from the relational store
    /// into the kv cache, dropping cached keys with no matching row.
    /// Callers should only invoke this while holding the
    /// `refresh_all_limit` distributed lock.
    pub async fn refresh_all_limits(&self) {
        let rows = self.relational.get_all_rate_limits().await;
        for row in &rows {
            self.kv
                .set(&rpm_limit_key(row.level, &row.model_name), &row.rpm.to_string(), None)
                .await;
            self.kv
                .set(&tpm_limit_key(row.level, &row.model_name), &row.tpm.to_string(), None)
                .await;
        }
        tracing::info!(count = rows.len(), "refreshed all rate limits");
    }
}

/// Global-singleton reconciliation of the cached rate-limit keys against
/// the authoritative rows, guarded by the scheduler's distributed lock.
pub struct RateLimitRefreshJob {
    limiter: Arc<RateLimiter>,
    interval: Duration,
}

impl RateLimitRefreshJob {
    #[must_use]
    pub fn new(limiter: Arc<RateLimiter>, interval: Duration) -> Self {
        Self { limiter, interval }
    }
}

#[async_trait]
impl GlobalJob for RateLimitRefreshJob {
    fn name(&self) -> &'static str {
        "rate_limit_refresh"
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn run_once(&self) {
        self.limiter.refresh_all_limits().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::{MemoryKeyValueStore, MemoryRelationalStore};
    use crate::store::model_types::RateLimitRow;

    fn limiter_with_row(rpm: i64, tpm: i64) -> RateLimiter {
        let relational = MemoryRelationalStore::new();
        relational.seed_rate_limit(RateLimitRow {
            level: 0,
            model_name: "gpt-4".to_string(),
            rpm,
            tpm,
        });
        RateLimiter::new(
            Arc::new(MemoryKeyValueStore::new()),
            Arc::new(relational),
            60,
            60,
            true,
        )
    }

    #[tokio::test]
    async fn rpm_limit_falls_back_to_relational_row_and_caches_it() {
        let limiter = limiter_with_row(5, 1000);
        assert_eq!(limiter.rpm_limit("user-1", "gpt-4").await, 5);
        // cached now; relational store untouched, kv should serve it
        assert_eq!(limiter.rpm_limit("user-1", "gpt-4").await, 5);
    }

    #[tokio::test]
    async fn check_rpm_denies_after_limit_reached() {
        let limiter = limiter_with_row(2, 100_000);
        assert!(limiter.check_rpm("user-1", "gpt-4").await);
        assert!(limiter.check_rpm("user-1", "gpt-4").await);
        assert!(!limiter.check_rpm("user-1", "gpt-4").await);
    }

    #[tokio::test]
    async fn unlimited_model_is_always_admitted() {
        let relational = MemoryRelationalStore::new();
        let limiter = RateLimiter::new(
            Arc::new(MemoryKeyValueStore::new()),
            Arc::new(relational),
            60,
            60,
            true,
        );
        for _ in 0..10 {
            assert!(limiter.check_rpm("user-1", "unknown-model").await);
        }
    }

    #[tokio::test]
    async fn check_tpm_denies_once_usage_crosses_limit() {
        let limiter = limiter_with_row(1000, 100);
        assert!(limiter.check_tpm("user-1", "gpt-4").await);
        limiter.record_token_usage("user-1", "gpt-4", 150).await;
        assert!(!limiter.check_tpm("user-1", "gpt-4").await);
    }
}

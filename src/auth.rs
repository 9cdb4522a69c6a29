//! Request authentication and admission: bearer extraction,
//! api-key lookup, balance probe, and rate-limit admission, in that order.
use std::sync::Arc;

use http::header::AUTHORIZATION;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use crate::cache::{EvictSubscriber, KeyedTtlCache, ResourceKind};
use crate::error::GatewayError;
use crate::limiter::RateLimiter;
use crate::store::model_types::{ApiKey, MetricUnit, TokenType};
use crate::store::{BalanceService, RelationalStore};
use crate::util::unix_now_secs;

/// Api-key cache TTL.
const API_KEY_CACHE_TTL_SECS: u64 = 600;
/// `EXP_TIME_BAL_ENOUGH`: balance-probe cache TTL.
const BALANCE_CACHE_TTL_SECS: u64 = 480;

/// Extract the bearer token from `Authorization: Bearer <key>`.
///
/// # Errors
///
/// Returns [`GatewayError::ApiKeyUnauthorized`] when the header is absent
/// or not a bearer token.
pub fn extract_bearer_token(headers: &http::HeaderMap) -> Result<&str, GatewayError> {
    headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.strip_prefix("Bearer "))
        .filter(|s| !s.is_empty())
        .ok_or(GatewayError::ApiKeyUnauthorized)
}

/// The outcome of a successful authentication pass: the caller's api key
/// record, ready to be threaded through usage accounting.
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub api_key: ApiKey,
}

/// Batches `last_used_at` writes in-process instead of touching the
/// relational store on every request: each key's value only ever moves
/// forward, and a periodic scheduler job drains and flushes the batch
/// taking the per-key maximum.
#[derive(Default)]
pub struct LastUsedTracker {
    pending: Mutex<FxHashMap<String, u64>>,
}

impl LastUsedTracker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, api_key_id: &str, at_unix: u64) {
        let mut pending = self.pending.lock();
        let slot = pending.entry(api_key_id.to_string()).or_insert(0);
        *slot = (*slot).max(at_unix);
    }

    /// Take everything accumulated so far, leaving the tracker empty.
    #[must_use]
    pub fn drain(&self) -> Vec<(String, u64)> {
        std::mem::take(&mut *self.pending.lock()).into_iter().collect()
    }
}

/// Evicts a single cached api key by id on an `ApiKey` cache-evict event.
pub struct ApiKeyCacheEvictSubscriber {
    cache: Arc<KeyedTtlCache<String, ApiKey>>,
}

impl ApiKeyCacheEvictSubscriber {
    #[must_use]
    pub fn new(cache: Arc<KeyedTtlCache<String, ApiKey>>) -> Self {
        Self { cache }
    }
}

impl EvictSubscriber for ApiKeyCacheEvictSubscriber {
    fn module(&self) -> ResourceKind {
        ResourceKind::ApiKey
    }

    fn on_evict(&self, params: &[String]) {
        for id in params {
            self.cache.invalidate(id);
        }
    }
}

/// Evicts a single `(user, model)` balance decision on a `UserBalance`
/// cache-evict event, published by the upstream on
/// `user.balance.recharge`/`user.balance.insufficient`.
pub struct BalanceCacheEvictSubscriber {
    cache: Arc<KeyedTtlCache<String, bool>>,
}

impl BalanceCacheEvictSubscriber {
    #[must_use]
    pub fn new(cache: Arc<KeyedTtlCache<String, bool>>) -> Self {
        Self { cache }
    }
}

impl EvictSubscriber for BalanceCacheEvictSubscriber {
    fn module(&self) -> ResourceKind {
        ResourceKind::UserBalance
    }

    fn on_evict(&self, params: &[String]) {
        for key in params {
            self.cache.invalidate(key);
        }
    }
}

fn balance_cache_key(user_id: &str, model: &str) -> String {
    format!("bal-enough:{user_id}:{model}")
}

pub struct Authenticator {
    relational: Arc<dyn RelationalStore>,
    balance: Arc<dyn BalanceService>,
    limiter: Arc<RateLimiter>,
    last_used: Arc<LastUsedTracker>,
    api_key_cache: Arc<KeyedTtlCache<String, ApiKey>>,
    balance_cache: Arc<KeyedTtlCache<String, bool>>,
}

impl Authenticator {
    #[must_use]
    pub fn new(
        relational: Arc<dyn RelationalStore>,
        balance: Arc<dyn BalanceService>,
        limiter: Arc<RateLimiter>,
        last_used: Arc<LastUsedTracker>,
    ) -> Self {
        Self {
            relational,
            balance,
            limiter,
            last_used,
            api_key_cache: Arc::new(KeyedTtlCache::new(API_KEY_CACHE_TTL_SECS)),
            balance_cache: Arc::new(KeyedTtlCache::new(BALANCE_CACHE_TTL_SECS)),
        }
    }

    /// Handles shared with [`ApiKeyCacheEvictSubscriber`] and
    /// [`BalanceCacheEvictSubscriber`], registered once at startup.
    #[must_use]
    pub fn api_key_cache_handle(&self) -> Arc<KeyedTtlCache<String, ApiKey>> {
        self.api_key_cache.clone()
    }

    #[must_use]
    pub fn balance_cache_handle(&self) -> Arc<KeyedTtlCache<String, bool>> {
        self.balance_cache.clone()
    }

    async fn lookup_api_key(&self, raw_key: &str) -> Option<ApiKey> {
        if let Some(cached) = self.api_key_cache.get(&raw_key.to_string()) {
            return Some(cached);
        }
        let key = self.relational.get_api_key(raw_key).await?;
        self.api_key_cache.set(raw_key.to_string(), key.clone());
        Some(key)
    }

    async fn probe_balance(
        &self,
        user_id: &str,
        model_category: &str,
        model: &str,
        token_type: &str,
        unit: &str,
    ) -> Result<bool, GatewayError> {
        let cache_key = balance_cache_key(user_id, model);
        if let Some(cached) = self.balance_cache.get(&cache_key) {
            return Ok(cached);
        }
        let sufficient = self.balance.probe(user_id, model_category, model, token_type, unit).await?;
        self.balance_cache.set(cache_key, sufficient);
        Ok(sufficient)
    }

    /// Run the full admission pipeline for one request:
    /// 1. look up the api key and check it is active
    /// 2. probe balance, unless `skip_balance_probe` (the `/files/*` family)
    /// 3. check RPM and TPM budgets, unless `skip_limit_check` (same family)
    /// 4. lazily record `last_used_at` for the next periodic flush
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::ApiKeyUnauthorized`] for an unknown key,
    /// [`GatewayError::ApiKeyInactive`] for a disabled key,
    /// [`GatewayError::PaymentRequired`] when the balance probe fails, and
    /// [`GatewayError::TooManyRequests`] when rate-limited.
    #[allow(clippy::too_many_arguments)]
    pub async fn authenticate(
        &self,
        raw_key: &str,
        model: &str,
        model_category: &str,
        token_type: TokenType,
        unit: MetricUnit,
        skip_balance_probe: bool,
        skip_limit_check: bool,
    ) -> Result<AuthContext, GatewayError> {
        let api_key = self.lookup_api_key(raw_key).await.ok_or(GatewayError::ApiKeyUnauthorized)?;
        if !api_key.is_active() {
            return Err(GatewayError::ApiKeyInactive);
        }

        if !skip_balance_probe {
            let sufficient = self
                .probe_balance(
                    &api_key.creator,
                    model_category,
                    model,
                    token_type_label(token_type),
                    unit_label(unit),
                )
                .await?;
            if !sufficient {
                return Err(GatewayError::PaymentRequired);
            }
        }

        if !skip_limit_check && !self.limiter.admit(&api_key.creator, model).await {
            return Err(GatewayError::TooManyRequests);
        }

        self.last_used.record(&api_key.id, unix_now_secs());

        Ok(AuthContext { api_key })
    }
}

fn token_type_label(token_type: TokenType) -> &'static str {
    match token_type {
        TokenType::Prompt => "prompt",
        TokenType::Completion => "completion",
        TokenType::CachedPrompt => "cached_prompt",
        TokenType::Words => "words",
        TokenType::Seconds => "seconds",
        TokenType::Count => "count",
    }
}

fn unit_label(unit: MetricUnit) -> &'static str {
    match unit {
        MetricUnit::Token => "token",
        MetricUnit::Words => "words",
        MetricUnit::Seconds => "seconds",
    }
}

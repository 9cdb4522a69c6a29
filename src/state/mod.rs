//! Process-wide shared state: the collaborator handles every
//! request handler and background job closes over, built once at startup.
pub mod metrics;
pub mod request_id;

use std::sync::Arc;

use crate::auth::{ApiKeyCacheEvictSubscriber, Authenticator, BalanceCacheEvictSubscriber, LastUsedTracker};
use crate::cache::EventBus;
use crate::config::AppConfig;
use crate::health::HealthChecker;
use crate::limiter::RateLimiter;
use crate::registry::{Registry, RoutingTableEvictSubscriber};
use crate::store::{BalanceService, BillingService, KeyValueStore, RelationalStore, SearchLogSink, UserDirectory};
use crate::transport::HttpTransport;
use metrics::GatewayMetrics;
use request_id::RequestIdGenerator;

/// Every collaborator a request handler or background job may need,
/// constructed once in `main` and shared behind `Arc`s.
pub struct AppState {
    pub config: AppConfig,
    pub registry: Registry,
    pub limiter: Arc<RateLimiter>,
    pub authenticator: Arc<Authenticator>,
    pub health: Arc<HealthChecker>,
    pub events: Arc<EventBus>,
    pub transport: Arc<HttpTransport>,
    pub kv: Arc<dyn KeyValueStore>,
    pub relational: Arc<dyn RelationalStore>,
    pub balance: Arc<dyn BalanceService>,
    pub billing: Arc<dyn BillingService>,
    pub user_directory: Arc<dyn UserDirectory>,
    pub search_log: Arc<dyn SearchLogSink>,
    pub last_used: Arc<LastUsedTracker>,
    pub metrics: Arc<GatewayMetrics>,
    pub(crate) request_ids: RequestIdGenerator,
}

impl AppState {
    /// Wire every collaborator together and register the cache-evict
    /// subscribers that keep them consistent across processes.
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn new(
        config: AppConfig,
        kv: Arc<dyn KeyValueStore>,
        relational: Arc<dyn RelationalStore>,
        balance: Arc<dyn BalanceService>,
        billing: Arc<dyn BillingService>,
        user_directory: Arc<dyn UserDirectory>,
        search_log: Arc<dyn SearchLogSink>,
    ) -> Self {
        let limiter = Arc::new(RateLimiter::new(
            kv.clone(),
            relational.clone(),
            config.rate_limiter.rpm_window_secs,
            config.rate_limiter.tpm_window_secs,
            config.rate_limiter.fail_open,
        ));
        let last_used = Arc::new(LastUsedTracker::new());
        let authenticator = Arc::new(Authenticator::new(relational.clone(), balance.clone(), limiter.clone(), last_used.clone()));
        let registry = Registry::new(relational.clone());
        let events = Arc::new(EventBus::new(kv.clone(), 10_000));
        let metrics = Arc::new(GatewayMetrics::new());
        let health = Arc::new(HealthChecker::new(
            relational.clone(),
            events.clone(),
            metrics.clone(),
            config.health_check.threshold,
            std::time::Duration::from_secs(config.health_check.probe_timeout_secs),
            std::time::Duration::from_secs(config.health_check.interval_secs),
        ));
        events.register(Box::new(RoutingTableEvictSubscriber::new(registry.evict_handle())));
        events.register(Box::new(ApiKeyCacheEvictSubscriber::new(authenticator.api_key_cache_handle())));
        events.register(Box::new(BalanceCacheEvictSubscriber::new(authenticator.balance_cache_handle())));

        let transport = Arc::new(HttpTransport::new(&config.server));

        Self {
            config,
            registry,
            limiter,
            authenticator,
            health,
            events,
            transport,
            kv,
            relational,
            balance,
            billing,
            user_directory,
            search_log,
            last_used,
            metrics,
            request_ids: RequestIdGenerator::new(),
        }
    }
}

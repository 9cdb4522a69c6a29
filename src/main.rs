use std::sync::Arc;
use std::time::Duration;

use model_gateway::billing::BillingJob;
use model_gateway::config::{load_config, AppConfig, SeedDataConfig};
use model_gateway::health::HealthChecker;
use model_gateway::limiter::RateLimitRefreshJob;
use model_gateway::observability::init_tracing;
use model_gateway::proxy::router;
use model_gateway::scheduler::{run_global, run_local_last_used_flush, FileCleanupJob, GlobalJob};
use model_gateway::state::AppState;
use model_gateway::store::memory::{
    AlwaysSucceedsBilling, AlwaysSufficientBalance, MemoryKeyValueStore, MemoryRelationalStore,
    MemoryUserDirectory, NullSearchLogSink, ZeroMetricsBackfill,
};
use model_gateway::store::model_types::{ApiKey, Channel, ChannelBinding, EntityStatus, Model, RateLimitRow};
use model_gateway::store::{BillingService, KeyValueStore, RelationalStore, SearchLogSink};
use model_gateway::usage::{ErrorConsumerJob, UsageConsumerJob};

/// Global-singleton jobs reconcile their locked keys on this cadence.
const RATE_LIMIT_REFRESH_INTERVAL_SECS: u64 = 300;

fn main() {
    let config = load_config("config.yaml").unwrap_or_else(|e| {
        eprintln!("Failed to load configuration: {e}");
        eprintln!("Please copy 'config.example.yaml' to 'config.yaml' and modify as needed.");
        std::process::exit(1);
    });

    init_tracing(&config.server.log_level);
    let runtime = build_runtime(&config);
    runtime.block_on(async move {
        run(config).await;
    });
}

fn build_runtime(config: &AppConfig) -> tokio::runtime::Runtime {
    let worker_threads = config.server.runtime_worker_threads;
    let max_blocking_threads = config.server.runtime_max_blocking_threads;
    let thread_stack_size_kb = config.server.runtime_thread_stack_size_kb;

    let mut builder = if worker_threads == Some(1) {
        tokio::runtime::Builder::new_current_thread()
    } else {
        let mut builder = tokio::runtime::Builder::new_multi_thread();
        if let Some(threads) = worker_threads {
            builder.worker_threads(threads);
        }
        builder
    };
    builder.enable_io();
    builder.enable_time();
    if let Some(max_blocking) = max_blocking_threads {
        builder.max_blocking_threads(max_blocking);
    }
    if worker_threads != Some(1) {
        if let Some(stack_kb) = thread_stack_size_kb {
            builder.thread_stack_size(stack_kb * 1024);
        }
    }
    builder.build().unwrap_or_else(|e| {
        eprintln!("Failed to initialize Tokio runtime: {e}");
        std::process::exit(1);
    })
}

/// Populate the in-memory relational store from the config's seed section,
/// standing in for rows a real relational store would already hold.
fn seed_relational_store(seed: &SeedDataConfig) -> MemoryRelationalStore {
    let store = MemoryRelationalStore::new();
    for key in &seed.api_keys {
        store.seed_api_key(ApiKey {
            id: key.id.clone(),
            creator: key.creator.clone(),
            status: EntityStatus::Active,
            last_used_at: 0,
        });
    }
    for model in &seed.models {
        store.seed_model(Model {
            id: model.id,
            name: model.name.clone(),
            status: EntityStatus::Active,
        });
    }
    for channel in &seed.channels {
        let model_redirect_json = if channel.model_redirect.is_empty() {
            String::new()
        } else {
            serde_json::to_string(&channel.model_redirect).unwrap_or_default()
        };
        store.seed_channel(Channel {
            id: channel.id,
            name: channel.name.clone(),
            upstream_url: channel.upstream_url.clone(),
            upstream_secret: channel.upstream_secret.clone(),
            status: EntityStatus::Active,
            health: 1,
            model_redirect_json,
        });
        for model_id in &channel.model_ids {
            store.seed_binding(ChannelBinding {
                channel_id: channel.id,
                model_id: *model_id,
            });
        }
    }
    for row in &seed.rate_limits {
        store.seed_rate_limit(RateLimitRow {
            level: row.level,
            model_name: row.model_name.clone(),
            rpm: row.rpm,
            tpm: row.tpm,
        });
    }
    store
}

async fn run(config: AppConfig) {
    let server_config = config.server.clone();
    let kv: Arc<dyn KeyValueStore> = Arc::new(MemoryKeyValueStore::new());
    let relational: Arc<dyn RelationalStore> = Arc::new(seed_relational_store(&config.seed));
    let balance = Arc::new(AlwaysSufficientBalance);
    let billing: Arc<dyn BillingService> = Arc::new(AlwaysSucceedsBilling);
    let user_directory = Arc::new(MemoryUserDirectory::new());
    let search_log: Arc<dyn SearchLogSink> = Arc::new(NullSearchLogSink);

    let state = Arc::new(AppState::new(
        config,
        kv.clone(),
        relational.clone(),
        balance,
        billing.clone(),
        user_directory,
        search_log.clone(),
    ));

    spawn_background_jobs(&state, kv.clone(), relational, billing, search_log);

    let addr = format!("{}:{}", server_config.host, server_config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await.unwrap_or_else(|e| {
        eprintln!("Failed to bind to {addr}: {e}");
        std::process::exit(1);
    });
    tracing::info!(addr, "model gateway listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .unwrap_or_else(|e| tracing::error!(error = %e, "server exited with error"));
}

/// Spawns every long-lived background task: the event-bus
/// consumer and `last_used_at` flush run on every replica; the rest are
/// global singletons gated by the scheduler's distributed lock.
fn spawn_background_jobs(
    state: &Arc<AppState>,
    kv: Arc<dyn KeyValueStore>,
    relational: Arc<dyn RelationalStore>,
    billing_service: Arc<dyn BillingService>,
    search_log: Arc<dyn SearchLogSink>,
) {
    tokio::spawn({
        let events = state.events.clone();
        async move { events.run_consumer(Duration::from_millis(500)).await }
    });

    tokio::spawn({
        let relational = relational.clone();
        let last_used = state.last_used.clone();
        async move { run_local_last_used_flush(relational, last_used, Duration::from_secs(600)).await }
    });

    let health: Arc<dyn GlobalJob> = state.health.clone() as Arc<dyn GlobalJob>;
    tokio::spawn(run_global(kv.clone(), health));

    let rate_limit_refresh: Arc<dyn GlobalJob> = Arc::new(RateLimitRefreshJob::new(
        state.limiter.clone(),
        Duration::from_secs(RATE_LIMIT_REFRESH_INTERVAL_SECS),
    ));
    tokio::spawn(run_global(kv.clone(), rate_limit_refresh));

    let usage_consumer: Arc<dyn GlobalJob> = Arc::new(UsageConsumerJob::new(
        kv.clone(),
        search_log.clone(),
        Arc::new(ZeroMetricsBackfill),
        state.metrics.clone(),
        state.config.billing.clone(),
        true,
    ));
    tokio::spawn(run_global(kv.clone(), usage_consumer));

    let error_consumer: Arc<dyn GlobalJob> =
        Arc::new(ErrorConsumerJob::new(kv.clone(), state.metrics.clone()));
    tokio::spawn(run_global(kv.clone(), error_consumer));

    let billing_job: Arc<dyn GlobalJob> = Arc::new(BillingJob::new(
        kv.clone(),
        relational.clone(),
        billing_service,
        search_log,
        state.config.billing.clone(),
    ));
    tokio::spawn(run_global(kv.clone(), billing_job));

    let file_cleanup: Arc<dyn GlobalJob> = Arc::new(FileCleanupJob::new(
        relational,
        Duration::from_secs(state.config.file_cleanup.interval_secs),
        Duration::from_secs(state.config.file_cleanup.retention_secs),
    ));
    tokio::spawn(run_global(kv, file_cleanup));

    let _: &HealthChecker = state.health.as_ref();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install ctrl-c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
    tracing::info!("shutdown signal received, draining in-flight requests");
}

//! Integration coverage for the RPM/TPM limiter cascade and the refresh job,
//! exercised through the public `RateLimiter` API against the in-memory
//! stores (no HTTP surface involved).
use std::sync::Arc;

use model_gateway::limiter::{RateLimiter, UNLIMITED};
use model_gateway::scheduler::GlobalJob;
use model_gateway::store::memory::{MemoryKeyValueStore, MemoryRelationalStore};
use model_gateway::store::model_types::RateLimitRow;
use model_gateway::store::model_types::DEFAULT_MODEL_NAME;
use model_gateway::store::RelationalStore;

fn limiter(relational: Arc<MemoryRelationalStore>) -> RateLimiter {
    RateLimiter::new(Arc::new(MemoryKeyValueStore::new()), relational, 60, 60, true)
}

#[tokio::test]
async fn falls_back_to_the_default_model_row_for_an_unmatched_model() {
    let relational = Arc::new(MemoryRelationalStore::new());
    relational.seed_rate_limit(RateLimitRow {
        level: 0,
        model_name: DEFAULT_MODEL_NAME.to_string(),
        rpm: 3,
        tpm: 10_000,
    });
    let limiter = limiter(relational);

    assert_eq!(limiter.rpm_limit("user-1", "some-other-model").await, 3);
    assert!(limiter.check_rpm("user-1", "some-other-model").await);
    assert!(limiter.check_rpm("user-1", "some-other-model").await);
    assert!(limiter.check_rpm("user-1", "some-other-model").await);
    assert!(!limiter.check_rpm("user-1", "some-other-model").await);
}

#[tokio::test]
async fn per_model_row_takes_precedence_over_the_default_row() {
    let relational = Arc::new(MemoryRelationalStore::new());
    relational.seed_rate_limit(RateLimitRow {
        level: 0,
        model_name: DEFAULT_MODEL_NAME.to_string(),
        rpm: 1,
        tpm: 1_000,
    });
    relational.seed_rate_limit(RateLimitRow {
        level: 0,
        model_name: "gpt-4o".to_string(),
        rpm: 50,
        tpm: 500_000,
    });
    let limiter = limiter(relational);

    assert_eq!(limiter.rpm_limit("user-1", "gpt-4o").await, 50);
    assert_eq!(limiter.rpm_limit("user-1", "anything-else").await, 1);
}

#[tokio::test]
async fn no_matching_row_anywhere_is_unlimited() {
    let relational = Arc::new(MemoryRelationalStore::new());
    let limiter = limiter(relational);

    assert_eq!(limiter.rpm_limit("user-1", "ghost-model").await, UNLIMITED);
    for _ in 0..25 {
        assert!(limiter.admit("user-1", "ghost-model").await);
    }
}

#[tokio::test]
async fn higher_account_level_resolves_to_its_own_row() {
    let relational = Arc::new(MemoryRelationalStore::new());
    relational.set_user_level("vip-user", 1).await;
    relational.seed_rate_limit(RateLimitRow {
        level: 0,
        model_name: "gpt-4o".to_string(),
        rpm: 10,
        tpm: 10_000,
    });
    relational.seed_rate_limit(RateLimitRow {
        level: 1,
        model_name: "gpt-4o".to_string(),
        rpm: 1000,
        tpm: 10_000_000,
    });
    let limiter = limiter(relational);

    assert_eq!(limiter.rpm_limit("vip-user", "gpt-4o").await, 1000);
    assert_eq!(limiter.rpm_limit("regular-user", "gpt-4o").await, 10);
}

#[tokio::test]
async fn refresh_job_picks_up_rows_added_after_first_lookup_cached_a_miss() {
    let relational = Arc::new(MemoryRelationalStore::new());
    let limiter = Arc::new(limiter(relational.clone()));

    // First lookup finds nothing and returns the unlimited default.
    assert_eq!(limiter.rpm_limit("user-1", "gpt-4o").await, UNLIMITED);

    // A row appears in the relational store afterwards...
    relational.seed_rate_limit(RateLimitRow {
        level: 0,
        model_name: "gpt-4o".to_string(),
        rpm: 7,
        tpm: 70_000,
    });

    // ...and the refresh job's sweep is what makes it visible to new lookups.
    limiter.refresh_all_limits().await;
    assert_eq!(limiter.rpm_limit("user-1", "gpt-4o").await, 7);
}

#[tokio::test]
async fn refresh_job_run_once_is_equivalent_to_calling_refresh_directly() {
    let relational = Arc::new(MemoryRelationalStore::new());
    relational.seed_rate_limit(RateLimitRow {
        level: 0,
        model_name: "gpt-4o".to_string(),
        rpm: 9,
        tpm: 90_000,
    });
    let limiter = Arc::new(limiter(relational));
    let job = model_gateway::limiter::RateLimitRefreshJob::new(
        limiter.clone(),
        std::time::Duration::from_secs(300),
    );

    assert_eq!(job.name(), "rate_limit_refresh");
    job.run_once().await;
    assert_eq!(limiter.rpm_limit("user-1", "gpt-4o").await, 9);
}

#[tokio::test]
async fn tpm_admission_is_independent_of_rpm_admission() {
    let relational = Arc::new(MemoryRelationalStore::new());
    relational.seed_rate_limit(RateLimitRow {
        level: 0,
        model_name: "gpt-4o".to_string(),
        rpm: 1000,
        tpm: 100,
    });
    let limiter = limiter(relational);

    assert!(limiter.check_tpm("user-1", "gpt-4o").await);
    limiter.record_token_usage("user-1", "gpt-4o", 150).await;
    assert!(!limiter.check_tpm("user-1", "gpt-4o").await);
    // RPM budget is untouched by the TPM breach.
    assert!(limiter.check_rpm("user-1", "gpt-4o").await);
}

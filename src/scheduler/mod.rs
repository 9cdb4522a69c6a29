//! Scheduled work: local per-replica periodics and
//! global-singleton jobs gated by [`lock::DistributedLock`].
pub mod lock;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::auth::LastUsedTracker;
use crate::store::{KeyValueStore, RelationalStore};
use lock::DistributedLock;

/// TTL for every global-singleton lock.
pub const GLOBAL_JOB_EXPIRE_SECS: u64 = 600;

/// One unit of global-singleton work: the scheduler calls `run_once` on
/// `interval` for as long as this process holds the job's lock.
#[async_trait]
pub trait GlobalJob: Send + Sync {
    fn name(&self) -> &'static str;
    fn interval(&self) -> Duration;
    async fn run_once(&self);
}

/// Runs a [`GlobalJob`] forever, holding the distributed lock while
/// possible and backing off with jitter between acquire attempts while it
/// doesn't: losers retry every `random(expire/3, expire/2)`.
pub async fn run_global(kv: Arc<dyn KeyValueStore>, job: Arc<dyn GlobalJob>) -> ! {
    let lock_key = format!("lock:job:{}", job.name());
    loop {
        let lock = Arc::new(DistributedLock::new(kv.clone(), lock_key.clone(), GLOBAL_JOB_EXPIRE_SECS));
        if lock.try_acquire().await {
            tracing::info!(job = job.name(), "acquired global job lock");
            let renewer = lock.spawn_renewer();
            while lock.is_held() {
                job.run_once().await;
                tokio::time::sleep(job.interval()).await;
            }
            tracing::warn!(job = job.name(), "lost global job lock, releasing task");
            renewer.abort();
            lock.release().await;
        } else {
            let low = GLOBAL_JOB_EXPIRE_SECS / 3;
            let high = (GLOBAL_JOB_EXPIRE_SECS / 2).max(low + 1);
            let wait = Duration::from_secs(fastrand::u64(low..high));
            tokio::time::sleep(wait).await;
        }
    }
}

/// Global-singleton sweep that marks upload files inactive once they are
/// older than the configured retention window. File upload/list/delete
/// themselves are out of scope; this job only needs the `GatewayFile`
/// shape to decide what to retire.
pub struct FileCleanupJob {
    relational: Arc<dyn RelationalStore>,
    interval: Duration,
    retention: Duration,
}

impl FileCleanupJob {
    #[must_use]
    pub fn new(relational: Arc<dyn RelationalStore>, interval: Duration, retention: Duration) -> Self {
        Self { relational, interval, retention }
    }
}

#[async_trait]
impl GlobalJob for FileCleanupJob {
    fn name(&self) -> &'static str {
        "file_cleanup"
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn run_once(&self) {
        let cutoff = crate::util::unix_now_secs().saturating_sub(self.retention.as_secs());
        let stale = self.relational.list_active_files_older_than(cutoff).await;
        if stale.is_empty() {
            return;
        }
        let ids: Vec<String> = stale.iter().map(|f| f.id.clone()).collect();
        let removed = self.relational.mark_files_inactive(&ids).await;
        tracing::info!(removed, "cleaned up stale upload files");
    }
}

/// Runs forever on every replica, draining [`LastUsedTracker`] and flushing
/// the per-key maximum `last_used_at` to the relational store every
/// `interval`.
pub async fn run_local_last_used_flush(
    relational: Arc<dyn RelationalStore>,
    tracker: Arc<LastUsedTracker>,
    interval: Duration,
) -> ! {
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;
        for (api_key_id, at_unix) in tracker.drain() {
            relational.touch_api_key_last_used(&api_key_id, at_unix).await;
        }
    }
}

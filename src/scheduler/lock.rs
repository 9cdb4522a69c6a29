//! Distributed lock with an auto-renewing owner token: renew while the
//! holder still owns it, disarm the instant it doesn't.
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::store::KeyValueStore;
use crate::util::random_hex_id;

/// A key-value entry that exactly one process may hold at a time, with a
/// background renewer that keeps extending its TTL as long as the stored
/// value still matches this holder's token.
pub struct DistributedLock {
    kv: Arc<dyn KeyValueStore>,
    key: String,
    token: String,
    ttl_secs: u64,
    held: Arc<AtomicBool>,
}

impl DistributedLock {
    #[must_use]
    pub fn new(kv: Arc<dyn KeyValueStore>, key: String, ttl_secs: u64) -> Self {
        Self {
            kv,
            key,
            token: random_hex_id(16),
            ttl_secs,
            held: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Attempt to become the holder. Idempotent: a loser can call this
    /// again on its next retry.
    pub async fn try_acquire(&self) -> bool {
        let acquired = self.kv.set_nx(&self.key, &self.token, self.ttl_secs).await;
        self.held.store(acquired, Ordering::Release);
        acquired
    }

    #[must_use]
    pub fn is_held(&self) -> bool {
        self.held.load(Ordering::Acquire)
    }

    /// Release the lock if we still hold it. Safe to call unconditionally
    /// (e.g. on graceful shutdown).
    pub async fn release(&self) {
        if self.kv.get(&self.key).await.as_deref() == Some(self.token.as_str()) {
            self.kv.delete(&self.key).await;
        }
        self.held.store(false, Ordering::Release);
    }

    /// Spawn the renewer: every `ttl/3` it checks the stored value is still
    /// our token before re-setting the TTL. A mismatch (stolen after this
    /// process stalled past its TTL, or a drift) disarms renewal silently —
    /// the caller notices via [`Self::is_held`] turning false.
    #[must_use]
    pub fn spawn_renewer(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let this = self.clone();
        let renew_every = Duration::from_secs((this.ttl_secs / 3).max(1));
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(renew_every).await;
                if !this.is_held() {
                    return;
                }
                match this.kv.get(&this.key).await {
                    Some(current) if current == this.token => {
                        this.kv.expire(&this.key, this.ttl_secs).await;
                    }
                    _ => {
                        tracing::warn!(key = %this.key, "distributed lock value drifted, disarming renewer");
                        this.held.store(false, Ordering::Release);
                        return;
                    }
                }
            }
        })
    }
}

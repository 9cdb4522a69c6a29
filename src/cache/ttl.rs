//! A TTL-guarded cache of a single value, refreshed by at most one
//! in-flight refresh at a time. Mirrors the single-guard flag pattern the
//! teacher uses for its models-list cache, generalized to any `T` and
//! additionally invalidated early by [`super::bus::EventBus`] events
//!.
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::RwLock;

use crate::util::unix_now_secs;

pub struct TtlCache<T> {
    value: RwLock<Option<T>>,
    ttl_secs: u64,
    next_refresh_unix: AtomicU64,
    refreshing: AtomicBool,
}

impl<T: Clone> TtlCache<T> {
    #[must_use]
    pub fn new(ttl_secs: u64) -> Self {
        Self {
            value: RwLock::new(None),
            ttl_secs,
            next_refresh_unix: AtomicU64::new(0),
            refreshing: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn get(&self) -> Option<T> {
        self.value.read().clone()
    }

    pub fn set(&self, value: T) {
        *self.value.write() = Some(value);
        let now = unix_now_secs();
        self.next_refresh_unix
            .store(now.saturating_add(self.ttl_secs), Ordering::Relaxed);
    }

    /// Drop the cached value immediately and force the next caller to
    /// refresh, regardless of the TTL clock (used on eviction events).
    pub fn invalidate(&self) {
        *self.value.write() = None;
        self.next_refresh_unix.store(0, Ordering::Relaxed);
    }

    /// Returns `true` at most once per TTL window (or immediately after an
    /// `invalidate`); callers who win the race are responsible for calling
    /// [`Self::finish_refresh`] when done, win or lose.
    #[must_use]
    pub fn try_begin_refresh(&self) -> bool {
        let now = unix_now_secs();
        if self.value.read().is_some() && now < self.next_refresh_unix.load(Ordering::Relaxed) {
            return false;
        }
        !self.refreshing.swap(true, Ordering::AcqRel)
    }

    pub fn finish_refresh(&self) {
        self.refreshing.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn refresh_guard_admits_one_winner_until_finished() {
        let cache: TtlCache<u32> = TtlCache::new(60);
        assert!(cache.try_begin_refresh());
        assert!(!cache.try_begin_refresh());
        cache.finish_refresh();
        cache.set(1);
        assert!(!cache.try_begin_refresh());
    }

    #[test]
    fn invalidate_forces_next_refresh() {
        let cache: TtlCache<u32> = TtlCache::new(3600);
        cache.set(7);
        assert_eq!(cache.get(), Some(7));
        cache.invalidate();
        assert_eq!(cache.get(), None);
        assert!(cache.try_begin_refresh());
    }
}

//! A TTL-guarded cache keyed by arbitrary positional arguments: the api-key
//! cache, the `bal-enough:{user}:{model}` balance cache, and the user-level
//! cache all need a per-key rather than a whole-of-cache TTL. Generalizes
//! [`super::ttl::TtlCache`]'s single-guarded-value idiom to a map, with the
//! same "evicted early by a bus event" contract.
use std::hash::Hash;

use parking_lot::RwLock;
use rustc_hash::FxHashMap;

use crate::util::unix_now_secs;

struct Entry<V> {
    value: V,
    expires_at: u64,
}

pub struct KeyedTtlCache<K, V> {
    entries: RwLock<FxHashMap<K, Entry<V>>>,
    ttl_secs: u64,
}

impl<K, V> KeyedTtlCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    #[must_use]
    pub fn new(ttl_secs: u64) -> Self {
        Self {
            entries: RwLock::new(FxHashMap::default()),
            ttl_secs,
        }
    }

    /// Return the cached value for `key`, dropping and reporting a miss if
    /// its TTL has lapsed.
    #[must_use]
    pub fn get(&self, key: &K) -> Option<V> {
        let now = unix_now_secs();
        let hit = {
            let entries = self.entries.read();
            entries.get(key).and_then(|entry| {
                if entry.expires_at > now {
                    Some(entry.value.clone())
                } else {
                    None
                }
            })
        };
        if hit.is_none() {
            self.entries.write().remove(key);
        }
        hit
    }

    pub fn set(&self, key: K, value: V) {
        let expires_at = unix_now_secs().saturating_add(self.ttl_secs);
        self.entries.write().insert(key, Entry { value, expires_at });
    }

    /// Drop one key's entry immediately, regardless of TTL (used on an
    /// eviction event).
    pub fn invalidate(&self, key: &K) {
        self.entries.write().remove(key);
    }
}

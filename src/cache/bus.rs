//! Cross-process cache invalidation over a durable stream: channel/model
//! mutations on one process publish an evict event; every process
//! (including the one that mutated) tails the stream and drops the
//! matching cache entry.
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::store::KeyValueStore;

const SERVER_EVENT_STREAM: &str = "server:events";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventAction {
    EvictCache,
}

/// The cached resource a subscriber watches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    RoutingTable,
    RateLimitConfig,
    ApiKey,
    /// `bal-enough:{user}:{model}` balance-probe cache, evicted on the
    /// upstream's `user.balance.recharge`/`user.balance.insufficient`
    /// events.
    UserBalance,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub action: EventAction,
    pub module: ResourceKind,
    #[serde(default)]
    pub params: Vec<String>,
}

/// Something that reacts to an [`Event`] for a single [`ResourceKind`].
pub trait EvictSubscriber: Send + Sync {
    fn module(&self) -> ResourceKind;
    fn on_evict(&self, params: &[String]);
}

/// Publishes evict events and fans them out to in-process subscribers.
/// `emit` and `run_consumer` both go through the same durable stream so a
/// multi-process deployment stays consistent; a single process still pays
/// the one-tick consumer latency for its own writes, matching the original.
pub struct EventBus {
    store: Arc<dyn KeyValueStore>,
    max_len: usize,
    subscribers: RwLock<Vec<Box<dyn EvictSubscriber>>>,
}

impl EventBus {
    #[must_use]
    pub fn new(store: Arc<dyn KeyValueStore>, max_len: usize) -> Self {
        Self {
            store,
            max_len,
            subscribers: RwLock::new(Vec::new()),
        }
    }

    pub fn register(&self, subscriber: Box<dyn EvictSubscriber>) {
        tracing::info!(module = ?subscriber.module(), "registered cache-evict subscriber");
        self.subscribers.write().push(subscriber);
    }

    pub async fn emit(&self, module: ResourceKind, params: Vec<String>) {
        let event = Event {
            action: EventAction::EvictCache,
            module,
            params,
        };
        tracing::info!(?event, "emitting cache-evict event");
        let fields = serde_json::to_value(&event).unwrap_or(serde_json::Value::Null);
        self.store
            .stream_publish(SERVER_EVENT_STREAM, fields, self.max_len)
            .await;
    }

    fn dispatch(&self, event: &Event) {
        if event.action != EventAction::EvictCache {
            return;
        }
        for subscriber in self.subscribers.read().iter() {
            if subscriber.module() == event.module {
                subscriber.on_evict(&event.params);
            }
        }
    }

    /// Tail the event stream forever, starting just after whatever was
    /// already on it at startup (mirrors the Python consumer's initial
    /// `xrevrange` before entering its `xread` loop).
    pub async fn run_consumer(&self, poll_interval: std::time::Duration) -> ! {
        let mut last_id = self.store.stream_tail_id(SERVER_EVENT_STREAM).await;
        tracing::info!(last_id, "starting event bus consumer");
        loop {
            let entries = self
                .store
                .stream_read_after(SERVER_EVENT_STREAM, &last_id, 10)
                .await;
            for (id, fields) in entries {
                match serde_json::from_value::<Event>(fields) {
                    Ok(event) => self.dispatch(&event),
                    Err(err) => tracing::warn!(error = %err, "failed to decode event bus message"),
                }
                last_id = id;
            }
            tokio::time::sleep(poll_interval).await;
        }
    }
}

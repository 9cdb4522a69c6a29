//! Periodic upstream health probing with hysteresis, using a
//! shard-and-atomic-flag layout so a probe result only ever touches one
//! channel's state under its own lock.
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use reqwest::header::AUTHORIZATION;
use reqwest::Client;
use rustc_hash::FxHashMap;

use crate::cache::{EventBus, ResourceKind};
use crate::registry::compose_upstream_url;
use crate::scheduler::GlobalJob;
use crate::state::metrics::GatewayMetrics;
use crate::store::{Channel, RelationalStore};

#[derive(Debug, Clone, Copy, Default)]
struct HysteresisState {
    consecutive_failures: u32,
    consecutive_successes: u32,
    healthy: bool,
}

/// Tracks per-channel consecutive pass/fail counts and only flips a
/// channel's recorded health after `threshold` consecutive probes agree,
/// so a single flaky probe doesn't bounce a channel in and out of the
/// routing pool.
pub struct HealthChecker {
    relational: Arc<dyn RelationalStore>,
    events: Arc<EventBus>,
    metrics: Arc<GatewayMetrics>,
    client: Client,
    threshold: u32,
    probe_timeout: Duration,
    probe_interval: Duration,
    state: RwLock<FxHashMap<u64, HysteresisState>>,
}

impl HealthChecker {
    #[must_use]
    pub fn new(
        relational: Arc<dyn RelationalStore>,
        events: Arc<EventBus>,
        metrics: Arc<GatewayMetrics>,
        threshold: u32,
        probe_timeout: Duration,
        probe_interval: Duration,
    ) -> Self {
        let client = Client::builder()
            .timeout(probe_timeout)
            .build()
            .unwrap_or_else(|_| Client::new());
        Self {
            relational,
            events,
            metrics,
            client,
            threshold,
            probe_timeout,
            probe_interval,
            state: RwLock::new(FxHashMap::default()),
        }
    }

    /// Probe every `(channel, models)` pair once, updating the
    /// `channel_health` gauge for every bound model and flipping the
    /// channel's recorded health only once its hysteresis counter crosses
    /// `threshold`.
    pub async fn probe_once(&self, channels: &[(Channel, Vec<String>)]) {
        for (channel, models) in channels {
            let ok = self.probe(channel).await;
            for model in models {
                self.metrics
                    .channel_health
                    .with_label_values(&[&channel.id.to_string(), model])
                    .set(if ok { 1.0 } else { 0.0 });
            }
            self.record(channel.id, ok).await;
        }
    }

    /// `GET {upstream}/v1/models` with the channel's secret; healthy iff
    /// the response status is 200 or 404 and the body is non-empty — any
    /// transport error or other status is unhealthy.
    async fn probe(&self, channel: &Channel) -> bool {
        let url = compose_upstream_url(&channel.upstream_url, "/v1/models");
        let request = self
            .client
            .get(&url)
            .header(AUTHORIZATION, format!("Bearer {}", channel.upstream_secret));
        match tokio::time::timeout(self.probe_timeout, request.send()).await {
            Ok(Ok(response)) => {
                let status = response.status();
                if status.as_u16() != 200 && status.as_u16() != 404 {
                    return false;
                }
                matches!(response.bytes().await, Ok(body) if !body.is_empty())
            }
            _ => false,
        }
    }

    async fn record(&self, channel_id: u64, ok: bool) {
        let flipped_to = {
            let mut states = self.state.write();
            let state = states.entry(channel_id).or_insert(HysteresisState {
                healthy: true,
                ..Default::default()
            });
            if ok {
                state.consecutive_successes += 1;
                state.consecutive_failures = 0;
            } else {
                state.consecutive_failures += 1;
                state.consecutive_successes = 0;
            }

            if !state.healthy && state.consecutive_successes >= self.threshold {
                state.healthy = true;
                Some(true)
            } else if state.healthy && state.consecutive_failures >= self.threshold {
                state.healthy = false;
                Some(false)
            } else {
                None
            }
        };

        let Some(healthy) = flipped_to else {
            return;
        };
        tracing::info!(channel_id, healthy, "channel health flipped");
        self.relational
            .set_channel_health(channel_id, u8::from(healthy))
            .await;
        self.events
            .emit(ResourceKind::RoutingTable, vec![channel_id.to_string()])
            .await;
    }

}

#[async_trait]
impl GlobalJob for HealthChecker {
    fn name(&self) -> &'static str {
        "health_check"
    }

    fn interval(&self) -> Duration {
        self.probe_interval
    }

    /// Rebuild the channel/model pair list fresh from the relational store
    /// each tick (so newly added channels are picked up without a restart)
    /// and probe every one.
    async fn run_once(&self) {
        let pairs = channel_model_pairs(self.relational.as_ref()).await;
        self.probe_once(&pairs).await;
    }
}

/// Groups the routing rows into one `(channel, bound model names)` entry
/// per channel, so a single probe covers every model it serves.
async fn channel_model_pairs(relational: &dyn RelationalStore) -> Vec<(Channel, Vec<String>)> {
    let mut by_channel: FxHashMap<u64, (Channel, Vec<String>)> = FxHashMap::default();
    for (channel, model, _binding) in relational.load_routing_rows().await {
        by_channel
            .entry(channel.id)
            .or_insert_with(|| (channel.clone(), Vec::new()))
            .1
            .push(model.name);
    }
    by_channel.into_values().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::{MemoryKeyValueStore, MemoryRelationalStore};
    use crate::store::model_types::EntityStatus;

    fn channel(id: u64, health: u8) -> Channel {
        Channel {
            id,
            name: "c".into(),
            upstream_url: "http://127.0.0.1:1".into(),
            upstream_secret: "s".into(),
            status: EntityStatus::Active,
            health,
            model_redirect_json: String::new(),
        }
    }

    #[tokio::test]
    async fn health_flips_only_after_threshold_consecutive_failures() {
        let relational = Arc::new(MemoryRelationalStore::new());
        relational.seed_channel(channel(1, 1));
        let events = Arc::new(EventBus::new(Arc::new(MemoryKeyValueStore::new()), 1000));
        let metrics = Arc::new(GatewayMetrics::new());
        let checker = HealthChecker::new(relational.clone(), events, metrics, 2, Duration::from_millis(50), Duration::from_millis(50));

        checker.record(1, false).await;
        assert_eq!(checker.state.read().get(&1).unwrap().consecutive_failures, 1);

        checker.record(1, false).await;
        assert!(!checker.state.read().get(&1).unwrap().healthy);
    }

    #[tokio::test]
    async fn health_recovers_after_threshold_consecutive_successes() {
        let relational = Arc::new(MemoryRelationalStore::new());
        relational.seed_channel(channel(1, 0));
        let events = Arc::new(EventBus::new(Arc::new(MemoryKeyValueStore::new()), 1000));
        let metrics = Arc::new(GatewayMetrics::new());
        let checker = HealthChecker::new(relational, events, metrics, 2, Duration::from_millis(50), Duration::from_millis(50));
        {
            let mut states = checker.state.write();
            states.insert(
                1,
                HysteresisState {
                    healthy: false,
                    ..Default::default()
                },
            );
        }
        checker.record(1, true).await;
        checker.record(1, true).await;
        assert!(checker.state.read().get(&1).unwrap().healthy);
    }
}

//! Prometheus surface: `token_usage_total`, `imaas_api_error`,
//! `channel_health`.
use prometheus::{CounterVec, GaugeVec, Opts, Registry};

pub struct GatewayMetrics {
    pub registry: Registry,
    pub token_usage_total: CounterVec,
    pub imaas_api_error: CounterVec,
    pub channel_health: GaugeVec,
}

impl GatewayMetrics {
    #[must_use]
    pub fn new() -> Self {
        let registry = Registry::new();

        let token_usage_total = CounterVec::new(
            Opts::new("token_usage_total", "Cumulative billed units by label set"),
            &["user_id", "model", "api_key", "token_type", "unit"],
        )
        .expect("valid token_usage_total metric");

        let imaas_api_error = CounterVec::new(
            Opts::new("imaas_api_error", "Upstream/gateway error count by label set"),
            &["model", "channel_id", "user_id", "api_key", "err", "stream"],
        )
        .expect("valid imaas_api_error metric");

        let channel_health = GaugeVec::new(
            Opts::new("channel_health", "Last observed channel health, 1 or 0"),
            &["channel_id", "model"],
        )
        .expect("valid channel_health metric");

        registry
            .register(Box::new(token_usage_total.clone()))
            .expect("register token_usage_total");
        registry
            .register(Box::new(imaas_api_error.clone()))
            .expect("register imaas_api_error");
        registry
            .register(Box::new(channel_health.clone()))
            .expect("register channel_health");

        Self {
            registry,
            token_usage_total,
            imaas_api_error,
            channel_health,
        }
    }

    /// Seed a not-yet-seen `token_usage_total` label set to `value` before
    /// its first in-process increment (spec S4.8 step 2: counters reset on
    /// restart, so the usage consumer recovers the pre-restart value from
    /// Prometheus itself before resuming increments).
    pub fn seed_token_usage(&self, user_id: &str, model: &str, api_key: &str, token_type: &str, unit: &str, value: f64) {
        if value <= 0.0 {
            return;
        }
        self.token_usage_total
            .with_label_values(&[user_id, model, api_key, token_type, unit])
            .inc_by(value);
    }
}

impl Default for GatewayMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seeding_then_incrementing_accumulates() {
        let metrics = GatewayMetrics::new();
        metrics.seed_token_usage("u1", "gpt-4", "sk-a", "prompt", "token", 120.0);
        metrics
            .token_usage_total
            .with_label_values(&["u1", "gpt-4", "sk-a", "prompt", "token"])
            .inc_by(5.0);
        let value = metrics
            .token_usage_total
            .with_label_values(&["u1", "gpt-4", "sk-a", "prompt", "token"])
            .get();
        assert_eq!(value, 125.0);
    }
}

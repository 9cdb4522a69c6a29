//! Usage-to-billing pipeline: consumes the invoke/error queues,
//! maintains Prometheus counters (with restart recovery via
//! [`crate::store::MetricsBackfill`]), increments billing meters, and
//! writes the raw events to the search-log sink.
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rustc_hash::FxHashSet;

use crate::config::BillingConfig;
use crate::scheduler::GlobalJob;
use crate::state::metrics::GatewayMetrics;
use crate::store::model_types::{ErrorEvent, UsageEvent};
use crate::store::{KeyValueStore, MetricsBackfill, SearchLogSink};

pub const API_INVOKE_EVENT_QUEUE: &str = "api_invoke_event_queue";
pub const API_ERROR_EVENT_QUEUE: &str = "api_error_event_queue";
const CONSUMER_GROUP: &str = "gateway_usage_pipeline";
const POLL_COUNT: usize = 100;

fn meter_key_for(token_type: &str) -> Option<&'static str> {
    match token_type {
        "prompt" | "completion" | "cached_prompt" => Some("tokens_for_bill"),
        "words" => Some("words_for_bill"),
        "count" => Some("counts_for_bill"),
        "seconds" => Some("seconds_for_bill"),
        _ => None,
    }
}

/// Every `(token_type, count)` pair a [`UsageEvent`] carries, skipping
/// absent/zero fields.
fn usage_components(event: &UsageEvent) -> Vec<(&'static str, u64)> {
    let mut out = Vec::new();
    if let Some(v) = event.prompt_tokens.filter(|v| *v > 0) {
        out.push(("prompt", v));
    }
    if let Some(v) = event.completion_tokens.filter(|v| *v > 0) {
        out.push(("completion", v));
    }
    if let Some(v) = event.cached_tokens.filter(|v| *v > 0) {
        out.push(("cached_prompt", v));
    }
    if let Some(v) = event.words.filter(|v| *v > 0) {
        out.push(("words", v));
    }
    if let Some(v) = event.speech_length.filter(|v| *v > 0) {
        out.push(("seconds", v));
    }
    out
}

/// Consumes [`API_INVOKE_EVENT_QUEUE`], a global-singleton job (spec
/// S4.8, S4.10).
pub struct UsageConsumerJob {
    kv: Arc<dyn KeyValueStore>,
    search_log: Arc<dyn SearchLogSink>,
    metrics_backfill: Arc<dyn MetricsBackfill>,
    metrics: Arc<GatewayMetrics>,
    billing: BillingConfig,
    billing_enabled: bool,
    seen_labels: Mutex<FxHashSet<(String, String, String, String, String)>>,
}

impl UsageConsumerJob {
    #[must_use]
    pub fn new(
        kv: Arc<dyn KeyValueStore>,
        search_log: Arc<dyn SearchLogSink>,
        metrics_backfill: Arc<dyn MetricsBackfill>,
        metrics: Arc<GatewayMetrics>,
        billing: BillingConfig,
        billing_enabled: bool,
    ) -> Self {
        Self {
            kv,
            search_log,
            metrics_backfill,
            metrics,
            billing,
            billing_enabled,
            seen_labels: Mutex::new(FxHashSet::default()),
        }
    }

    async fn seed_if_unseen(&self, user_id: &str, model: &str, api_key: &str, token_type: &str, unit: &str) {
        let label = (
            user_id.to_string(),
            model.to_string(),
            api_key.to_string(),
            token_type.to_string(),
            unit.to_string(),
        );
        let unseen = self.seen_labels.lock().insert(label.clone());
        if !unseen {
            return;
        }
        let mut dims = HashMap::new();
        dims.insert("user_id".to_string(), label.0.clone());
        dims.insert("model".to_string(), label.1.clone());
        dims.insert("api_key".to_string(), label.2.clone());
        dims.insert("token_type".to_string(), label.3.clone());
        dims.insert("unit".to_string(), label.4.clone());
        let recovered = self.metrics_backfill.recover_counter(&dims).await;
        self.metrics.seed_token_usage(user_id, model, api_key, token_type, unit, recovered);
    }

    async fn process_one(&self, fields: serde_json::Value) -> Result<(), serde_json::Error> {
        let event: UsageEvent = serde_json::from_value(fields)?;
        let unit = match event.model_tag {
            crate::store::model_types::ModelTag::Tts => "words",
            crate::store::model_types::ModelTag::Asr => "seconds",
            _ => "token",
        };

        for (token_type, count) in usage_components(&event) {
            self.seed_if_unseen(&event.user_id, &event.model, &event.api_key, token_type, unit).await;
            self.metrics
                .token_usage_total
                .with_label_values(&[&event.user_id, &event.model, &event.api_key, token_type, unit])
                .inc_by(count as f64);

            if self.billing_enabled {
                if let Some(meter_key) = meter_key_for(token_type) {
                    let member = format!("{}:{}:{}:{}", event.user_id, event.model, event.channel_id, token_type);
                    self.kv.meter_incrby(meter_key, &member, count as i64).await;
                }
            }
        }

        self.search_log.write_usage_batch(std::slice::from_ref(&event)).await;
        Ok(())
    }
}

#[async_trait]
impl GlobalJob for UsageConsumerJob {
    fn name(&self) -> &'static str {
        "usage_consumer"
    }

    fn interval(&self) -> Duration {
        Duration::from_secs(1)
    }

    async fn run_once(&self) {
        let entries = self
            .kv
            .stream_read_group(API_INVOKE_EVENT_QUEUE, CONSUMER_GROUP, "usage-consumer", POLL_COUNT)
            .await;
        for (id, fields) in entries {
            match self.process_one(fields).await {
                Ok(()) => self.kv.stream_ack(API_INVOKE_EVENT_QUEUE, CONSUMER_GROUP, &id).await,
                Err(err) => tracing::warn!(error = %err, id, "failed to decode usage event, leaving for redelivery"),
            }
        }
        let _ = &self.billing;
    }
}

/// Consumes [`API_ERROR_EVENT_QUEUE`], symmetric to [`UsageConsumerJob`] but
/// only increments the error counter.
pub struct ErrorConsumerJob {
    kv: Arc<dyn KeyValueStore>,
    metrics: Arc<GatewayMetrics>,
}

impl ErrorConsumerJob {
    #[must_use]
    pub fn new(kv: Arc<dyn KeyValueStore>, metrics: Arc<GatewayMetrics>) -> Self {
        Self { kv, metrics }
    }
}

#[async_trait]
impl GlobalJob for ErrorConsumerJob {
    fn name(&self) -> &'static str {
        "error_consumer"
    }

    fn interval(&self) -> Duration {
        Duration::from_secs(1)
    }

    async fn run_once(&self) {
        let entries = self
            .kv
            .stream_read_group(API_ERROR_EVENT_QUEUE, CONSUMER_GROUP, "error-consumer", POLL_COUNT)
            .await;
        for (id, fields) in entries {
            match serde_json::from_value::<ErrorEvent>(fields) {
                Ok(event) => {
                    self.metrics
                        .imaas_api_error
                        .with_label_values(&[
                            &event.model,
                            &event.channel_id.to_string(),
                            &event.user_id,
                            &event.api_key,
                            &event.err,
                            &event.stream.to_string(),
                        ])
                        .inc();
                    self.kv.stream_ack(API_ERROR_EVENT_QUEUE, CONSUMER_GROUP, &id).await;
                }
                Err(err) => tracing::warn!(error = %err, id, "failed to decode error event, leaving for redelivery"),
            }
        }
    }
}

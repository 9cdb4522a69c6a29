//! Billing sweep: periodically flushes the `*_for_bill` meters
//! into batched charge RPCs, keeping the remainder so a sub-`rate` tail
//! carries into the next sweep. Ported from
//! `original_source/.../job/billing_job.py`.
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::config::BillingConfig;
use crate::scheduler::GlobalJob;
use crate::store::model_types::ChargeIntent;
use crate::store::{BillingService, KeyValueStore, RelationalStore, SearchLogSink};
use crate::util::{random_hex_id, unix_now_secs};

/// No per-tenant zoning concept exists upstream of this gateway; every
/// charge is issued against a single default zone.
const DEFAULT_ZONE: &str = "default";

struct MeterSpec {
    key: &'static str,
    unit: &'static str,
    rate: i64,
}

const METERS: &[MeterSpec] = &[
    MeterSpec { key: "tokens_for_bill", unit: "token", rate: 1000 },
    MeterSpec { key: "words_for_bill", unit: "words", rate: 1000 },
    MeterSpec { key: "counts_for_bill", unit: "count", rate: 1 },
    MeterSpec { key: "seconds_for_bill", unit: "seconds", rate: 1 },
];

/// `{user}:{model}:{channel}:{token_type}` -> parts, per the meter member
/// format.
fn parse_member(member: &str) -> Option<(&str, &str, &str, &str)> {
    let mut parts = member.splitn(4, ':');
    let user = parts.next()?;
    let model = parts.next()?;
    let channel = parts.next()?;
    let token_type = parts.next()?;
    Some((user, model, channel, token_type))
}

pub struct BillingJob {
    kv: Arc<dyn KeyValueStore>,
    relational: Arc<dyn RelationalStore>,
    billing: Arc<dyn BillingService>,
    search_log: Arc<dyn SearchLogSink>,
    config: BillingConfig,
}

impl BillingJob {
    #[must_use]
    pub fn new(
        kv: Arc<dyn KeyValueStore>,
        relational: Arc<dyn RelationalStore>,
        billing: Arc<dyn BillingService>,
        search_log: Arc<dyn SearchLogSink>,
        config: BillingConfig,
    ) -> Self {
        Self { kv, relational, billing, search_log, config }
    }

    async fn sweep_meter(&self, meter: &MeterSpec) {
        let window_end = unix_now_secs() as i64;
        let window_start = window_end - self.config.sweep_interval_secs as i64;

        let entries = self.kv.meter_range_ge(meter.key, meter.rate).await;
        if entries.is_empty() {
            return;
        }

        let mut intents = Vec::with_capacity(entries.len());
        let mut charge_mounts = Vec::with_capacity(entries.len());

        for (member, sum) in &entries {
            let Some((user, model, channel, token_type)) = parse_member(member) else {
                tracing::warn!(member, meter = meter.key, "malformed meter member, skipping");
                continue;
            };
            let charge_mount = sum / meter.rate;
            if charge_mount <= 0 {
                continue;
            }
            let Some(product) = self.relational.get_product(model, token_type, meter.unit).await else {
                tracing::warn!(model, token_type, unit = meter.unit, "no product configured, skipping charge");
                continue;
            };
            let channel_id: u64 = channel.parse().unwrap_or(0);
            let intent = ChargeIntent {
                event_id: random_hex_id(16),
                user: user.to_string(),
                zone: DEFAULT_ZONE.to_string(),
                unit: meter.unit.to_string(),
                token_type: token_type.to_string(),
                model: product.model.clone(),
                mount: charge_mount,
                start_time: window_start,
                end_time: window_end,
                channel_id,
            };
            charge_mounts.push((member.clone(), charge_mount));
            intents.push(intent);
        }

        if intents.is_empty() {
            return;
        }

        let outcomes = self.billing.charge_batch(&intents).await;
        for (outcome, intent) in outcomes.iter().zip(intents.iter()) {
            self.search_log.write_billing_outcome(outcome, intent).await;
            if outcome.result {
                if let Some((member, charge_mount)) =
                    charge_mounts.iter().find(|(member, _)| member_matches(member, intent))
                {
                    self.kv.meter_decrby(meter.key, member, charge_mount * meter.rate).await;
                }
            } else {
                tracing::warn!(event_id = %outcome.event_id, msg = %outcome.result_msg, "charge failed, retaining accumulator");
            }
        }

        self.kv.meter_remove_zero(meter.key).await;
    }
}

fn member_matches(member: &str, intent: &ChargeIntent) -> bool {
    parse_member(member)
        .map(|(user, _, channel, token_type)| {
            user == intent.user && token_type == intent.token_type && channel.parse::<u64>().unwrap_or(0) == intent.channel_id
        })
        .unwrap_or(false)
}

#[async_trait]
impl GlobalJob for BillingJob {
    fn name(&self) -> &'static str {
        "billing_sweep"
    }

    fn interval(&self) -> Duration {
        Duration::from_secs(self.config.sweep_interval_secs)
    }

    async fn run_once(&self) {
        for meter in METERS {
            self.sweep_meter(meter).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::{MemoryKeyValueStore, MemoryRelationalStore, NullSearchLogSink};
    use crate::store::model_types::Product;
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct AlwaysApproveBilling {
        seen: Mutex<Vec<ChargeIntent>>,
    }

    #[async_trait]
    impl BillingService for AlwaysApproveBilling {
        async fn charge_batch(&self, intents: &[ChargeIntent]) -> Vec<crate::store::model_types::ChargeOutcome> {
            self.seen.lock().unwrap().extend_from_slice(intents);
            intents
                .iter()
                .map(|i| crate::store::model_types::ChargeOutcome {
                    event_id: i.event_id.clone(),
                    result: true,
                    result_msg: "ok".to_string(),
                })
                .collect()
        }
    }

    #[tokio::test]
    async fn sweep_charges_whole_units_and_keeps_remainder() {
        let kv: Arc<dyn KeyValueStore> = Arc::new(MemoryKeyValueStore::new());
        kv.meter_incrby("tokens_for_bill", "user-1:gpt-4:7:prompt", 2500).await;

        let relational = Arc::new(MemoryRelationalStore::new());
        relational.seed_product(Product { model: "gpt-4".into(), token_type: "prompt".into(), unit: "token".into(), price: 0.01 });

        let billing = Arc::new(AlwaysApproveBilling { seen: Mutex::new(Vec::new()) });
        let job = BillingJob::new(kv.clone(), relational, billing.clone(), Arc::new(NullSearchLogSink), BillingConfig::default());
        job.run_once().await;

        let seen = billing.seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].mount, 2);

        let remaining = kv.meter_range_ge("tokens_for_bill", 0).await;
        assert_eq!(remaining.iter().find(|(m, _)| m == "user-1:gpt-4:7:prompt").map(|(_, s)| *s), Some(500));
    }

    #[tokio::test]
    async fn unknown_product_is_skipped_without_panicking() {
        let kv: Arc<dyn KeyValueStore> = Arc::new(MemoryKeyValueStore::new());
        kv.meter_incrby("counts_for_bill", "user-1:unknown-model:1:count", 5).await;
        let relational = Arc::new(MemoryRelationalStore::new());
        let billing = Arc::new(AlwaysApproveBilling { seen: Mutex::new(Vec::new()) });
        let job = BillingJob::new(kv.clone(), relational, billing.clone(), Arc::new(NullSearchLogSink), BillingConfig::default());
        job.run_once().await;
        assert!(billing.seen.lock().unwrap().is_empty());
    }
}

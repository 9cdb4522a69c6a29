//! Model-to-channel routing table and upstream URL composition.
use std::collections::HashMap;
use std::sync::Arc;

use rustc_hash::FxHashMap;

use crate::cache::{EvictSubscriber, ResourceKind, TtlCache};
use crate::error::GatewayError;
use crate::store::model_types::{parse_model_redirect, DEFAULT_MODEL_NAME};
use crate::store::{Channel, RelationalStore};
use crate::util::stable_hash_bytes;

/// A channel bound to a model, with its redirect mapping pre-parsed.
#[derive(Debug, Clone)]
pub struct RoutedChannel {
    pub channel: Channel,
    pub model_redirect: HashMap<String, String>,
}

/// `model name -> candidate channels` built fresh from the relational
/// store on every refresh.
#[derive(Debug, Clone, Default)]
pub struct RoutingTable {
    by_model: FxHashMap<String, Vec<RoutedChannel>>,
}

impl RoutingTable {
    fn candidates(&self, model: &str) -> Option<&[RoutedChannel]> {
        self.by_model.get(model).map(Vec::as_slice)
    }

    /// Every model name with at least one active channel bound to it,
    /// sorted for a stable listing.
    fn model_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.by_model.keys().cloned().collect();
        names.sort();
        names
    }
}

/// The decision produced for a single request: which channel to call,
/// under what (possibly redirected) model name, and at what fully composed
/// upstream URL.
#[derive(Debug, Clone)]
pub struct RouteDecision {
    pub channel: Channel,
    pub proxy_model: String,
    pub proxy_url: String,
}

/// Builds and caches [`RoutingTable`], and resolves `(model, api_key,
/// request_path)` into a [`RouteDecision`].
pub struct Registry {
    store: Arc<dyn RelationalStore>,
    table: Arc<TtlCache<Arc<RoutingTable>>>,
}

const ROUTING_TABLE_TTL_SECS: u64 = 1800;

impl Registry {
    #[must_use]
    pub fn new(store: Arc<dyn RelationalStore>) -> Self {
        Self {
            store,
            table: Arc::new(TtlCache::new(ROUTING_TABLE_TTL_SECS)),
        }
    }

    /// A handle to the cache shared with [`RoutingTableEvictSubscriber`].
    #[must_use]
    pub fn evict_handle(&self) -> Arc<TtlCache<Arc<RoutingTable>>> {
        self.table.clone()
    }

    async fn build_table(&self) -> Arc<RoutingTable> {
        let rows = self.store.load_routing_rows().await;
        let mut by_model: FxHashMap<String, Vec<RoutedChannel>> = FxHashMap::default();
        for (channel, model, _binding) in rows {
            let model_redirect = parse_model_redirect(&channel.model_redirect_json);
            by_model
                .entry(model.name)
                .or_default()
                .push(RoutedChannel {
                    channel,
                    model_redirect,
                });
        }
        Arc::new(RoutingTable { by_model })
    }

    /// Return the cached table, rebuilding it if the TTL lapsed or a cache
    /// evict event fired. Single-flight: only one refresh runs at a time,
    /// other callers see the previous table until it lands.
    pub async fn table(&self) -> Arc<RoutingTable> {
        if self.table.try_begin_refresh() {
            let fresh = self.build_table().await;
            self.table.set(fresh.clone());
            self.table.finish_refresh();
            return fresh;
        }
        self.table.get().unwrap_or_else(|| Arc::new(RoutingTable::default()))
    }

    /// Unique active model names, for the `GET /models` listing.
    pub async fn list_models(&self) -> Vec<String> {
        self.table().await.model_names()
    }

    /// Resolve a model name and (optional) client api key into a concrete
    /// upstream call, preferring healthy channels, falling back to all
    /// channels when none are healthy ("degrade open"), and picking among
    /// multiple candidates by a stable hash of the api key so the same
    /// caller keeps hitting the same channel.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::ModelUnknown`] when no channel serves `model`.
    pub async fn resolve(
        &self,
        model: &str,
        api_key: Option<&str>,
        request_path: &str,
    ) -> Result<RouteDecision, GatewayError> {
        let table = self.table().await;
        let candidates = table
            .candidates(model)
            .ok_or_else(|| GatewayError::ModelUnknown(model.to_string()))?;
        if candidates.is_empty() {
            return Err(GatewayError::ModelUnknown(model.to_string()));
        }

        let healthy: Vec<&RoutedChannel> = candidates.iter().filter(|c| c.channel.health == 1).collect();
        let pool: Vec<&RoutedChannel> = if healthy.is_empty() {
            candidates.iter().collect()
        } else {
            healthy
        };

        let chosen = if pool.len() == 1 {
            pool[0]
        } else if let Some(key) = api_key {
            let index = (stable_hash_bytes(key.as_bytes()) as usize) % pool.len();
            pool[index]
        } else {
            pool[fastrand::usize(0..pool.len())]
        };

        let proxy_model = chosen
            .model_redirect
            .get(model)
            .cloned()
            .unwrap_or_else(|| model.to_string());
        let proxy_url = compose_upstream_url(&chosen.channel.upstream_url, request_path);

        Ok(RouteDecision {
            channel: chosen.channel.clone(),
            proxy_model,
            proxy_url,
        })
    }
}

/// Compose the final upstream URL from a channel's configured host and the
/// inbound request path, trailing `/v1` stripped:
/// - host ending in `#`: use the host verbatim, ignore the request path.
/// - host ending in `/`: host (sans trailing slash) + request path.
/// - otherwise: host + `/v1` + request path.
#[must_use]
pub fn compose_upstream_url(upstream_host: &str, request_path: &str) -> String {
    let path = request_path.strip_prefix("/v1").unwrap_or(request_path);
    if let Some(stripped) = upstream_host.strip_suffix('#') {
        stripped.to_string()
    } else if let Some(stripped) = upstream_host.strip_suffix('/') {
        format!("{stripped}{path}")
    } else {
        format!("{upstream_host}/v1{path}")
    }
}

/// Evicts the cached routing table on channel/model mutation events.
pub struct RoutingTableEvictSubscriber {
    table: Arc<TtlCache<Arc<RoutingTable>>>,
}

impl RoutingTableEvictSubscriber {
    #[must_use]
    pub fn new(table: Arc<TtlCache<Arc<RoutingTable>>>) -> Self {
        Self { table }
    }
}

impl EvictSubscriber for RoutingTableEvictSubscriber {
    fn module(&self) -> ResourceKind {
        ResourceKind::RoutingTable
    }

    fn on_evict(&self, _params: &[String]) {
        self.table.invalidate();
    }
}

#[must_use]
pub fn default_model_name_if_absent(model: Option<&str>) -> String {
    model.map_or_else(|| DEFAULT_MODEL_NAME.to_string(), ToString::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryRelationalStore;
    use crate::store::model_types::{ChannelBinding, EntityStatus, Model};

    fn seeded_store() -> MemoryRelationalStore {
        let store = MemoryRelationalStore::new();
        store.seed_model(Model {
            id: 1,
            name: "gpt-4".to_string(),
            status: EntityStatus::Active,
        });
        store.seed_channel(Channel {
            id: 1,
            name: "primary".to_string(),
            upstream_url: "https://a.example/".to_string(),
            upstream_secret: "s1".to_string(),
            status: EntityStatus::Active,
            health: 1,
            model_redirect_json: String::new(),
        });
        store.seed_channel(Channel {
            id: 2,
            name: "backup".to_string(),
            upstream_url: "https://b.example".to_string(),
            upstream_secret: "s2".to_string(),
            status: EntityStatus::Active,
            health: 0,
            model_redirect_json: String::new(),
        });
        store.seed_binding(ChannelBinding {
            channel_id: 1,
            model_id: 1,
        });
        store.seed_binding(ChannelBinding {
            channel_id: 2,
            model_id: 1,
        });
        store
    }

    #[tokio::test]
    async fn resolve_unknown_model_errors() {
        let registry = Registry::new(Arc::new(MemoryRelationalStore::new()));
        let err = registry.resolve("nope", None, "/v1/chat/completions").await.unwrap_err();
        assert!(matches!(err, GatewayError::ModelUnknown(m) if m == "nope"));
    }

    #[tokio::test]
    async fn resolve_prefers_healthy_channel() {
        let registry = Registry::new(Arc::new(seeded_store()));
        let decision = registry.resolve("gpt-4", Some("sk-a"), "/v1/chat/completions").await.unwrap();
        assert_eq!(decision.channel.id, 1);
        assert_eq!(decision.proxy_url, "https://a.example/chat/completions");
    }

    #[tokio::test]
    async fn resolve_degrades_open_when_all_unhealthy() {
        let store = MemoryRelationalStore::new();
        store.seed_model(Model {
            id: 1,
            name: "gpt-4".to_string(),
            status: EntityStatus::Active,
        });
        store.seed_channel(Channel {
            id: 9,
            name: "only".to_string(),
            upstream_url: "https://c.example#".to_string(),
            upstream_secret: "s".to_string(),
            status: EntityStatus::Active,
            health: 0,
            model_redirect_json: String::new(),
        });
        store.seed_binding(ChannelBinding {
            channel_id: 9,
            model_id: 1,
        });
        let registry = Registry::new(Arc::new(store));
        let decision = registry.resolve("gpt-4", None, "/v1/chat/completions").await.unwrap();
        assert_eq!(decision.channel.id, 9);
        assert_eq!(decision.proxy_url, "https://c.example");
    }

    #[test]
    fn compose_upstream_url_rules() {
        assert_eq!(
            compose_upstream_url("https://host#", "/v1/chat/completions"),
            "https://host"
        );
        assert_eq!(
            compose_upstream_url("https://host/", "/v1/chat/completions"),
            "https://host/chat/completions"
        );
        assert_eq!(
            compose_upstream_url("https://host", "/v1/chat/completions"),
            "https://host/v1/chat/completions"
        );
    }

    #[tokio::test]
    async fn same_api_key_sticks_to_same_channel_across_calls() {
        let registry = Registry::new(Arc::new(seeded_store()));
        // Force both channels into the pool by marking both healthy via a
        // second store build: degrade-open above covers the unhealthy
        // case, this covers the multi-candidate hashing path directly.
        let table = RoutingTable {
            by_model: {
                let mut m = FxHashMap::default();
                m.insert(
                    "gpt-4".to_string(),
                    vec![
                        RoutedChannel {
                            channel: Channel {
                                id: 1,
                                name: "a".into(),
                                upstream_url: "https://a.example#".into(),
                                upstream_secret: "s".into(),
                                status: EntityStatus::Active,
                                health: 1,
                                model_redirect_json: String::new(),
                            },
                            model_redirect: HashMap::new(),
                        },
                        RoutedChannel {
                            channel: Channel {
                                id: 2,
                                name: "b".into(),
                                upstream_url: "https://b.example#".into(),
                                upstream_secret: "s".into(),
                                status: EntityStatus::Active,
                                health: 1,
                                model_redirect_json: String::new(),
                            },
                            model_redirect: HashMap::new(),
                        },
                    ],
                );
                m
            },
        };
        registry.table.set(Arc::new(table));
        let first = registry.resolve("gpt-4", Some("sk-stable"), "/v1/x").await.unwrap();
        let second = registry.resolve("gpt-4", Some("sk-stable"), "/v1/x").await.unwrap();
        assert_eq!(first.channel.id, second.channel.id);
    }
}

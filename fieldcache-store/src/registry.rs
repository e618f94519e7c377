//! Identity-keyed table of shared items.

use std::sync::{Arc, Weak};

use chrono::Utc;
use dashmap::DashMap;
use fieldcache_core::{ApiClient, CacheConfig, Identity};

use crate::coordinator::NamespaceSink;
use crate::item::Item;
use crate::stats::CacheStats;
use crate::timeout::configured_client;

struct RegistryShared {
    items: DashMap<Identity, Arc<Item>>,
    api: Arc<dyn ApiClient>,
    config: CacheConfig,
}

impl NamespaceSink for RegistryShared {
    fn invalidate(&self, namespaces: &[String]) {
        let now = Utc::now();
        let expired: usize = self
            .items
            .iter()
            .map(|entry| entry.value().expire_namespaces(namespaces, now))
            .sum();
        tracing::debug!(namespaces = ?namespaces, expired, "Expired namespaced fields");
    }
}

/// Hands out one shared [`Item`] per identity.
///
/// Clones share the same table. Lookups that hit take a shard read lock;
/// creation goes through the map's entry API so concurrent first lookups of
/// an identity agree on a single item.
#[derive(Clone)]
pub struct ItemRegistry {
    shared: Arc<RegistryShared>,
}

impl ItemRegistry {
    /// Create a registry whose items fetch through `api`.
    ///
    /// A configured `fetch_timeout` is applied around `api` once, here.
    pub fn new(api: Arc<dyn ApiClient>, config: CacheConfig) -> Self {
        let api = configured_client(api, &config);
        Self {
            shared: Arc::new(RegistryShared {
                items: DashMap::new(),
                api,
                config,
            }),
        }
    }

    /// Create a registry with default configuration.
    pub fn with_defaults(api: Arc<dyn ApiClient>) -> Self {
        Self::new(api, CacheConfig::default())
    }

    pub fn config(&self) -> &CacheConfig {
        &self.shared.config
    }

    /// The shared item for `type_name/object_id`, created on first use.
    pub fn get(&self, type_name: &str, object_id: &str) -> Arc<Item> {
        self.get_identity(Identity::new(type_name, object_id))
    }

    pub fn get_identity(&self, identity: Identity) -> Arc<Item> {
        if let Some(item) = self.shared.items.get(&identity) {
            return Arc::clone(item.value());
        }

        let shared: Weak<RegistryShared> = Arc::downgrade(&self.shared);
        let sink: Weak<dyn NamespaceSink> = shared;
        let item = self
            .shared
            .items
            .entry(identity.clone())
            .or_insert_with(|| {
                tracing::trace!(identity = %identity, "Registering item");
                Arc::new(Item::build(
                    identity,
                    Arc::clone(&self.shared.api),
                    &self.shared.config,
                    Some(sink),
                ))
            });
        Arc::clone(item.value())
    }

    /// True if an item is registered for the identity.
    pub fn contains(&self, type_name: &str, object_id: &str) -> bool {
        self.shared
            .items
            .contains_key(&Identity::new(type_name, object_id))
    }

    /// Drop the registry's reference to an item, e.g. under memory
    /// pressure. Existing holders keep their `Arc`; the next lookup creates
    /// a fresh, empty item.
    pub fn remove(&self, identity: &Identity) -> Option<Arc<Item>> {
        self.shared.items.remove(identity).map(|(_, item)| item)
    }

    /// Flush the cache of every registered item.
    pub fn flush_all(&self) {
        for entry in self.shared.items.iter() {
            entry.value().flush_cache();
        }
    }

    /// Mark every cached field tagged with one of `namespaces` stale, across
    /// all items. Returns the number of fields expired.
    pub fn invalidate_namespaces(&self, namespaces: &[String]) -> usize {
        let now = Utc::now();
        self.shared
            .items
            .iter()
            .map(|entry| entry.value().expire_namespaces(namespaces, now))
            .sum()
    }

    /// Counters summed over all registered items.
    pub fn stats(&self) -> CacheStats {
        let mut total = CacheStats::default();
        for entry in self.shared.items.iter() {
            total.accumulate(&entry.value().stats());
        }
        total
    }

    pub fn len(&self) -> usize {
        self.shared.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shared.items.is_empty()
    }
}

impl std::fmt::Debug for ItemRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ItemRegistry")
            .field("items", &self.len())
            .field("config", &self.shared.config)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fieldcache_core::{CacheInfo, CachedField};
    use fieldcache_test_utils::{fixtures, MockApiClient, RemoteObject};
    use serde_json::json;
    use std::time::Duration;

    fn registry() -> (ItemRegistry, Arc<MockApiClient>) {
        let api = Arc::new(MockApiClient::new());
        (ItemRegistry::with_defaults(api.clone()), api)
    }

    #[test]
    fn test_same_identity_same_instance() {
        let (registry, _api) = registry();
        let a = registry.get("video", "x1");
        let b = registry.get("video", "x1");
        let c = registry.get("video", "x2");

        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(registry.len(), 2);
        assert!(registry.contains("video", "x1"));
        assert!(!registry.contains("user", "x1"));
    }

    #[test]
    fn test_concurrent_get_creates_one_item() {
        let (registry, _api) = registry();
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let registry = registry.clone();
                std::thread::spawn(move || registry.get("video", "race"))
            })
            .collect();
        let items: Vec<Arc<Item>> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert!(items.iter().all(|item| Arc::ptr_eq(item, &items[0])));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_remove_detaches_item() {
        let (registry, _api) = registry();
        let held = registry.get("video", "x1");
        held.store_fields(
            [("title".to_string(), CachedField::new(json!("A"), fixtures::fresh_info()))]
                .into_iter()
                .collect(),
        );

        let removed = registry.remove(held.identity()).unwrap();
        assert!(Arc::ptr_eq(&removed, &held));
        assert!(registry.is_empty());

        let fresh = registry.get("video", "x1");
        assert!(!Arc::ptr_eq(&fresh, &held));
        assert_eq!(fresh.cached_len(), 0);
        assert_eq!(held.cached_len(), 1);
    }

    #[test]
    fn test_flush_all() {
        let (registry, _api) = registry();
        for id in ["a", "b"] {
            registry.get("video", id).store_fields(
                [("title".to_string(), CachedField::new(json!(id), fixtures::fresh_info()))]
                    .into_iter()
                    .collect(),
            );
        }
        registry.flush_all();
        assert_eq!(registry.get("video", "a").cached_len(), 0);
        assert_eq!(registry.get("video", "b").cached_len(), 0);
    }

    #[test]
    fn test_invalidate_namespaces() {
        let (registry, _api) = registry();
        let tagged = CacheInfo::with_ttl(Duration::from_secs(3600)).with_namespace("feed");
        let video = registry.get("video", "x1");
        video.store_fields(
            [
                ("title".to_string(), CachedField::new(json!("A"), tagged.clone())),
                ("views".to_string(), CachedField::new(json!(1), fixtures::fresh_info())),
            ]
            .into_iter()
            .collect(),
        );
        registry.get("playlist", "p1").store_fields(
            [("name".to_string(), CachedField::new(json!("P"), tagged))]
                .into_iter()
                .collect(),
        );

        assert_eq!(registry.invalidate_namespaces(&["feed".to_string()]), 2);
        assert_eq!(registry.invalidate_namespaces(&["feed".to_string()]), 0);
    }

    #[tokio::test]
    async fn test_response_invalidations_reach_other_items() {
        let (registry, api) = registry();
        let feed_info = CacheInfo::with_ttl(Duration::from_secs(3600)).with_namespace("feed");
        let playlist = registry.get("playlist", "p1");
        playlist.store_fields(
            [("videos".to_string(), CachedField::new(json!(["x1"]), feed_info))]
                .into_iter()
                .collect(),
        );
        api.insert(
            Identity::new("video", "x1"),
            RemoteObject::new()
                .with_field("title", json!("New"))
                .with_namespace("feed")
                .with_invalidates(["feed"]),
        );

        let video = registry.get("video", "x1");
        let data = video.fields(["title"]).await.unwrap();
        assert_eq!(data.get("title"), Some(&json!("New")));

        // The playlist entry was expired; the video's own fresh data was not.
        let mut events = Vec::new();
        playlist.with_fields(["videos"], |e| events.push(e)).await;
        assert!(events[0].is_stalled());

        let mut events = Vec::new();
        video.with_fields(["title"], |e| events.push(e)).await;
        assert_eq!(events.len(), 1);
        assert!(events[0].is_terminal());
    }

    #[tokio::test]
    async fn test_stats_aggregate_across_items() {
        let (registry, api) = registry();
        api.insert(
            Identity::new("video", "x1"),
            RemoteObject::new().with_field("title", json!("T")),
        );
        api.insert(
            Identity::new("video", "x2"),
            RemoteObject::new().with_field("title", json!("U")),
        );

        registry.get("video", "x1").fields(["title"]).await.unwrap();
        registry.get("video", "x2").fields(["title"]).await.unwrap();
        registry.get("video", "x1").fields(["title"]).await.unwrap();

        let stats = registry.stats();
        assert_eq!(stats.misses, 2);
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.network_fetches, 2);
    }

    mod properties {
        use super::*;
        use fieldcache_test_utils::generators::arb_identity;
        use proptest::prelude::*;
        use std::collections::BTreeSet;

        proptest! {
            #[test]
            fn prop_one_item_per_identity(identities in prop::collection::vec(arb_identity(), 0..12)) {
                let (registry, _api) = registry();
                let items: Vec<Arc<Item>> = identities
                    .iter()
                    .map(|identity| registry.get_identity(identity.clone()))
                    .collect();

                let distinct: BTreeSet<&Identity> = identities.iter().collect();
                prop_assert_eq!(registry.len(), distinct.len());
                for (identity, item) in identities.iter().zip(&items) {
                    prop_assert_eq!(item.identity(), identity);
                    prop_assert!(Arc::ptr_eq(item, &registry.get_identity(identity.clone())));
                }
            }
        }
    }
}

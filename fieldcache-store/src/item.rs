//! A shared remote object and its field-loading protocol.

use std::sync::{Arc, RwLock, Weak};

use chrono::{DateTime, Utc};
use fieldcache_core::{
    field_set, ApiClient, CacheConfig, CacheInfo, CachedFields, FailurePayload, FetchError,
    FieldData, Identity,
};

use crate::coordinator::{FetchCoordinator, NamespaceSink};
use crate::delivery::{Delivery, FieldsEvent};
use crate::field_store::{read_store, write_store, FieldStore, SharedStore};
use crate::stats::{CacheStats, StatsRecorder};
use crate::timeout::configured_client;

/// One remote object. Obtain shared instances through
/// [`ItemRegistry::get`](crate::ItemRegistry::get) so every caller sees the
/// same cache.
pub struct Item {
    identity: Identity,
    store: SharedStore,
    coordinator: FetchCoordinator,
    stats: Arc<StatsRecorder>,
    failure_payload: FailurePayload,
}

impl Item {
    /// A standalone item that is not tracked by any registry.
    pub fn new(identity: Identity, api: Arc<dyn ApiClient>, config: &CacheConfig) -> Self {
        Self::build(identity, configured_client(api, config), config, None)
    }

    /// `api` must already carry any configured deadline.
    pub(crate) fn build(
        identity: Identity,
        api: Arc<dyn ApiClient>,
        config: &CacheConfig,
        sink: Option<Weak<dyn NamespaceSink>>,
    ) -> Self {
        let store: SharedStore = Arc::new(RwLock::new(FieldStore::new()));
        let stats = Arc::new(StatsRecorder::default());
        let coordinator = FetchCoordinator::new(
            identity.clone(),
            api,
            Arc::clone(&store),
            Arc::clone(&stats),
            sink,
            config,
        );
        Self {
            identity,
            store,
            coordinator,
            stats,
            failure_payload: config.failure_payload,
        }
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn type_name(&self) -> &str {
        self.identity.type_name()
    }

    pub fn object_id(&self) -> &str {
        self.identity.object_id()
    }

    /// Load `fields` from cache and/or network, reporting through
    /// `callback`.
    ///
    /// - all requested fields cached and fresh: one `Fresh` event, emitted
    ///   before this future first suspends, no network access;
    /// - nothing cached: one terminal event after the fetch;
    /// - some fields cached (fresh or stale) but a refresh is needed: a
    ///   `Stalled` snapshot of the cached fields, then the terminal event.
    ///
    /// The refresh only fetches `missing ∪ stale`. On success the
    /// terminal `Fresh` event holds the fetched values plus the fresh
    /// cached fields that were not refetched. On failure the store is left
    /// untouched and `Failed` is emitted.
    ///
    /// Dropping the returned future before it completes forfeits the
    /// remaining events. Inside a tokio runtime the fetch itself still
    /// completes and populates the cache. Any executor can drive this
    /// future; without a tokio runtime the fetch runs on the caller that
    /// issued it, and dropping that caller's future abandons the fetch.
    pub async fn with_fields<I, S, F>(&self, fields: I, callback: F)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
        F: FnMut(FieldsEvent),
    {
        let fields = field_set(fields);
        let mut delivery = Delivery::new(callback);
        let partition = read_store(&self.store).partition(&fields, Utc::now());

        if !partition.needs_fetch() {
            self.stats.hit();
            tracing::trace!(identity = %self.identity, fields = ?fields, "Served from cache");
            delivery.fresh(partition.fresh_data());
            return;
        }

        self.stats.miss();
        let waiter = self.coordinator.fetch(partition.authoritative());

        let snapshot = partition.present_data();
        if partition.has_present() {
            self.stats.stalled();
            delivery.stalled(snapshot.clone());
        }

        match waiter.wait().await {
            Ok(fetched) => {
                let mut data = partition.fresh_data();
                data.extend(fetched);
                delivery.fresh(data);
            }
            Err(error) => {
                let cached = match self.failure_payload {
                    FailurePayload::Empty => None,
                    FailurePayload::CachedSnapshot => {
                        partition.has_present().then_some(snapshot)
                    }
                };
                delivery.fail(error, cached);
            }
        }
    }

    /// Await only the authoritative result for `fields`.
    pub async fn fields<I, S>(&self, fields: I) -> Result<FieldData, FetchError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut terminal = None;
        self.with_fields(fields, |event| {
            if event.is_terminal() {
                terminal = Some(event);
            }
        })
        .await;

        terminal
            .and_then(FieldsEvent::into_result)
            .unwrap_or_else(|| {
                Err(FetchError::Abandoned {
                    identity: self.identity.to_string(),
                })
            })
    }

    /// Cached values for `fields`, fresh or stale, without touching the
    /// network.
    pub fn cached<I, S>(&self, fields: I) -> FieldData
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        read_store(&self.store).values(&field_set(fields))
    }

    /// Seed the cache with values obtained elsewhere (e.g. an object
    /// embedded in a list response). Last writer wins per field.
    pub fn store_fields(&self, values: CachedFields) {
        write_store(&self.store).merge(values);
    }

    /// Cache info of the most recent successful fetch.
    pub fn cache_info(&self) -> Option<CacheInfo> {
        read_store(&self.store).last_cache_info().cloned()
    }

    /// Drop all cached fields. In-flight fetches are not cancelled and
    /// repopulate the store when they complete.
    pub fn flush_cache(&self) {
        tracing::debug!(identity = %self.identity, "Flushing item cache");
        write_store(&self.store).flush();
    }

    /// Number of cached fields.
    pub fn cached_len(&self) -> usize {
        read_store(&self.store).len()
    }

    pub fn stats(&self) -> CacheStats {
        self.stats.snapshot()
    }

    /// Network fetches currently in flight for this item.
    pub fn pending_fetches(&self) -> usize {
        self.coordinator.pending_count()
    }

    pub(crate) fn expire_namespaces(&self, namespaces: &[String], now: DateTime<Utc>) -> usize {
        let mut store = write_store(&self.store);
        namespaces
            .iter()
            .map(|namespace| store.expire_namespace(namespace, now))
            .sum()
    }
}

impl std::fmt::Debug for Item {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Item")
            .field("identity", &self.identity)
            .field("cached_fields", &self.cached_len())
            .field("pending_fetches", &self.pending_fetches())
            .finish()
    }
}

//! In-flight fetch deduplication for one item.
//!
//! The coordinator keeps a table of pending fetches, each covering a set of
//! fields. A new request attaches to every pending fetch that overlaps it
//! and only issues a network call for the fields nobody is fetching yet.
//! Inside a tokio runtime fetches run on their own task, so a caller dropping
//! its future does not stop the fetch or starve other listeners. Without a
//! runtime the fetch is driven by the waiter of the caller that issued it.

use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::Utc;
use fieldcache_core::{
    ApiClient, CacheConfig, CacheInfo, CachedField, FetchError, FetchRequest, FetchResponse,
    FieldData, FieldSet, Identity,
};
use tokio::sync::oneshot;

use crate::field_store::{read_store, write_store, SharedStore};
use crate::stats::StatsRecorder;

/// Result of one network fetch, shared by all its listeners.
pub(crate) type FetchOutcome = Result<Arc<FieldData>, FetchError>;

/// Receives namespace invalidations declared by API responses.
pub(crate) trait NamespaceSink: Send + Sync {
    fn invalidate(&self, namespaces: &[String]);
}

struct PendingFetch {
    id: u64,
    fields: FieldSet,
    listeners: Vec<oneshot::Sender<FetchOutcome>>,
}

type PendingTable = Arc<Mutex<Vec<PendingFetch>>>;

fn lock_pending(pending: &PendingTable) -> MutexGuard<'_, Vec<PendingFetch>> {
    pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Deduplicates concurrent fetches for one identity.
pub struct FetchCoordinator {
    identity: Identity,
    api: Arc<dyn ApiClient>,
    store: SharedStore,
    stats: Arc<StatsRecorder>,
    sink: Option<Weak<dyn NamespaceSink>>,
    default_ttl: Duration,
    revalidate: bool,
    pending: PendingTable,
    next_id: AtomicU64,
}

impl FetchCoordinator {
    pub(crate) fn new(
        identity: Identity,
        api: Arc<dyn ApiClient>,
        store: SharedStore,
        stats: Arc<StatsRecorder>,
        sink: Option<Weak<dyn NamespaceSink>>,
        config: &CacheConfig,
    ) -> Self {
        Self {
            identity,
            api,
            store,
            stats,
            sink,
            default_ttl: config.default_ttl,
            revalidate: config.revalidate_with_validator,
            pending: Arc::new(Mutex::new(Vec::new())),
            next_id: AtomicU64::new(0),
        }
    }

    /// Request `fields` from the network, sharing in-flight work.
    ///
    /// A new network fetch is spawned onto the current tokio runtime. Outside
    /// any runtime it runs when the returned waiter is awaited; dropping that
    /// waiter early abandons the fetch for everyone attached to it.
    pub fn fetch(&self, fields: FieldSet) -> FetchWaiter {
        let mut receivers = Vec::new();
        let mut uncovered = fields.clone();

        let mut pending = lock_pending(&self.pending);
        for fetch in pending.iter_mut() {
            if uncovered.is_empty() {
                break;
            }
            if fetch.fields.iter().any(|name| uncovered.contains(name)) {
                let (tx, rx) = oneshot::channel();
                fetch.listeners.push(tx);
                receivers.push(rx);
                uncovered.retain(|name| !fetch.fields.contains(name));
            }
        }

        if !receivers.is_empty() {
            self.stats.coalesced();
            tracing::debug!(
                identity = %self.identity,
                fields = ?fields,
                joined = receivers.len(),
                "Attached to in-flight fetch"
            );
        }

        let issue = if uncovered.is_empty() {
            None
        } else {
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            let (tx, rx) = oneshot::channel();
            pending.push(PendingFetch {
                id,
                fields: uncovered.clone(),
                listeners: vec![tx],
            });
            receivers.push(rx);
            Some((id, uncovered))
        };
        drop(pending);

        let inline = issue.and_then(|(id, uncovered)| self.spawn_fetch(id, uncovered));

        FetchWaiter {
            identity: self.identity.clone(),
            fields,
            receivers,
            inline,
        }
    }

    /// Number of network fetches currently in flight.
    pub fn pending_count(&self) -> usize {
        lock_pending(&self.pending).len()
    }

    /// Returns the task when no runtime is available to spawn it on.
    fn spawn_fetch(&self, id: u64, fields: FieldSet) -> Option<FetchTask> {
        let validator = if self.revalidate {
            read_store(&self.store).common_validator(&fields, Utc::now())
        } else {
            None
        };
        let request = FetchRequest::new(self.identity.clone(), fields).with_validator(validator);

        tracing::debug!(
            identity = %request.identity,
            fields = ?request.fields,
            conditional = request.validator.is_some(),
            "Issuing network fetch"
        );

        let task = FetchTask {
            request,
            api: Arc::clone(&self.api),
            store: Arc::clone(&self.store),
            stats: Arc::clone(&self.stats),
            sink: self.sink.clone(),
            default_ttl: self.default_ttl,
            completion: Completion {
                pending: Arc::clone(&self.pending),
                id,
            },
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(task.run());
                None
            }
            Err(_) => {
                tracing::trace!(
                    identity = %task.request.identity,
                    "No tokio runtime, fetch runs on the waiting caller"
                );
                Some(task)
            }
        }
    }
}

/// Removes a pending fetch from the table. Dropping it without calling
/// [`take_listeners`](Self::take_listeners) (e.g. the task panicked) drops
/// the senders, which surfaces as [`FetchError::Abandoned`] to listeners.
struct Completion {
    pending: PendingTable,
    id: u64,
}

impl Completion {
    fn take_listeners(&self) -> Vec<oneshot::Sender<FetchOutcome>> {
        let mut pending = lock_pending(&self.pending);
        match pending.iter().position(|fetch| fetch.id == self.id) {
            Some(index) => pending.swap_remove(index).listeners,
            None => Vec::new(),
        }
    }
}

impl Drop for Completion {
    fn drop(&mut self) {
        let _ = self.take_listeners();
    }
}

struct FetchTask {
    request: FetchRequest,
    api: Arc<dyn ApiClient>,
    store: SharedStore,
    stats: Arc<StatsRecorder>,
    sink: Option<Weak<dyn NamespaceSink>>,
    default_ttl: Duration,
    completion: Completion,
}

impl FetchTask {
    async fn run(self) {
        let outcome = self.execute().await;
        let listeners = self.completion.take_listeners();
        tracing::trace!(
            identity = %self.request.identity,
            listeners = listeners.len(),
            ok = outcome.is_ok(),
            "Fetch complete, notifying listeners"
        );
        for listener in listeners {
            // A listener whose caller went away is fine to skip.
            let _ = listener.send(outcome.clone());
        }
    }

    async fn execute(&self) -> FetchOutcome {
        self.stats.network_fetch();
        let response = match self.api.fetch(&self.request).await {
            Ok(response) => response,
            Err(error) => {
                self.stats.failure();
                tracing::warn!(
                    identity = %self.request.identity,
                    fields = ?self.request.fields,
                    error = %error,
                    "Network fetch failed"
                );
                return Err(error);
            }
        };

        // Invalidate other items before merging so the fresh values below
        // are not expired by their own response.
        let invalidates = declared_invalidations(&response);
        if !invalidates.is_empty() {
            if let Some(sink) = self.sink.as_ref().and_then(Weak::upgrade) {
                tracing::debug!(namespaces = ?invalidates, "Response invalidates namespaces");
                sink.invalidate(&invalidates);
            }
        }

        let mut store = write_store(&self.store);
        let data = match response {
            FetchResponse::Fields(values) => {
                if let Some(info) = values
                    .values()
                    .map(|field| &field.cache_info)
                    .max_by_key(|info| info.cached_at())
                {
                    store.set_last_cache_info(info.clone());
                }
                let data: FieldData = values
                    .iter()
                    .map(|(name, field)| (name.clone(), field.value.clone()))
                    .collect();
                store.merge(values);
                data
            }
            FetchResponse::Bare(values) => {
                let info = CacheInfo::with_ttl(self.default_ttl);
                store.set_last_cache_info(info.clone());
                store.merge(
                    values
                        .iter()
                        .map(|(name, value)| {
                            (name.clone(), CachedField::new(value.clone(), info.clone()))
                        })
                        .collect(),
                );
                values
            }
            FetchResponse::NotModified(info) => {
                let count = store.revalidate(&self.request.fields, &info);
                tracing::debug!(
                    identity = %self.request.identity,
                    revalidated = count,
                    "Validator matched, cached fields kept"
                );
                store.set_last_cache_info(info);
                store.values(&self.request.fields)
            }
        };
        drop(store);

        for name in self.request.fields.iter().filter(|name| !data.contains_key(*name)) {
            tracing::debug!(
                identity = %self.request.identity,
                field = %name,
                "Field absent from response"
            );
        }

        Ok(Arc::new(data))
    }
}

fn declared_invalidations(response: &FetchResponse) -> Vec<String> {
    let mut namespaces: Vec<String> = match response {
        FetchResponse::Fields(values) => values
            .values()
            .flat_map(|field| field.cache_info.invalidates().iter().cloned())
            .collect(),
        FetchResponse::NotModified(info) => info.invalidates().to_vec(),
        FetchResponse::Bare(_) => Vec::new(),
    };
    namespaces.sort();
    namespaces.dedup();
    namespaces
}

/// Pending result of [`FetchCoordinator::fetch`].
pub struct FetchWaiter {
    identity: Identity,
    fields: FieldSet,
    receivers: Vec<oneshot::Receiver<FetchOutcome>>,
    inline: Option<FetchTask>,
}

impl FetchWaiter {
    /// The fields this waiter resolves.
    pub fn fields(&self) -> &FieldSet {
        &self.fields
    }

    /// Wait for every fetch this request depends on. Returns the fetched
    /// values restricted to the requested fields, or the first failure.
    pub async fn wait(self) -> Result<FieldData, FetchError> {
        if let Some(task) = self.inline {
            task.run().await;
        }
        let mut data = FieldData::new();
        for receiver in self.receivers {
            let values = receiver.await.unwrap_or_else(|_| {
                Err(FetchError::Abandoned {
                    identity: self.identity.to_string(),
                })
            })?;
            data.extend(
                values
                    .iter()
                    .filter(|(name, _)| self.fields.contains(*name))
                    .map(|(name, value)| (name.clone(), value.clone())),
            );
        }
        Ok(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::field_store::FieldStore;
    use async_trait::async_trait;
    use fieldcache_core::field_set;
    use fieldcache_test_utils::{block_on, MockApiClient, RemoteObject};
    use serde_json::json;
    use std::sync::RwLock;

    fn video() -> Identity {
        Identity::new("video", "x1")
    }

    fn coordinator(api: Arc<dyn ApiClient>) -> (FetchCoordinator, SharedStore, Arc<StatsRecorder>) {
        coordinator_with(api, &CacheConfig::default())
    }

    fn coordinator_with(
        api: Arc<dyn ApiClient>,
        config: &CacheConfig,
    ) -> (FetchCoordinator, SharedStore, Arc<StatsRecorder>) {
        let store: SharedStore = Arc::new(RwLock::new(FieldStore::new()));
        let stats = Arc::new(StatsRecorder::default());
        let coordinator = FetchCoordinator::new(
            video(),
            api,
            Arc::clone(&store),
            Arc::clone(&stats),
            None,
            config,
        );
        (coordinator, store, stats)
    }

    fn mock() -> Arc<MockApiClient> {
        let api = Arc::new(MockApiClient::new());
        api.insert(
            video(),
            RemoteObject::new()
                .with_field("title", json!("Hello"))
                .with_field("views", json!(42))
                .with_field("owner", json!("u1")),
        );
        api
    }

    #[tokio::test]
    async fn test_fetch_merges_into_store() {
        let api = mock();
        let (coordinator, store, stats) = coordinator(api.clone());

        let data = coordinator
            .fetch(field_set(["title", "views"]))
            .wait()
            .await
            .unwrap();

        assert_eq!(data.get("title"), Some(&json!("Hello")));
        assert_eq!(read_store(&store).len(), 2);
        assert!(read_store(&store).last_cache_info().is_some());
        assert_eq!(api.request_count(), 1);
        assert_eq!(stats.snapshot().network_fetches, 1);
        assert_eq!(coordinator.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_covered_request_joins_in_flight_fetch() {
        let api = mock();
        api.pause();
        let (coordinator, _store, stats) = coordinator(api.clone());

        let first = coordinator.fetch(field_set(["title", "views"]));
        let second = coordinator.fetch(field_set(["title"]));
        assert_eq!(coordinator.pending_count(), 1);
        assert_eq!(stats.snapshot().coalesced_requests, 1);

        api.resume();
        let (a, b) = tokio::join!(first.wait(), second.wait());
        assert_eq!(a.unwrap().len(), 2);
        let b = b.unwrap();
        assert_eq!(b.len(), 1);
        assert!(b.contains_key("title"));
        assert_eq!(api.request_count(), 1);
    }

    #[tokio::test]
    async fn test_partial_overlap_fetches_only_delta() {
        let api = mock();
        api.pause();
        let (coordinator, _store, _stats) = coordinator(api.clone());

        let first = coordinator.fetch(field_set(["title"]));
        let second = coordinator.fetch(field_set(["title", "owner"]));
        assert_eq!(coordinator.pending_count(), 2);

        api.resume();
        let (a, b) = tokio::join!(first.wait(), second.wait());
        assert_eq!(a.unwrap().len(), 1);
        assert_eq!(b.unwrap(), {
            let mut expected = FieldData::new();
            expected.insert("title".to_string(), json!("Hello"));
            expected.insert("owner".to_string(), json!("u1"));
            expected
        });

        let requested: Vec<FieldSet> = api.requests().into_iter().map(|r| r.fields).collect();
        assert_eq!(requested.len(), 2);
        assert!(requested.contains(&field_set(["title"])));
        assert!(requested.contains(&field_set(["owner"])));
    }

    #[tokio::test]
    async fn test_failure_reaches_every_listener_and_leaves_store() {
        let api = mock();
        api.pause();
        api.fail_next(FetchError::network("video/x1", "boom"));
        let (coordinator, store, stats) = coordinator(api.clone());

        let first = coordinator.fetch(field_set(["title"]));
        let second = coordinator.fetch(field_set(["title"]));
        api.resume();

        let (a, b) = tokio::join!(first.wait(), second.wait());
        assert!(matches!(a, Err(FetchError::NetworkFailure { .. })));
        assert_eq!(a, b);
        assert!(read_store(&store).is_empty());
        assert_eq!(stats.snapshot().failures, 1);
        assert_eq!(coordinator.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_validator_sent_and_not_modified_restamps() {
        let api = mock();
        api.insert(
            video(),
            RemoteObject::new()
                .with_field("title", json!("Server"))
                .with_validator("etag-7"),
        );
        let (coordinator, store, _stats) = coordinator(api.clone());
        let past = Utc::now() - chrono::Duration::seconds(30);
        write_store(&store).merge(
            [(
                "title".to_string(),
                CachedField::new(
                    json!("Cached"),
                    CacheInfo::expiring_at(past).with_validator("etag-7"),
                ),
            )]
            .into_iter()
            .collect(),
        );

        let data = coordinator.fetch(field_set(["title"])).wait().await.unwrap();

        assert_eq!(data.get("title"), Some(&json!("Cached")));
        assert_eq!(api.requests()[0].validator.as_deref(), Some("etag-7"));
        let guard = read_store(&store);
        let field = guard.get_field("title").unwrap();
        assert!(field.cache_info.is_fresh(Utc::now()));
    }

    struct BareClient;

    #[async_trait]
    impl ApiClient for BareClient {
        async fn fetch(&self, request: &FetchRequest) -> Result<FetchResponse, FetchError> {
            Ok(FetchResponse::Bare(
                request
                    .fields
                    .iter()
                    .map(|name| (name.clone(), json!(name.len())))
                    .collect(),
            ))
        }
    }

    #[tokio::test]
    async fn test_bare_response_uses_default_ttl() {
        let (coordinator, store, _stats) = coordinator(Arc::new(BareClient));
        let data = coordinator.fetch(field_set(["abc"])).wait().await.unwrap();

        assert_eq!(data.get("abc"), Some(&json!(3)));
        let guard = read_store(&store);
        let info = &guard.get_field("abc").unwrap().cache_info;
        let ttl = info.expires_at() - info.cached_at();
        assert_eq!(ttl.num_seconds() as u64, CacheConfig::default().default_ttl.as_secs());
    }

    struct PanickingClient;

    #[async_trait]
    impl ApiClient for PanickingClient {
        async fn fetch(&self, _request: &FetchRequest) -> Result<FetchResponse, FetchError> {
            panic!("client bug");
        }
    }

    #[tokio::test]
    async fn test_panicking_fetch_is_abandoned() {
        let (coordinator, _store, _stats) = coordinator(Arc::new(PanickingClient));
        let result = coordinator.fetch(field_set(["title"])).wait().await;

        assert!(matches!(result, Err(FetchError::Abandoned { .. })));
        assert_eq!(coordinator.pending_count(), 0);
    }

    fn seed_tagged(store: &SharedStore, value: serde_json::Value, validator: &str) {
        let past = Utc::now() - chrono::Duration::seconds(30);
        write_store(store).merge(
            [(
                "title".to_string(),
                CachedField::new(value, CacheInfo::expiring_at(past).with_validator(validator)),
            )]
            .into_iter()
            .collect(),
        );
    }

    #[tokio::test]
    async fn test_revalidation_disabled_refetches_values() {
        let api = mock();
        api.insert(
            video(),
            RemoteObject::new()
                .with_field("title", json!("Server"))
                .with_validator("e1"),
        );
        let config = CacheConfig::default().with_revalidation(false);
        let (coordinator, store, _stats) = coordinator_with(api.clone(), &config);
        seed_tagged(&store, json!("Cached"), "e1");

        let data = coordinator.fetch(field_set(["title"])).wait().await.unwrap();

        assert_eq!(api.requests()[0].validator, None);
        assert_eq!(data.get("title"), Some(&json!("Server")));
        assert_eq!(read_store(&store).get_field("title").unwrap().value, json!("Server"));
    }

    #[tokio::test]
    async fn test_waiter_reports_requested_fields() {
        let (coordinator, _store, _stats) = coordinator(mock());
        let waiter = coordinator.fetch(field_set(["title", "views"]));
        assert_eq!(waiter.fields(), &field_set(["title", "views"]));
        assert_eq!(waiter.wait().await.unwrap().len(), 2);
    }

    #[test]
    fn test_fetch_without_runtime_runs_on_waiter() {
        let api = mock();
        let (coordinator, store, _stats) = coordinator_with(api.clone(), &CacheConfig::default());

        let first = coordinator.fetch(field_set(["title"]));
        let joined = coordinator.fetch(field_set(["title"]));
        assert_eq!(coordinator.pending_count(), 1);

        let data = block_on(first.wait()).unwrap();
        assert_eq!(data.get("title"), Some(&json!("Hello")));
        assert_eq!(block_on(joined.wait()).unwrap(), data);
        assert_eq!(api.request_count(), 1);
        assert_eq!(coordinator.pending_count(), 0);
        assert_eq!(read_store(&store).len(), 1);
    }

    #[test]
    fn test_dropped_inline_waiter_abandons_joined_requests() {
        let (coordinator, _store, _stats) = coordinator(mock());

        let first = coordinator.fetch(field_set(["title"]));
        let joined = coordinator.fetch(field_set(["title"]));
        drop(first);

        assert!(matches!(
            block_on(joined.wait()),
            Err(FetchError::Abandoned { .. })
        ));
        assert_eq!(coordinator.pending_count(), 0);
    }
}

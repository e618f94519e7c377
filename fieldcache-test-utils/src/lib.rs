//! Field Cache Test Utilities
//!
//! Shared test infrastructure for the field cache workspace:
//! - An in-memory mock API with a pause gate and scripted failures
//! - Proptest generators for identities, fields and cache metadata
//! - Fixtures for common scenarios

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll, Wake, Waker};
use std::thread::{self, Thread};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;

pub use fieldcache_core::{
    field_set, ApiClient, CacheConfig, CacheInfo, CachedField, CachedFields, FetchError,
    FetchRequest, FetchResponse, FieldData, FieldSet, Identity,
};

// ============================================================================
// MOCK API
// ============================================================================

/// Server-side state of one object held by [`MockApiClient`].
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteObject {
    fields: FieldData,
    validator: Option<String>,
    namespace: Option<String>,
    invalidates: Vec<String>,
    ttl: Duration,
    untimed: bool,
}

impl RemoteObject {
    pub fn new() -> Self {
        Self {
            fields: FieldData::new(),
            validator: None,
            namespace: None,
            invalidates: Vec::new(),
            ttl: Duration::from_secs(300),
            untimed: false,
        }
    }

    pub fn with_field(mut self, name: impl Into<String>, value: serde_json::Value) -> Self {
        self.fields.insert(name.into(), value);
        self
    }

    pub fn with_validator(mut self, validator: impl Into<String>) -> Self {
        self.validator = Some(validator.into());
        self
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    pub fn with_invalidates<I, S>(mut self, namespaces: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.invalidates = namespaces.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Answer with [`FetchResponse::Bare`] values that carry no cache info.
    pub fn untimed(mut self) -> Self {
        self.untimed = true;
        self
    }

    /// Cache info attached to a response served now.
    pub fn cache_info(&self) -> CacheInfo {
        let mut info = CacheInfo::with_ttl(self.ttl).with_invalidates(self.invalidates.clone());
        if let Some(validator) = &self.validator {
            info = info.with_validator(validator.clone());
        }
        if let Some(namespace) = &self.namespace {
            info = info.with_namespace(namespace.clone());
        }
        info
    }

    fn respond(&self, request: &FetchRequest) -> FetchResponse {
        if request.validator.is_some() && request.validator == self.validator {
            return FetchResponse::NotModified(self.cache_info());
        }
        let values: FieldData = self
            .fields
            .iter()
            .filter(|(name, _)| request.fields.contains(*name))
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect();
        if self.untimed {
            FetchResponse::Bare(values)
        } else {
            FetchResponse::uniform(values, self.cache_info())
        }
    }
}

impl Default for RemoteObject {
    fn default() -> Self {
        Self::new()
    }
}

/// In-memory [`ApiClient`] that records every request.
///
/// [`pause`](Self::pause) holds all fetches (after they are recorded) until
/// [`resume`](Self::resume), which lets tests line up concurrent callers
/// behind one in-flight request.
#[derive(Debug)]
pub struct MockApiClient {
    objects: Mutex<HashMap<Identity, RemoteObject>>,
    requests: Mutex<Vec<FetchRequest>>,
    failures: Mutex<VecDeque<FetchError>>,
    offline: AtomicBool,
    gate: watch::Sender<bool>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl MockApiClient {
    pub fn new() -> Self {
        let (gate, _) = watch::channel(true);
        Self {
            objects: Mutex::new(HashMap::new()),
            requests: Mutex::new(Vec::new()),
            failures: Mutex::new(VecDeque::new()),
            offline: AtomicBool::new(false),
            gate,
        }
    }

    /// Add or replace an object on the server.
    pub fn insert(&self, identity: Identity, object: RemoteObject) {
        lock(&self.objects).insert(identity, object);
    }

    pub fn requests(&self) -> Vec<FetchRequest> {
        lock(&self.requests).clone()
    }

    pub fn request_count(&self) -> usize {
        lock(&self.requests).len()
    }

    pub fn pause(&self) {
        self.gate.send_replace(false);
    }

    pub fn resume(&self) {
        self.gate.send_replace(true);
    }

    /// Fail the next fetch with `error`. Queued failures are consumed in
    /// order, one per fetch.
    pub fn fail_next(&self, error: FetchError) {
        lock(&self.failures).push_back(error);
    }

    /// While offline every fetch fails with a network error.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }
}

impl Default for MockApiClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ApiClient for MockApiClient {
    async fn fetch(&self, request: &FetchRequest) -> Result<FetchResponse, FetchError> {
        lock(&self.requests).push(request.clone());

        let mut gate = self.gate.subscribe();
        // The sender lives in `self`, so the channel cannot close here.
        let _ = gate.wait_for(|open| *open).await;

        if let Some(error) = lock(&self.failures).pop_front() {
            return Err(error);
        }
        if self.offline.load(Ordering::SeqCst) {
            return Err(FetchError::network(request.identity.to_string(), "offline"));
        }
        match lock(&self.objects).get(&request.identity) {
            Some(object) => Ok(object.respond(request)),
            None => Err(FetchError::network(
                request.identity.to_string(),
                "object not found",
            )),
        }
    }
}

/// Poll `condition` until it holds, yielding to the runtime in between.
///
/// # Panics
///
/// Panics if the condition does not hold within about five seconds.
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..5000 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    panic!("condition not reached");
}

/// Drive `future` to completion on the current thread with no async
/// runtime, parking between polls.
pub fn block_on<F: Future>(future: F) -> F::Output {
    struct ThreadWaker(Thread);

    impl Wake for ThreadWaker {
        fn wake(self: Arc<Self>) {
            self.0.unpark();
        }
    }

    let waker = Waker::from(Arc::new(ThreadWaker(thread::current())));
    let mut cx = Context::from_waker(&waker);
    let mut future = pin!(future);
    loop {
        match future.as_mut().poll(&mut cx) {
            Poll::Ready(output) => return output,
            Poll::Pending => thread::park(),
        }
    }
}

/// Install a test-friendly tracing subscriber honouring `RUST_LOG`.
/// Safe to call from every test.
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for field cache types.

    use super::*;
    use proptest::prelude::*;

    /// Generate an identity from a small pool of types.
    pub fn arb_identity() -> impl Strategy<Value = Identity> {
        (
            prop_oneof![Just("video"), Just("user"), Just("playlist")],
            "[a-z0-9]{1,8}",
        )
            .prop_map(|(type_name, object_id)| Identity::new(type_name, object_id))
    }

    /// Field names drawn from a fixed vocabulary so sets overlap.
    pub fn arb_field_name() -> impl Strategy<Value = String> {
        prop::sample::select(vec!["title", "views", "owner", "duration", "tags", "thumbnail"])
            .prop_map(String::from)
    }

    pub fn arb_field_set() -> impl Strategy<Value = FieldSet> {
        prop::collection::btree_set(arb_field_name(), 0..6)
    }

    pub fn arb_field_value() -> impl Strategy<Value = serde_json::Value> {
        prop_oneof![
            Just(serde_json::Value::Null),
            any::<bool>().prop_map(serde_json::Value::from),
            any::<i64>().prop_map(serde_json::Value::from),
            "[ -~]{0,16}".prop_map(serde_json::Value::from),
        ]
    }

    /// Cache info that is either fresh for an hour or expired a minute ago.
    pub fn arb_cache_info() -> impl Strategy<Value = CacheInfo> {
        any::<bool>().prop_map(|fresh| {
            if fresh {
                fixtures::fresh_info()
            } else {
                fixtures::stale_info()
            }
        })
    }

    /// Cached fields with a mix of fresh and stale entries.
    pub fn arb_cached_fields() -> impl Strategy<Value = CachedFields> {
        prop::collection::btree_map(
            arb_field_name(),
            (arb_field_value(), arb_cache_info())
                .prop_map(|(value, info)| CachedField::new(value, info)),
            0..6,
        )
    }
}

// ============================================================================
// TEST FIXTURES
// ============================================================================

pub mod fixtures {
    //! Ready-made values for common scenarios.

    use super::*;
    use chrono::Utc;

    pub fn video_identity() -> Identity {
        Identity::new("video", "x1")
    }

    /// Fresh for the next hour.
    pub fn fresh_info() -> CacheInfo {
        CacheInfo::with_ttl(Duration::from_secs(3600))
    }

    /// Expired one minute ago.
    pub fn stale_info() -> CacheInfo {
        let now = Utc::now();
        CacheInfo::new(now - chrono::Duration::minutes(5), now - chrono::Duration::minutes(1))
    }

    /// Build field data from name/value pairs.
    pub fn data<const N: usize>(pairs: [(&str, serde_json::Value); N]) -> FieldData {
        pairs
            .into_iter()
            .map(|(name, value)| (name.to_string(), value))
            .collect()
    }

    /// Wrap every value in `values` with the same cache info.
    pub fn cached(values: FieldData, info: CacheInfo) -> CachedFields {
        values
            .into_iter()
            .map(|(name, value)| (name, CachedField::new(value, info.clone())))
            .collect()
    }
}

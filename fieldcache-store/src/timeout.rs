//! Deadline decorator for API clients.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use fieldcache_core::{ApiClient, CacheConfig, FetchError, FetchRequest, FetchResponse};

/// Fails any fetch that takes longer than `timeout` with
/// [`FetchError::Timeout`].
///
/// The deadline needs the tokio timer. Outside a runtime the call is passed
/// through untimed.
pub struct TimeoutApiClient {
    inner: Arc<dyn ApiClient>,
    timeout: Duration,
}

impl TimeoutApiClient {
    pub fn new(inner: Arc<dyn ApiClient>, timeout: Duration) -> Self {
        Self { inner, timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

#[async_trait]
impl ApiClient for TimeoutApiClient {
    async fn fetch(&self, request: &FetchRequest) -> Result<FetchResponse, FetchError> {
        if tokio::runtime::Handle::try_current().is_err() {
            tracing::warn!(
                identity = %request.identity,
                "No tokio runtime, fetch deadline not enforced"
            );
            return self.inner.fetch(request).await;
        }
        match tokio::time::timeout(self.timeout, self.inner.fetch(request)).await {
            Ok(result) => result,
            Err(_) => Err(FetchError::Timeout {
                identity: request.identity.to_string(),
                after: self.timeout,
            }),
        }
    }
}

/// The client items should call: `api` wrapped in the configured deadline.
pub(crate) fn configured_client(api: Arc<dyn ApiClient>, config: &CacheConfig) -> Arc<dyn ApiClient> {
    match config.fetch_timeout {
        Some(timeout) => Arc::new(TimeoutApiClient::new(api, timeout)),
        None => api,
    }
}

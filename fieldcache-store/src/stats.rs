//! Cache usage counters.

use std::sync::atomic::{AtomicU64, Ordering};

/// Statistics about cache usage.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Requests served entirely from fresh cache.
    pub hits: u64,
    /// Requests that needed a network refresh. Counted per request, so a
    /// request that only joins an in-flight fetch is a miss without adding
    /// to `network_fetches`.
    pub misses: u64,
    /// Stale or partial snapshots delivered ahead of a refresh.
    pub stalled_deliveries: u64,
    /// Calls made to the API client.
    pub network_fetches: u64,
    /// Requests that attached to an in-flight fetch.
    pub coalesced_requests: u64,
    /// Network fetches that failed.
    pub failures: u64,
}

impl CacheStats {
    /// Calculate the hit rate (0.0 to 1.0).
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }

    /// Add another set of counters into this one.
    pub fn accumulate(&mut self, other: &CacheStats) {
        self.hits += other.hits;
        self.misses += other.misses;
        self.stalled_deliveries += other.stalled_deliveries;
        self.network_fetches += other.network_fetches;
        self.coalesced_requests += other.coalesced_requests;
        self.failures += other.failures;
    }
}

/// Lock-free counters behind [`CacheStats`].
#[derive(Debug, Default)]
pub(crate) struct StatsRecorder {
    hits: AtomicU64,
    misses: AtomicU64,
    stalled_deliveries: AtomicU64,
    network_fetches: AtomicU64,
    coalesced_requests: AtomicU64,
    failures: AtomicU64,
}

impl StatsRecorder {
    pub(crate) fn hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn stalled(&self) {
        self.stalled_deliveries.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn network_fetch(&self) {
        self.network_fetches.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn coalesced(&self) {
        self.coalesced_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            stalled_deliveries: self.stalled_deliveries.load(Ordering::Relaxed),
            network_fetches: self.network_fetches.load(Ordering::Relaxed),
            coalesced_requests: self.coalesced_requests.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
        }
    }
}

//! Staleness metadata attached to cached field values.
//!
//! A [`CacheInfo`] is never mutated once built. When data is refreshed or
//! invalidated the owner replaces it with a new value, so a clone handed to
//! a caller always describes the data it was handed out with.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Freshness boundary plus optional validation and invalidation tags.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheInfo {
    /// When the data was produced by the API.
    cached_at: DateTime<Utc>,
    /// The data is fresh strictly before this instant.
    expires_at: DateTime<Utc>,
    /// Entity tag usable for a conditional "still valid?" fetch.
    validator: Option<String>,
    /// Invalidation group this data belongs to.
    namespace: Option<String>,
    /// Namespaces the response declared stale.
    invalidates: Vec<String>,
}

impl CacheInfo {
    /// Data fetched now that stays fresh for `ttl`.
    pub fn with_ttl(ttl: Duration) -> Self {
        let now = Utc::now();
        Self::new(now, deadline(now, ttl))
    }

    /// Data fetched now with an absolute expiry.
    pub fn expiring_at(expires_at: DateTime<Utc>) -> Self {
        Self::new(Utc::now(), expires_at)
    }

    /// Fully explicit constructor.
    pub fn new(cached_at: DateTime<Utc>, expires_at: DateTime<Utc>) -> Self {
        Self {
            cached_at,
            expires_at,
            validator: None,
            namespace: None,
            invalidates: Vec::new(),
        }
    }

    /// Attach an entity tag.
    pub fn with_validator(mut self, validator: impl Into<String>) -> Self {
        self.validator = Some(validator.into());
        self
    }

    /// Attach an invalidation namespace.
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    /// Declare namespaces invalidated by the response carrying this info.
    pub fn with_invalidates<I, S>(mut self, namespaces: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.invalidates = namespaces.into_iter().map(Into::into).collect();
        self
    }

    /// True iff the freshness boundary has not elapsed at `now`.
    pub fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }

    pub fn is_stale(&self, now: DateTime<Utc>) -> bool {
        !self.is_fresh(now)
    }

    /// Time left before the data turns stale; zero once stale.
    pub fn ttl_remaining(&self, now: DateTime<Utc>) -> Duration {
        (self.expires_at - now).to_std().unwrap_or(Duration::ZERO)
    }

    /// A copy of this info that is already stale at `now`.
    ///
    /// Validator and namespace are kept so an invalidated field can still be
    /// revalidated cheaply.
    pub fn expired_at(&self, now: DateTime<Utc>) -> Self {
        Self {
            expires_at: now.min(self.expires_at),
            ..self.clone()
        }
    }

    pub fn cached_at(&self) -> DateTime<Utc> {
        self.cached_at
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    pub fn validator(&self) -> Option<&str> {
        self.validator.as_deref()
    }

    pub fn namespace(&self) -> Option<&str> {
        self.namespace.as_deref()
    }

    pub fn invalidates(&self) -> &[String] {
        &self.invalidates
    }
}

/// `start + ttl`, saturating at the largest representable instant.
fn deadline(start: DateTime<Utc>, ttl: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(ttl)
        .ok()
        .and_then(|ttl| start.checked_add_signed(ttl))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

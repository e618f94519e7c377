//! Contract for the remote object API the cache sits in front of.
//!
//! Transport, authentication and response parsing all live behind
//! [`ApiClient`]; the cache only sees field values and their metadata.

use async_trait::async_trait;

use crate::cache_info::CacheInfo;
use crate::error::FetchError;
use crate::field::{CachedField, CachedFields, FieldData, FieldSet};
use crate::identity::Identity;

/// One network fetch for a set of fields on one object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    pub identity: Identity,
    pub fields: FieldSet,
    /// Entity tag for a conditional fetch. Only set when every requested
    /// field is cached, stale, and tagged with this same validator.
    pub validator: Option<String>,
}

impl FetchRequest {
    pub fn new(identity: Identity, fields: FieldSet) -> Self {
        Self {
            identity,
            fields,
            validator: None,
        }
    }

    pub fn with_validator(mut self, validator: Option<String>) -> Self {
        self.validator = validator;
        self
    }
}

/// What the API answered.
#[derive(Debug, Clone, PartialEq)]
pub enum FetchResponse {
    /// Field values, each with its own cache metadata. Requested fields
    /// missing from the map are treated as absent on the object.
    Fields(CachedFields),
    /// Field values without cache metadata; the cache stamps them with its
    /// configured default TTL.
    Bare(FieldData),
    /// The validator still matches; the cached values remain correct and
    /// are now described by this info.
    NotModified(CacheInfo),
}

impl FetchResponse {
    /// Every value shares one cache info, as with a single HTTP response.
    pub fn uniform(values: FieldData, cache_info: CacheInfo) -> Self {
        Self::Fields(
            values
                .into_iter()
                .map(|(name, value)| (name, CachedField::new(value, cache_info.clone())))
                .collect(),
        )
    }
}

/// Fetches object fields from the remote API.
///
/// Must be safe to call concurrently for different requests. Errors are
/// opaque to the cache and reported as a [`FetchError`].
#[async_trait]
pub trait ApiClient: Send + Sync {
    async fn fetch(&self, request: &FetchRequest) -> Result<FetchResponse, FetchError>;
}

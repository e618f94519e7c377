//! fieldcache Core - Data Types
//!
//! Pure data structures shared by the store and its collaborators:
//! object identity, per-field cache metadata, the API client contract,
//! configuration, and the error taxonomy. Everything with behavior over
//! shared state lives in `fieldcache-store`.

pub mod api;
pub mod cache_info;
pub mod config;
pub mod error;
pub mod field;
pub mod identity;

pub use api::{ApiClient, FetchRequest, FetchResponse};
pub use cache_info::CacheInfo;
pub use config::{
    CacheConfig, FailurePayload, DEFAULT_FETCH_TIMEOUT_SECS, DEFAULT_TTL_SECS,
};
pub use error::{ConfigError, FetchError, FieldCacheError, FieldCacheResult};
pub use field::{field_set, CachedField, CachedFields, FieldData, FieldSet};
pub use identity::Identity;


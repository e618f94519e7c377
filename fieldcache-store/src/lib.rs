//! fieldcache Store - Shared Object Field Cache
//!
//! Application code asks an [`ItemRegistry`] for the [`Item`] behind an
//! object identity and loads fields through [`Item::with_fields`]. Every
//! holder of the same identity shares one item and therefore one
//! [`FieldStore`].
//!
//! # Delivery contract
//!
//! A single `with_fields` call produces at most two [`FieldsEvent`]s:
//!
//! - everything cached and fresh: one `Fresh` event, no network access;
//! - nothing cached: one terminal event once the fetch resolves;
//! - partially cached or stale: a `Stalled` snapshot first, then the
//!   terminal event.
//!
//! Refreshes go through a per-item [`FetchCoordinator`] that coalesces
//! overlapping in-flight requests so N concurrent callers cost one network
//! call.
//!
//! # Example
//!
//! ```ignore
//! let registry = ItemRegistry::new(api, CacheConfig::from_env());
//! let video = registry.get("video", "x1");
//!
//! video
//!     .with_fields(["title", "views"], |event| match event {
//!         FieldsEvent::Stalled(data) => render_placeholder(&data),
//!         FieldsEvent::Fresh(data) => render(&data),
//!         FieldsEvent::Failed { error, .. } => tracing::warn!(%error, "load failed"),
//!     })
//!     .await;
//! ```

pub mod coordinator;
pub mod delivery;
pub mod field_store;
pub mod item;
pub mod registry;
pub mod stats;
pub mod timeout;

pub use coordinator::{FetchCoordinator, FetchWaiter};
pub use delivery::FieldsEvent;
pub use field_store::{FieldStore, Partition};
pub use item::Item;
pub use registry::ItemRegistry;
pub use stats::CacheStats;
pub use timeout::TimeoutApiClient;

// Re-export core types for convenience
pub use fieldcache_core::{
    field_set, ApiClient, CacheConfig, CacheInfo, CachedField, CachedFields, FailurePayload,
    FetchError, FetchRequest, FetchResponse, FieldData, FieldSet, Identity,
};

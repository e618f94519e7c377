//! Per-object field storage.
//!
//! A [`FieldStore`] maps field names to values with independent cache
//! metadata. It is plain in-memory state: nothing here performs I/O or
//! can fail. Sharing and locking are handled by [`SharedStore`].

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use fieldcache_core::{CacheInfo, CachedField, CachedFields, FieldData, FieldSet};

/// A field store shared between an item and its in-flight fetches.
pub(crate) type SharedStore = Arc<RwLock<FieldStore>>;

/// Read access that survives a poisoned lock.
///
/// Every mutation is a sequence of whole-entry inserts or removals, so the
/// map is structurally valid even if a writer panicked.
pub(crate) fn read_store(store: &SharedStore) -> RwLockReadGuard<'_, FieldStore> {
    store.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub(crate) fn write_store(store: &SharedStore) -> RwLockWriteGuard<'_, FieldStore> {
    store.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Field name → (value, cache info).
#[derive(Debug, Clone, Default)]
pub struct FieldStore {
    entries: HashMap<String, CachedField>,
    /// Cache info of the most recent successful fetch.
    last_cache_info: Option<CacheInfo>,
}

/// Requested fields split by cache state.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Partition {
    pub fresh: CachedFields,
    pub stale: CachedFields,
    pub missing: FieldSet,
}

impl Partition {
    /// True when the request cannot be answered from cache alone.
    pub fn needs_fetch(&self) -> bool {
        !self.missing.is_empty() || !self.stale.is_empty()
    }

    /// The fields a refresh must fetch: `missing ∪ stale`.
    pub fn authoritative(&self) -> FieldSet {
        self.missing
            .iter()
            .cloned()
            .chain(self.stale.keys().cloned())
            .collect()
    }

    /// True when at least one requested field is cached, fresh or not.
    pub fn has_present(&self) -> bool {
        !self.fresh.is_empty() || !self.stale.is_empty()
    }

    /// Values of every cached field regardless of freshness.
    pub fn present_data(&self) -> FieldData {
        self.fresh
            .iter()
            .chain(self.stale.iter())
            .map(|(name, field)| (name.clone(), field.value.clone()))
            .collect()
    }

    /// Values of the fresh fields only.
    pub fn fresh_data(&self) -> FieldData {
        self.fresh
            .iter()
            .map(|(name, field)| (name.clone(), field.value.clone()))
            .collect()
    }
}

impl FieldStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Split `fields` into those present (regardless of freshness) and
    /// those entirely absent.
    pub fn get(&self, fields: &FieldSet) -> (CachedFields, FieldSet) {
        let mut present = CachedFields::new();
        let mut missing = FieldSet::new();
        for name in fields {
            match self.entries.get(name) {
                Some(field) => {
                    present.insert(name.clone(), field.clone());
                }
                None => {
                    missing.insert(name.clone());
                }
            }
        }
        (present, missing)
    }

    /// Like [`get`](Self::get), further splitting present fields by
    /// freshness at `now`.
    pub fn partition(&self, fields: &FieldSet, now: DateTime<Utc>) -> Partition {
        let (present, missing) = self.get(fields);
        let (fresh, stale) = present
            .into_iter()
            .partition(|(_, field)| field.cache_info.is_fresh(now));
        Partition {
            fresh,
            stale,
            missing,
        }
    }

    pub fn get_field(&self, name: &str) -> Option<&CachedField> {
        self.entries.get(name)
    }

    /// Values currently stored for `fields`; absent fields are skipped.
    pub fn values(&self, fields: &FieldSet) -> FieldData {
        fields
            .iter()
            .filter_map(|name| {
                self.entries
                    .get(name)
                    .map(|field| (name.clone(), field.value.clone()))
            })
            .collect()
    }

    /// Overwrite or create an entry per given field. Last writer wins.
    pub fn merge(&mut self, values: CachedFields) {
        self.entries.extend(values);
    }

    /// Remove every entry.
    pub fn flush(&mut self) {
        self.entries.clear();
        self.last_cache_info = None;
    }

    /// The entity tag shared by `fields`, if all of them are cached, stale
    /// at `now`, and tagged with the same validator.
    pub fn common_validator(&self, fields: &FieldSet, now: DateTime<Utc>) -> Option<String> {
        let mut common: Option<&str> = None;
        for name in fields {
            let info = &self.entries.get(name)?.cache_info;
            if info.is_fresh(now) {
                return None;
            }
            let validator = info.validator()?;
            match common {
                Some(seen) if seen != validator => return None,
                _ => common = Some(validator),
            }
        }
        common.map(str::to_string)
    }

    /// Replace the cache info of every present field in `fields` with
    /// `info`, keeping the values. Returns how many fields were re-stamped.
    pub fn revalidate(&mut self, fields: &FieldSet, info: &CacheInfo) -> usize {
        let mut count = 0;
        for name in fields {
            if let Some(field) = self.entries.get_mut(name) {
                field.cache_info = info.clone();
                count += 1;
            }
        }
        count
    }

    /// Mark every fresh field in `namespace` stale as of `now`.
    pub fn expire_namespace(&mut self, namespace: &str, now: DateTime<Utc>) -> usize {
        let mut count = 0;
        for field in self.entries.values_mut() {
            if field.cache_info.namespace() == Some(namespace) && field.cache_info.is_fresh(now) {
                field.cache_info = field.cache_info.expired_at(now);
                count += 1;
            }
        }
        count
    }

    pub fn last_cache_info(&self) -> Option<&CacheInfo> {
        self.last_cache_info.as_ref()
    }

    pub fn set_last_cache_info(&mut self, info: CacheInfo) {
        self.last_cache_info = Some(info);
    }

    pub fn field_names(&self) -> FieldSet {
        self.entries.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

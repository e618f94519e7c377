//! Field name sets and field value maps.

use crate::cache_info::CacheInfo;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// A set of field names. Ordered so logs and test output are stable.
pub type FieldSet = BTreeSet<String>;

/// Field values as delivered to callers.
pub type FieldData = BTreeMap<String, serde_json::Value>;

/// Field values with their individual cache metadata.
pub type CachedFields = BTreeMap<String, CachedField>;

/// Build a [`FieldSet`] from string-like names.
pub fn field_set<I, S>(names: I) -> FieldSet
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    names.into_iter().map(Into::into).collect()
}

/// One cached field value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedField {
    pub value: serde_json::Value,
    pub cache_info: CacheInfo,
}

impl CachedField {
    pub fn new(value: serde_json::Value, cache_info: CacheInfo) -> Self {
        Self { value, cache_info }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_field_set_dedups() {
        let set = field_set(["title", "views", "title"]);
        assert_eq!(set.len(), 2);
        assert!(set.contains("views"));
    }
}

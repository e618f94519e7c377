//! Object identity: a type name plus an object id.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identity of a remote object, e.g. `video/xyz123`.
///
/// Fields are private so an identity cannot change once built; two
/// identities are equal iff both components are equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Identity {
    type_name: String,
    object_id: String,
}

impl Identity {
    pub fn new(type_name: impl Into<String>, object_id: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            object_id: object_id.into(),
        }
    }

    /// The object type name (`video`, `user`, `playlist`, ...).
    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    /// The object id within its type.
    pub fn object_id(&self) -> &str {
        &self.object_id
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.type_name, self.object_id)
    }
}

//! Immutable versions and the change-sets that produce them.

use crate::operation::SchemaOperation;
use rkyv::{Archive, Deserialize, Serialize};
use std::fmt;

/// Identifier of a version.
#[derive(
    Debug,
    Clone,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Archive,
    Serialize,
    Deserialize,
    serde::Serialize,
    serde::Deserialize,
)]
#[rkyv(derive(PartialEq, Eq, PartialOrd, Ord))]
#[serde(transparent)]
pub struct VersionId(String);

impl VersionId {
    /// Wrap an identifier string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for VersionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for VersionId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// A named, ordered group of operations producing one version.
#[derive(
    Debug, Clone, PartialEq, Archive, Serialize, Deserialize, serde::Serialize, serde::Deserialize,
)]
pub struct ChangeSet {
    /// Who requested the change.
    pub author: String,
    /// What the change is for.
    pub description: String,
    /// When the change-set was added (microseconds since epoch).
    pub created_at: u64,
    /// Operations in application order.
    pub operations: Vec<SchemaOperation>,
}

/// A node of the version graph. Never mutated after creation.
#[derive(
    Debug, Clone, PartialEq, Archive, Serialize, Deserialize, serde::Serialize, serde::Deserialize,
)]
pub struct Version {
    /// Version identifier.
    pub id: VersionId,
    /// Parent version; `None` only for the root.
    pub parent: Option<VersionId>,
    /// Change-set leading from the parent to this version; `None` for the root.
    pub change_set: Option<ChangeSet>,
}

impl Version {
    /// Check if this is the root version.
    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }

    /// Operations of this version's change-set.
    pub fn operations(&self) -> &[SchemaOperation] {
        self.change_set
            .as_ref()
            .map(|cs| cs.operations.as_slice())
            .unwrap_or(&[])
    }
}

//! The append-only version graph.

use super::version::{ChangeSet, Version, VersionId};
use crate::error::Error;
use crate::ids::{current_timestamp, IdGenerator};
use crate::operation::SchemaOperation;
use rkyv::{Archive, Deserialize, Serialize};
use std::collections::BTreeMap;

/// Append-only tree of versions.
///
/// Every change-set becomes a new child version. Versions are never removed.
#[derive(
    Debug, Clone, PartialEq, Archive, Serialize, Deserialize, serde::Serialize, serde::Deserialize,
)]
pub struct Changelog {
    versions: BTreeMap<VersionId, Version>,
    /// Version identifiers in insertion order.
    order: Vec<VersionId>,
    root: VersionId,
    last_added: VersionId,
    ids: IdGenerator,
}

impl Changelog {
    /// Create a changelog holding only a root version.
    pub fn new() -> Self {
        Self::with_generator(IdGenerator::from_clock())
    }

    /// Create a changelog whose version identifiers come from `ids`.
    pub fn with_generator(mut ids: IdGenerator) -> Self {
        let root = VersionId::new(ids.next("v", |_| false));
        let version = Version {
            id: root.clone(),
            parent: None,
            change_set: None,
        };

        let mut versions = BTreeMap::new();
        versions.insert(root.clone(), version);

        Self {
            versions,
            order: vec![root.clone()],
            root: root.clone(),
            last_added: root,
            ids,
        }
    }

    /// The root version.
    pub fn root(&self) -> &Version {
        &self.versions[&self.root]
    }

    /// The most recently added version.
    pub fn last_added(&self) -> &Version {
        &self.versions[&self.last_added]
    }

    /// Append a change-set after the last added version.
    pub fn add_change_set(
        &mut self,
        author: impl Into<String>,
        description: impl Into<String>,
        operations: Vec<SchemaOperation>,
    ) -> &Version {
        let parent = self.last_added.clone();
        self.append(parent, author.into(), description.into(), operations)
    }

    /// Append a change-set after `parent`, creating a branch if `parent`
    /// already has children.
    pub fn add_change_set_after(
        &mut self,
        parent: &VersionId,
        author: impl Into<String>,
        description: impl Into<String>,
        operations: Vec<SchemaOperation>,
    ) -> Result<&Version, Error> {
        if !self.versions.contains_key(parent) {
            return Err(Error::VersionNotFound(parent.to_string()));
        }
        Ok(self.append(parent.clone(), author.into(), description.into(), operations))
    }

    fn append(
        &mut self,
        parent: VersionId,
        author: String,
        description: String,
        operations: Vec<SchemaOperation>,
    ) -> &Version {
        let versions = &self.versions;
        let id = VersionId::new(self.ids.next("v", |candidate| {
            versions.contains_key(&VersionId::new(candidate))
        }));

        let version = Version {
            id: id.clone(),
            parent: Some(parent),
            change_set: Some(ChangeSet {
                author,
                description,
                created_at: current_timestamp(),
                operations,
            }),
        };

        self.order.push(id.clone());
        self.last_added = id.clone();
        self.versions.entry(id).or_insert(version)
    }

    /// Get a version.
    pub fn get(&self, id: &VersionId) -> Option<&Version> {
        self.versions.get(id)
    }

    /// Get a version, failing if absent.
    pub fn version(&self, id: &VersionId) -> Result<&Version, Error> {
        self.get(id)
            .ok_or_else(|| Error::VersionNotFound(id.to_string()))
    }

    /// Check if a version exists.
    pub fn contains(&self, id: &VersionId) -> bool {
        self.versions.contains_key(id)
    }

    /// Versions in insertion order.
    pub fn versions(&self) -> impl Iterator<Item = &Version> {
        self.order.iter().filter_map(|id| self.versions.get(id))
    }

    /// Number of versions, including the root.
    pub fn len(&self) -> usize {
        self.versions.len()
    }

    /// Always false: the root version always exists.
    pub fn is_empty(&self) -> bool {
        self.versions.is_empty()
    }

    /// Direct children of a version, in insertion order.
    pub fn children(&self, id: &VersionId) -> Vec<&Version> {
        self.versions()
            .filter(|v| v.parent.as_ref() == Some(id))
            .collect()
    }

    /// Check if `ancestor` is `id` or one of its ancestors.
    pub fn is_ancestor(&self, ancestor: &VersionId, id: &VersionId) -> bool {
        let mut current = self.get(id);
        while let Some(version) = current {
            if &version.id == ancestor {
                return true;
            }
            current = version.parent.as_ref().and_then(|p| self.get(p));
        }
        false
    }

    /// Versions strictly after `from` up to and including `to`, oldest first.
    pub fn path(&self, from: &VersionId, to: &VersionId) -> Result<Vec<&Version>, Error> {
        self.version(from)?;
        let mut current = self.version(to)?;

        let mut path = Vec::new();
        while &current.id != from {
            path.push(current);
            current = match &current.parent {
                Some(parent) => self.version(parent)?,
                None => {
                    return Err(Error::NotAncestor {
                        from: from.to_string(),
                        to: to.to_string(),
                    })
                }
            };
        }

        path.reverse();
        Ok(path)
    }

    /// Serialize the changelog to bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, Error> {
        rkyv::to_bytes::<rkyv::rancor::Error>(self)
            .map(|v| v.to_vec())
            .map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Deserialize a changelog from bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, Error> {
        rkyv::from_bytes::<Self, rkyv::rancor::Error>(&crate::codec::aligned(bytes))
            .map_err(|e| Error::Deserialization(e.to_string()))
    }
}

impl Default for Changelog {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::builder;

    fn changelog() -> Changelog {
        Changelog::with_generator(IdGenerator::new("test"))
    }

    #[test]
    fn test_root() {
        let log = changelog();
        assert!(log.root().is_root());
        assert_eq!(log.root().id, log.last_added().id);
        assert_eq!(log.len(), 1);
        assert!(log.root().operations().is_empty());
    }

    #[test]
    fn test_add_change_set_chains() {
        let mut log = changelog();
        let root = log.root().id.clone();
        let v1 = log
            .add_change_set("alice", "drop email", vec![builder::drop_column("users", "email")])
            .id
            .clone();
        let v2 = log
            .add_change_set("bob", "rename", vec![builder::rename_table("users", "accounts")])
            .id
            .clone();

        assert_eq!(log.version(&v1).unwrap().parent.as_ref(), Some(&root));
        assert_eq!(log.version(&v2).unwrap().parent.as_ref(), Some(&v1));
        assert_eq!(log.last_added().id, v2);
        assert_eq!(log.version(&v1).unwrap().operations().len(), 1);

        let order: Vec<_> = log.versions().map(|v| v.id.clone()).collect();
        assert_eq!(order, vec![root, v1, v2]);
    }

    #[test]
    fn test_branching_and_path() {
        let mut log = changelog();
        let root = log.root().id.clone();
        let v1 = log.add_change_set("a", "one", vec![]).id.clone();
        let v2 = log.add_change_set("a", "two", vec![]).id.clone();
        let branch = log
            .add_change_set_after(&v1, "b", "branch", vec![])
            .unwrap()
            .id
            .clone();

        assert_eq!(log.children(&v1).len(), 2);
        assert!(log.is_ancestor(&root, &branch));
        assert!(log.is_ancestor(&v1, &v1));
        assert!(!log.is_ancestor(&v2, &branch));

        let path: Vec<_> = log
            .path(&root, &v2)
            .unwrap()
            .into_iter()
            .map(|v| v.id.clone())
            .collect();
        assert_eq!(path, vec![v1.clone(), v2.clone()]);
        assert!(log.path(&v2, &v2).unwrap().is_empty());

        assert!(matches!(
            log.path(&v2, &branch),
            Err(Error::NotAncestor { .. })
        ));
        assert!(matches!(
            log.add_change_set_after(&VersionId::new("missing"), "x", "y", vec![]),
            Err(Error::VersionNotFound(_))
        ));
    }

    #[test]
    fn test_serialization() {
        let mut log = changelog();
        log.add_change_set("a", "one", vec![builder::drop_column("users", "email")]);
        let bytes = log.to_bytes().unwrap();
        let restored = Changelog::from_bytes(&bytes).unwrap();
        assert_eq!(restored, log);

        let mut shifted = vec![0u8; 3];
        shifted.extend_from_slice(&bytes);
        assert_eq!(Changelog::from_bytes(&shifted[3..]).unwrap(), log);
    }
}

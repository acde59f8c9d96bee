//! Logical-to-physical table mapping per version.

use super::version::{Version, VersionId};
use crate::error::Error;
use rkyv::{Archive, Deserialize, Serialize};
use std::collections::BTreeMap;

/// The table mapping of one version.
#[derive(
    Debug,
    Clone,
    Default,
    PartialEq,
    Archive,
    Serialize,
    Deserialize,
    serde::Serialize,
    serde::Deserialize,
)]
pub struct Scope {
    /// Version this scope was forked from.
    pub parent: Option<VersionId>,
    /// Logical table name to physical table identifier.
    pub tables: BTreeMap<String, String>,
}

/// Resolves `(logical name, version)` to a physical table identifier.
///
/// A version gets its own scope when it is forked from its parent; the fork
/// copies every entry of the parent. Once a child has forked from a version,
/// that version's scope is frozen.
#[derive(
    Debug,
    Clone,
    Default,
    PartialEq,
    Archive,
    Serialize,
    Deserialize,
    serde::Serialize,
    serde::Deserialize,
)]
pub struct RefLog {
    scopes: BTreeMap<VersionId, Scope>,
}

impl RefLog {
    /// Create an empty ref log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Give `version` its own scope, copied from its parent's.
    ///
    /// Forking an already forked version does nothing.
    pub fn prepare_fork(&mut self, version: &Version) -> Result<(), Error> {
        if self.scopes.contains_key(&version.id) {
            return Ok(());
        }

        let tables = match &version.parent {
            Some(parent) => self.scope(parent)?.tables.clone(),
            None => BTreeMap::new(),
        };

        self.scopes.insert(
            version.id.clone(),
            Scope {
                parent: version.parent.clone(),
                tables,
            },
        );
        Ok(())
    }

    /// Check if a version has been forked.
    pub fn contains_version(&self, version: &VersionId) -> bool {
        self.scopes.contains_key(version)
    }

    /// Forked versions.
    pub fn versions(&self) -> impl Iterator<Item = &VersionId> {
        self.scopes.keys()
    }

    /// Check if a child has forked from `version`.
    pub fn is_frozen(&self, version: &VersionId) -> bool {
        self.scopes
            .values()
            .any(|scope| scope.parent.as_ref() == Some(version))
    }

    /// Register a new logical table at a version.
    pub fn add_table(
        &mut self,
        logical: &str,
        physical: &str,
        version: &VersionId,
    ) -> Result<(), Error> {
        let scope = self.scope_mut(version)?;
        if scope.tables.contains_key(logical) {
            return Err(Error::TableRefExists {
                version: version.to_string(),
                table: logical.to_string(),
            });
        }
        scope
            .tables
            .insert(logical.to_string(), physical.to_string());
        Ok(())
    }

    /// Point an existing logical name at a new physical table.
    pub fn ghost(&mut self, version: &VersionId, logical: &str, physical: &str) -> Result<(), Error> {
        let scope = self.scope_mut(version)?;
        match scope.tables.get_mut(logical) {
            Some(entry) => {
                *entry = physical.to_string();
                Ok(())
            }
            None => Err(Error::TableRefNotFound {
                version: version.to_string(),
                table: logical.to_string(),
            }),
        }
    }

    /// Rename a logical table at a version. The physical table is shared.
    pub fn rename(&mut self, version: &VersionId, old: &str, new: &str) -> Result<(), Error> {
        let scope = self.scope_mut(version)?;
        if scope.tables.contains_key(new) {
            return Err(Error::TableRefExists {
                version: version.to_string(),
                table: new.to_string(),
            });
        }
        let physical = scope
            .tables
            .remove(old)
            .ok_or_else(|| Error::TableRefNotFound {
                version: version.to_string(),
                table: old.to_string(),
            })?;
        scope.tables.insert(new.to_string(), physical);
        Ok(())
    }

    /// Resolve a logical name at a version.
    pub fn table_id(&self, version: &VersionId, logical: &str) -> Result<&str, Error> {
        self.scope(version)?
            .tables
            .get(logical)
            .map(String::as_str)
            .ok_or_else(|| Error::TableRefNotFound {
                version: version.to_string(),
                table: logical.to_string(),
            })
    }

    /// Find the logical name a physical table has at a version.
    pub fn table_name(&self, version: &VersionId, physical: &str) -> Option<&str> {
        self.scopes.get(version).and_then(|scope| {
            scope
                .tables
                .iter()
                .find(|(_, id)| *id == physical)
                .map(|(name, _)| name.as_str())
        })
    }

    /// Every logical table of a version.
    pub fn tables(&self, version: &VersionId) -> Result<&BTreeMap<String, String>, Error> {
        Ok(&self.scope(version)?.tables)
    }

    /// Check if the table a logical name resolves to at `version` is new at
    /// that version, i.e. not used by any name of the parent version.
    pub fn is_ghosted(&self, version: &VersionId, logical: &str) -> Result<bool, Error> {
        let scope = self.scope(version)?;
        let physical = self.table_id(version, logical)?;
        match &scope.parent {
            Some(parent) => Ok(!self.scope(parent)?.tables.values().any(|id| id == physical)),
            None => Ok(true),
        }
    }

    /// Check if any version maps a name to this physical table.
    pub fn references(&self, physical: &str) -> bool {
        self.scopes
            .values()
            .any(|scope| scope.tables.values().any(|id| id == physical))
    }

    /// Get the scope of a version.
    pub fn scope_of(&self, version: &VersionId) -> Option<&Scope> {
        self.scopes.get(version)
    }

    /// Install a scope built elsewhere. The version must not be forked yet.
    pub fn insert_scope(&mut self, version: VersionId, scope: Scope) -> Result<(), Error> {
        if self.scopes.contains_key(&version) {
            return Err(Error::InvalidData(format!(
                "version {} is already forked",
                version
            )));
        }
        self.scopes.insert(version, scope);
        Ok(())
    }

    /// Remove a version's scope.
    pub fn remove_scope(&mut self, version: &VersionId) -> Result<Scope, Error> {
        self.scopes
            .remove(version)
            .ok_or_else(|| Error::VersionNotForked(version.to_string()))
    }

    /// Serialize the ref log to bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, Error> {
        rkyv::to_bytes::<rkyv::rancor::Error>(self)
            .map(|v| v.to_vec())
            .map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Deserialize a ref log from bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, Error> {
        rkyv::from_bytes::<Self, rkyv::rancor::Error>(&crate::codec::aligned(bytes))
            .map_err(|e| Error::Deserialization(e.to_string()))
    }

    fn scope(&self, version: &VersionId) -> Result<&Scope, Error> {
        self.scopes
            .get(version)
            .ok_or_else(|| Error::VersionNotForked(version.to_string()))
    }

    fn scope_mut(&mut self, version: &VersionId) -> Result<&mut Scope, Error> {
        if self.is_frozen(version) {
            return Err(Error::VersionFrozen(version.to_string()));
        }
        self.scopes
            .get_mut(version)
            .ok_or_else(|| Error::VersionNotForked(version.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn version(id: &str, parent: Option<&str>) -> Version {
        Version {
            id: VersionId::new(id),
            parent: parent.map(VersionId::new),
            change_set: None,
        }
    }

    fn forked() -> (RefLog, VersionId, VersionId) {
        let root = version("v0", None);
        let child = version("v1", Some("v0"));
        let mut log = RefLog::new();
        log.prepare_fork(&root).unwrap();
        log.add_table("users", "t_users", &root.id).unwrap();
        log.add_table("posts", "t_posts", &root.id).unwrap();
        log.prepare_fork(&child).unwrap();
        (log, root.id, child.id)
    }

    #[test]
    fn test_fork_copies_parent_entries() {
        let (log, root, child) = forked();
        assert_eq!(log.table_id(&child, "users").unwrap(), "t_users");
        assert_eq!(log.table_id(&root, "posts").unwrap(), "t_posts");
        assert!(!log.is_ghosted(&child, "users").unwrap());
    }

    #[test]
    fn test_prepare_fork_is_idempotent() {
        let (mut log, _, child) = forked();
        log.ghost(&child, "users", "t_users2").unwrap();
        log.prepare_fork(&version("v1", Some("v0"))).unwrap();
        assert_eq!(log.table_id(&child, "users").unwrap(), "t_users2");
    }

    #[test]
    fn test_fork_requires_forked_parent() {
        let mut log = RefLog::new();
        let err = log.prepare_fork(&version("v1", Some("v0"))).unwrap_err();
        assert!(matches!(err, Error::VersionNotForked(_)));
    }

    #[test]
    fn test_ghost_leaves_parent_untouched() {
        let (mut log, root, child) = forked();
        log.ghost(&child, "users", "t_users2").unwrap();

        assert_eq!(log.table_id(&root, "users").unwrap(), "t_users");
        assert_eq!(log.table_id(&child, "users").unwrap(), "t_users2");
        assert!(log.is_ghosted(&child, "users").unwrap());
        assert_eq!(log.table_name(&child, "t_users2"), Some("users"));
        assert_eq!(log.table_name(&child, "t_users"), None);
    }

    #[test]
    fn test_parent_is_frozen_after_fork() {
        let (mut log, root, _) = forked();
        assert!(log.is_frozen(&root));
        let err = log.add_table("comments", "t_comments", &root).unwrap_err();
        assert!(matches!(err, Error::VersionFrozen(_)));
        let err = log.ghost(&root, "users", "t_other").unwrap_err();
        assert!(matches!(err, Error::VersionFrozen(_)));
    }

    #[test]
    fn test_lookup_errors() {
        let (mut log, _, child) = forked();
        assert!(matches!(
            log.table_id(&child, "missing"),
            Err(Error::TableRefNotFound { .. })
        ));
        assert!(matches!(
            log.table_id(&VersionId::new("v9"), "users"),
            Err(Error::VersionNotForked(_))
        ));
        assert!(matches!(
            log.ghost(&child, "missing", "t_x"),
            Err(Error::TableRefNotFound { .. })
        ));
        assert!(matches!(
            log.add_table("users", "t_x", &child),
            Err(Error::TableRefExists { .. })
        ));
    }

    #[test]
    fn test_rename_shares_physical_table() {
        let (mut log, root, child) = forked();
        log.rename(&child, "users", "accounts").unwrap();

        assert_eq!(log.table_id(&child, "accounts").unwrap(), "t_users");
        assert!(log.table_id(&child, "users").is_err());
        assert_eq!(log.table_id(&root, "users").unwrap(), "t_users");
        assert!(!log.is_ghosted(&child, "accounts").unwrap());
    }

    #[test]
    fn test_references_and_remove_scope() {
        let (mut log, _, child) = forked();
        log.ghost(&child, "users", "t_users2").unwrap();
        assert!(log.references("t_users"));

        log.remove_scope(&child).unwrap();
        assert!(!log.references("t_users2"));
        assert!(!log.contains_version(&child));
    }

    #[test]
    fn test_serialization() {
        let (log, _, _) = forked();
        let restored = RefLog::from_bytes(&log.to_bytes().unwrap()).unwrap();
        assert_eq!(restored, log);
    }

    #[test]
    fn test_deserialize_from_unaligned_buffer() {
        let (log, _, _) = forked();
        let bytes = log.to_bytes().unwrap();
        let mut shifted = vec![0u8];
        shifted.extend_from_slice(&bytes);
        assert_eq!(RefLog::from_bytes(&shifted[1..]).unwrap(), log);
    }
}

//! The persisted state of a database: catalog, version graph, ref log and
//! data mappings.

use super::changelog::Changelog;
use super::ref_log::RefLog;
use super::version::VersionId;
use crate::catalog::{Catalog, TableDef};
use crate::error::Error;
use crate::ids::IdGenerator;
use crate::migration::DataMappings;

/// Everything the migrator needs to know about a database.
///
/// A committed `State` is immutable; a migration works on a copy and swaps
/// it in at cutover.
#[derive(Debug, Clone, PartialEq)]
pub struct State {
    /// Every physical table.
    pub catalog: Catalog,
    /// The version graph.
    pub changelog: Changelog,
    /// Logical-to-physical table mapping per version.
    pub ref_log: RefLog,
    /// Column derivations between table generations.
    pub data_mappings: DataMappings,
    /// The most recently migrated-to version.
    pub current: VersionId,
}

impl State {
    /// A fresh state with only a root version and no tables.
    pub fn new() -> Self {
        Self::with_changelog(Changelog::new())
    }

    /// A fresh state around an empty changelog.
    pub fn with_changelog(changelog: Changelog) -> Self {
        let mut ref_log = RefLog::new();
        let root = changelog.root().clone();
        // A root version has no parent, so forking it cannot fail.
        let _ = ref_log.prepare_fork(&root);

        Self {
            catalog: Catalog::new(),
            changelog,
            ref_log,
            data_mappings: DataMappings::new(),
            current: root.id,
        }
    }

    /// Resolve a logical table at a version to its definition.
    pub fn table(&self, version: &VersionId, logical: &str) -> Result<&TableDef, Error> {
        let id = self.ref_log.table_id(version, logical)?;
        self.catalog.table(id)
    }

    /// Register a table at the current version, outside of any migration.
    ///
    /// Only possible while no version has forked from the current one. The
    /// table gets a generated physical identifier, which is returned.
    pub fn create_table(&mut self, logical: &str, mut table: TableDef) -> Result<String, Error> {
        if self.ref_log.is_frozen(&self.current) {
            return Err(Error::VersionFrozen(self.current.to_string()));
        }
        if self.ref_log.table_id(&self.current, logical).is_ok() {
            return Err(Error::TableRefExists {
                version: self.current.to_string(),
                table: logical.to_string(),
            });
        }
        if table.primary_key().is_empty() {
            return Err(Error::MissingPrimaryKey(logical.to_string()));
        }

        let ids = IdGenerator::new(self.current.as_str());
        let catalog = &self.catalog;
        table.id = ids.derive("table", &[self.current.as_str(), logical], |candidate| {
            catalog.contains(candidate)
        });
        let id = table.id.clone();

        let mut catalog = self.catalog.clone();
        catalog.add_table(table)?;
        catalog.validate()?;

        self.ref_log.add_table(logical, &id, &self.current)?;
        self.catalog = catalog;
        Ok(id)
    }
}

impl Default for State {
    fn default() -> Self {
        Self::new()
    }
}

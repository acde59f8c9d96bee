//! Transitive mirroring of foreign-key connected tables.
//!
//! A table is never changed in place. Before an operation touches a table at
//! a version, the table and everything connected to it through foreign keys
//! (in both directions) get a ghost copy at that version, so that no ghost
//! ever refers to a table of the previous generation that the version no
//! longer resolves to.

use super::error::MigrationError;
use super::plan::{MigrationPlan, PlannedTable, TableOrigin};
use crate::error::Error;
use crate::versioning::VersionId;
use std::collections::{BTreeSet, VecDeque};
use tracing::debug;

/// Mirrors FK-connected closures of logical tables at one version.
pub struct TransitiveTableMirrorer<'a> {
    plan: &'a mut MigrationPlan,
    version: &'a VersionId,
}

impl<'a> TransitiveTableMirrorer<'a> {
    /// Create a mirrorer for `version` of `plan`.
    pub fn new(plan: &'a mut MigrationPlan, version: &'a VersionId) -> Self {
        Self { plan, version }
    }

    /// Ghost every table connected to `seeds` that is not yet new at the
    /// version. Returns the logical names mirrored by this call.
    ///
    /// Calling this again with the same seeds does nothing.
    pub fn mirror<S: AsRef<str>>(&mut self, seeds: &[S]) -> Result<Vec<String>, MigrationError> {
        let mut queue: VecDeque<String> = seeds.iter().map(|s| s.as_ref().to_string()).collect();
        let mut mirrored: BTreeSet<String> = BTreeSet::new();
        let mut ghosts: Vec<(String, String)> = Vec::new();
        let mut names = Vec::new();

        while let Some(logical) = queue.pop_front() {
            if mirrored.contains(&logical) {
                continue;
            }
            mirrored.insert(logical.clone());

            let is_new = self
                .plan
                .ref_log
                .is_ghosted(self.version, &logical)
                .map_err(|e| self.error(&logical, e))?;
            if is_new {
                continue;
            }

            let source = self
                .plan
                .ref_log
                .table_id(self.version, &logical)
                .map_err(|e| self.error(&logical, e))?
                .to_string();
            let ghost = self.ghost(&logical, &source)?;

            for (table, _) in self.plan.catalog.referencing(&source) {
                match self.plan.ref_log.table_name(self.version, &table.id) {
                    Some(name) => queue.push_back(name.to_string()),
                    None => debug!(
                        table = %table.id,
                        referred = %source,
                        "referencing table not visible at version, ignored"
                    ),
                }
            }
            let referred: Vec<String> = self
                .plan
                .catalog
                .table(&source)
                .map_err(|e| self.error(&logical, e))?
                .foreign_keys
                .iter()
                .map(|fk| fk.referred_table.clone())
                .collect();
            for physical in referred {
                if let Some(name) = self.plan.ref_log.table_name(self.version, &physical) {
                    queue.push_back(name.to_string());
                } else if successor(self.plan, self.version, &physical).is_none() {
                    return Err(MigrationError::Mirroring {
                        version: self.version.to_string(),
                        table: logical,
                        reason: format!("refers to {}, which does not resolve at the version", physical),
                    });
                }
            }

            ghosts.push((source, ghost));
            names.push(logical);
        }

        self.relink(&ghosts)?;
        Ok(names)
    }

    /// Copy one table under a fresh identifier and ghost it at the version.
    fn ghost(&mut self, logical: &str, source: &str) -> Result<String, MigrationError> {
        let plan = &mut *self.plan;
        let catalog = &plan.catalog;
        let ghost = plan.ids.derive("table", &[self.version.as_str(), logical], |candidate| {
            catalog.contains(candidate)
        });

        let definition = plan
            .catalog
            .table(source)
            .map_err(|e| mirroring(self.version, logical, e))?
            .copy_as(&ghost);
        plan.catalog
            .add_table(definition)
            .and_then(|_| plan.ref_log.ghost(self.version, logical, &ghost))
            .and_then(|_| plan.data_mappings.copy(self.version, source, &ghost))
            .map_err(|e| mirroring(self.version, logical, e))?;

        plan.tables.push(PlannedTable {
            version: self.version.clone(),
            logical: logical.to_string(),
            table_id: ghost.clone(),
            source_table: Some(source.to_string()),
            origin: TableOrigin::Mirror,
        });
        debug!(version = %self.version, table = logical, source, ghost = %ghost, "mirrored table");
        Ok(ghost)
    }

    /// Recreate the foreign keys of new ghosts and re-point keys of tables
    /// new at the version that still refer to a mirrored source.
    fn relink(&mut self, ghosts: &[(String, String)]) -> Result<(), MigrationError> {
        for (source, ghost) in ghosts {
            let foreign_keys = self
                .plan
                .catalog
                .table(source)
                .map_err(|e| self.error(source, e))?
                .foreign_keys
                .clone();

            for mut fk in foreign_keys {
                fk.referred_table = successor(self.plan, self.version, &fk.referred_table)
                    .ok_or_else(|| MigrationError::Mirroring {
                        version: self.version.to_string(),
                        table: source.clone(),
                        reason: format!(
                            "foreign key {} refers to {}, which does not resolve at the version",
                            fk.name, fk.referred_table
                        ),
                    })?;
                self.plan
                    .catalog
                    .table_mut(ghost)
                    .and_then(|table| table.add_foreign_key(fk))
                    .map_err(|e| mirroring(self.version, ghost, e))?;
            }
        }

        let renamed: Vec<(&str, &str)> = ghosts.iter().map(|(s, g)| (s.as_str(), g.as_str())).collect();
        let new_tables: Vec<String> = self
            .plan
            .tables
            .iter()
            .filter(|t| &t.version == self.version && t.origin != TableOrigin::Mirror)
            .map(|t| t.table_id.clone())
            .collect();
        for id in new_tables {
            let table = self
                .plan
                .catalog
                .table_mut(&id)
                .map_err(|e| mirroring(self.version, &id, e))?;
            for fk in &mut table.foreign_keys {
                if let Some((_, ghost)) = renamed.iter().find(|(s, _)| *s == fk.referred_table) {
                    fk.referred_table = ghost.to_string();
                }
            }
        }
        Ok(())
    }

    fn error(&self, table: &str, source: Error) -> MigrationError {
        mirroring(self.version, table, source)
    }
}

/// The table that replaces `physical` at `version`: its ghost if it was
/// mirrored there, otherwise itself if the version still resolves to it.
pub(crate) fn successor(plan: &MigrationPlan, version: &VersionId, physical: &str) -> Option<String> {
    let ghost = plan.tables.iter().find(|t| {
        &t.version == version
            && t.origin == TableOrigin::Mirror
            && t.source_table.as_deref() == Some(physical)
    });
    match ghost {
        Some(ghost) => Some(ghost.table_id.clone()),
        None => plan
            .ref_log
            .table_name(version, physical)
            .map(|_| physical.to_string()),
    }
}

fn mirroring(version: &VersionId, table: &str, source: Error) -> MigrationError {
    MigrationError::Mirroring {
        version: version.to_string(),
        table: table.to_string(),
        reason: source.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{ColumnDef, DataType, ForeignKeyDef, TableDef};
    use crate::versioning::State;

    fn table() -> TableDef {
        TableDef::new("")
            .with_column(ColumnDef::primary_key("id", DataType::BigInt))
            .with_column(ColumnDef::new("ref_id", DataType::BigInt))
    }

    /// users <- posts <- comments, tags standalone.
    fn state() -> (State, VersionId) {
        let mut state = State::new();
        let users = state.create_table("users", table()).unwrap();
        let posts = state
            .create_table(
                "posts",
                table().with_foreign_key(ForeignKeyDef::new("fk_user", ["ref_id"], users, ["id"])),
            )
            .unwrap();
        state
            .create_table(
                "comments",
                table().with_foreign_key(ForeignKeyDef::new("fk_post", ["ref_id"], posts, ["id"])),
            )
            .unwrap();
        state.create_table("tags", table()).unwrap();

        let version = state.changelog.add_change_set("dev", "noop", vec![]).id.clone();
        (state, version)
    }

    fn plan(state: &State, version: &VersionId) -> MigrationPlan {
        let plan = MigrationPlan::build(state, &state.current, version).unwrap();
        assert!(plan.tables.is_empty());
        plan
    }

    fn logical_links(plan: &MigrationPlan, version: &VersionId) -> Vec<(String, String)> {
        let mut links = Vec::new();
        for (name, id) in plan.ref_log.tables(version).unwrap() {
            for fk in &plan.catalog.table(id).unwrap().foreign_keys {
                let referred = plan.ref_log.table_name(version, &fk.referred_table).unwrap();
                links.push((name.clone(), referred.to_string()));
            }
        }
        links
    }

    #[test]
    fn test_mirror_closes_over_both_directions() {
        let (state, version) = state();
        let mut plan = plan(&state, &version);

        let mut names = TransitiveTableMirrorer::new(&mut plan, &version).mirror(&["posts"]).unwrap();
        names.sort();
        assert_eq!(names, vec!["comments", "posts", "users"]);

        // Tags is unconnected and stays on the parent table.
        assert_eq!(
            plan.ref_log.table_id(&version, "tags").unwrap(),
            state.ref_log.table_id(&state.current, "tags").unwrap()
        );

        // Every foreign key of a ghost refers to a table visible at the version.
        let links = logical_links(&plan, &version);
        assert_eq!(links.len(), 2);
        for id in plan.ref_log.tables(&version).unwrap().values() {
            for fk in &plan.catalog.table(id).unwrap().foreign_keys {
                assert!(plan.ref_log.table_name(&version, &fk.referred_table).is_some());
            }
        }

        for planned in &plan.tables {
            assert!(plan.data_mappings.contains(&planned.table_id));
        }
    }

    #[test]
    fn test_mirror_is_idempotent() {
        let (state, version) = state();
        let mut plan = plan(&state, &version);

        TransitiveTableMirrorer::new(&mut plan, &version).mirror(&["users"]).unwrap();
        let before = plan.catalog.len();
        let again = TransitiveTableMirrorer::new(&mut plan, &version)
            .mirror(&["comments", "users"])
            .unwrap();

        assert!(again.is_empty());
        assert_eq!(plan.catalog.len(), before);
    }

    #[test]
    fn test_mirror_is_order_independent() {
        let (state, version) = state();

        let mut a = plan(&state, &version);
        TransitiveTableMirrorer::new(&mut a, &version).mirror(&["users"]).unwrap();
        let mut b = plan(&state, &version);
        TransitiveTableMirrorer::new(&mut b, &version).mirror(&["comments"]).unwrap();

        let mut links_a = logical_links(&a, &version);
        let mut links_b = logical_links(&b, &version);
        links_a.sort();
        links_b.sort();
        assert_eq!(links_a, links_b);
        assert_eq!(a.catalog.len(), b.catalog.len());
    }

    #[test]
    fn test_mirror_unknown_table_fails() {
        let (state, version) = state();
        let mut plan = plan(&state, &version);
        let err = TransitiveTableMirrorer::new(&mut plan, &version)
            .mirror(&["missing"])
            .unwrap_err();
        assert!(matches!(err, MigrationError::Mirroring { .. }));
    }

    #[test]
    fn test_mirror_unresolvable_referred_table_fails() {
        let (state, version) = state();
        let mut plan = plan(&state, &version);

        // A table the version does not resolve to, referred to by posts.
        plan.catalog.add_table(table().copy_as("t_detached")).unwrap();
        let posts = plan.ref_log.table_id(&version, "posts").unwrap().to_string();
        plan.catalog
            .table_mut(&posts)
            .unwrap()
            .foreign_keys
            .push(ForeignKeyDef::new("fk_detached", ["ref_id"], "t_detached", ["id"]));
        let tables_before = plan.catalog.len();

        let err = TransitiveTableMirrorer::new(&mut plan, &version)
            .mirror(&["comments"])
            .unwrap_err();
        match err {
            MigrationError::Mirroring { table, reason, .. } => {
                assert_eq!(table, "posts");
                assert!(reason.contains("t_detached"), "unexpected reason: {}", reason);
            }
            other => panic!("unexpected error: {}", other),
        }
        // Only the tables reached before posts were ghosted.
        assert_eq!(plan.catalog.len(), tables_before + 2);
        assert!(plan.ref_log.table_name(&version, "t_detached").is_none());
    }
}

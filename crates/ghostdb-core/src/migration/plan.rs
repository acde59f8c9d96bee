//! In-memory migration plans.
//!
//! A plan is built entirely in memory from the committed state: the catalog,
//! ref log and data mappings are cloned, every change-set between the source
//! and target versions is applied to the clones, and the result describes the
//! tables to create, how to fill them and the state to commit at cutover.

use super::data_mapping::{DataMappings, ResolvedMapping};
use super::error::MigrationError;
use super::migrators;
use crate::catalog::{Catalog, TableDef};
use crate::ids::{generate_migration_id, migration_id_hex, IdGenerator};
use crate::operation::SchemaOperation;
use crate::versioning::{RefLog, State, VersionId};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info};

/// Why a table is new in a plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TableOrigin {
    /// Ghost copy of a table of the previous version.
    Mirror,
    /// Copy requested by a `CopyTable` operation.
    Copy,
    /// New table requested by a `CreateTable` operation.
    Created,
}

/// A physical table the plan creates.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct PlannedTable {
    /// Version the table belongs to.
    pub version: VersionId,
    /// Logical name at that version.
    pub logical: String,
    /// Physical identifier.
    pub table_id: String,
    /// Table the rows come from, if any.
    pub source_table: Option<String>,
    /// Why the table exists.
    pub origin: TableOrigin,
}

/// Progress of one operation through its migrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStage {
    /// Nothing done yet.
    Unapplied,
    /// The touched tables have ghosts at the version.
    Mirrored,
    /// The ghost definitions were changed.
    Mutated,
    /// The data mapping was recorded and checked.
    MappingRecorded,
}

/// An operation applied to the plan.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct PlannedStep {
    /// Version whose change-set holds the operation.
    pub version: VersionId,
    /// The operation.
    pub operation: SchemaOperation,
    /// How far the operation got.
    pub stage: OperationStage,
}

/// A complete, validated migration plan.
#[derive(Debug, Clone)]
pub struct MigrationPlan {
    /// Unique migration ID.
    pub id: [u8; 16],
    /// Source version.
    pub from: VersionId,
    /// Target version.
    pub to: VersionId,
    /// Versions forked by this plan, oldest first.
    pub versions: Vec<VersionId>,
    /// Catalog including every planned table.
    pub catalog: Catalog,
    /// Ref log including the scopes of the planned versions.
    pub ref_log: RefLog,
    /// Data mappings including those of the planned tables.
    pub data_mappings: DataMappings,
    /// Generator for planned table identifiers.
    pub ids: IdGenerator,
    /// Tables to create, in planning order.
    pub tables: Vec<PlannedTable>,
    /// Applied operations.
    pub steps: Vec<PlannedStep>,
    /// Tables that already exist physically.
    committed: BTreeSet<String>,
}

impl MigrationPlan {
    /// Plan the migration of `state` from `from` to `to`.
    ///
    /// Versions on the path that already have a scope in the committed ref
    /// log are skipped; the remaining ones are forked and their change-sets
    /// applied in order.
    pub fn build(state: &State, from: &VersionId, to: &VersionId) -> Result<Self, MigrationError> {
        if !state.ref_log.contains_version(from) {
            return Err(crate::error::Error::VersionNotForked(from.to_string()).into());
        }
        let path = state.changelog.path(from, to)?;

        let id = generate_migration_id();
        let mut plan = Self {
            id,
            from: from.clone(),
            to: to.clone(),
            versions: Vec::new(),
            catalog: state.catalog.clone(),
            ref_log: state.ref_log.clone(),
            data_mappings: state.data_mappings.clone(),
            ids: IdGenerator::new(migration_id_hex(&id)),
            tables: Vec::new(),
            steps: Vec::new(),
            committed: state.catalog.ids().map(String::from).collect(),
        };

        for version in path {
            if plan.ref_log.contains_version(&version.id) {
                debug!(version = %version.id, "version already forked, skipping");
                continue;
            }
            plan.ref_log.prepare_fork(version)?;
            plan.versions.push(version.id.clone());

            for operation in version.operations() {
                migrators::apply(&mut plan, &version.id, operation)?;
            }
        }

        if plan.versions.is_empty() {
            return Err(MigrationError::NoChanges {
                from: from.to_string(),
                to: to.to_string(),
            });
        }

        info!(
            migration_id = %migration_id_hex(&plan.id),
            from = %plan.from,
            to = %plan.to,
            versions = plan.versions.len(),
            tables = plan.tables.len(),
            operations = plan.steps.len(),
            "migration planned"
        );
        Ok(plan)
    }

    /// Check if a physical table existed before this plan.
    pub fn is_committed(&self, table_id: &str) -> bool {
        self.committed.contains(table_id)
    }

    /// Find a planned table by physical identifier.
    pub fn planned(&self, table_id: &str) -> Option<&PlannedTable> {
        self.tables.iter().find(|t| t.table_id == table_id)
    }

    /// Definitions of the planned tables, referred tables first.
    ///
    /// Tables in a foreign-key cycle keep their planning order.
    pub fn creation_order(&self) -> Result<Vec<&TableDef>, MigrationError> {
        let planned: BTreeSet<&str> = self.tables.iter().map(|t| t.table_id.as_str()).collect();
        let mut pending: Vec<&TableDef> = self
            .tables
            .iter()
            .map(|t| self.catalog.table(&t.table_id))
            .collect::<Result<_, _>>()?;

        let mut ordered = Vec::with_capacity(pending.len());
        let mut created: BTreeSet<&str> = BTreeSet::new();
        while !pending.is_empty() {
            let ready = pending.iter().position(|table| {
                table.foreign_keys.iter().all(|fk| {
                    fk.referred_table == table.id
                        || !planned.contains(fk.referred_table.as_str())
                        || created.contains(fk.referred_table.as_str())
                })
            });
            let table = pending.remove(ready.unwrap_or(0));
            created.insert(table.id.as_str());
            ordered.push(table);
        }
        Ok(ordered)
    }

    /// Collapsed mappings that fill each planned table from a committed
    /// table.
    ///
    /// Tables whose chain ends at a table created by this plan start empty
    /// and get no rule.
    pub fn backfill_rules(&self) -> Result<Vec<ResolvedMapping>, MigrationError> {
        let mut rules = Vec::new();
        for planned in &self.tables {
            if !self.data_mappings.contains(&planned.table_id) {
                continue;
            }
            let table = self.catalog.table(&planned.table_id)?;
            let rule = self.data_mappings.resolve(
                &planned.table_id,
                table.columns.iter().map(|c| c.name.as_str()),
                |t| self.committed.contains(t),
            )?;
            if self.committed.contains(&rule.source_table) {
                rules.push(rule);
            } else {
                debug!(
                    table = %planned.table_id,
                    source = %rule.source_table,
                    "source is new in this plan, table starts empty"
                );
            }
        }
        Ok(rules)
    }

    /// Commit the plan onto the latest committed state.
    ///
    /// Change-sets appended since planning are kept. Fails if another
    /// migration committed any of the planned versions in the meantime.
    pub fn merge_into(&self, latest: &State) -> Result<State, MigrationError> {
        let mut merged = latest.clone();

        for version in &self.versions {
            let scope = self
                .ref_log
                .scope_of(version)
                .cloned()
                .ok_or_else(|| MigrationError::StateCorrupted {
                    message: format!("planned version {} has no scope", version),
                })?;
            merged
                .ref_log
                .insert_scope(version.clone(), scope)
                .map_err(|e| MigrationError::StateCorrupted {
                    message: e.to_string(),
                })?;
        }

        for planned in &self.tables {
            merged
                .catalog
                .add_table(self.catalog.table(&planned.table_id)?.clone())
                .map_err(|e| MigrationError::StateCorrupted {
                    message: e.to_string(),
                })?;
            if let Some(mapping) = self.data_mappings.get(&planned.table_id) {
                merged.data_mappings.insert(mapping.clone())?;
            }
        }

        merged.catalog.validate()?;
        merged.current = self.to.clone();
        Ok(merged)
    }

    /// Summary for display.
    pub fn report(&self) -> PlanReport {
        let mut tables_by_version: BTreeMap<String, Vec<PlannedTable>> = BTreeMap::new();
        for table in &self.tables {
            tables_by_version
                .entry(table.version.to_string())
                .or_default()
                .push(table.clone());
        }
        PlanReport {
            migration_id: migration_id_hex(&self.id),
            from: self.from.to_string(),
            to: self.to.to_string(),
            versions: self.versions.iter().map(ToString::to_string).collect(),
            operations: self.steps.iter().map(|s| s.operation.to_string()).collect(),
            tables: tables_by_version,
        }
    }
}

/// Serializable summary of a plan.
#[derive(Debug, Clone, serde::Serialize)]
pub struct PlanReport {
    /// Hex migration ID.
    pub migration_id: String,
    /// Source version.
    pub from: String,
    /// Target version.
    pub to: String,
    /// Versions forked by the plan.
    pub versions: Vec<String>,
    /// Applied operations.
    pub operations: Vec<String>,
    /// New tables per version.
    pub tables: BTreeMap<String, Vec<PlannedTable>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{ColumnDef, ColumnHint, DataType, ForeignKeyDef};
    use crate::operation::builder::*;
    use crate::value::Value;

    fn state_with_users_and_posts() -> State {
        let mut state = State::new();
        let users = state
            .create_table(
                "users",
                TableDef::new("")
                    .with_column(ColumnDef::primary_key("id", DataType::BigInt))
                    .with_column(ColumnDef::new("name", DataType::Text)),
            )
            .unwrap();
        state
            .create_table(
                "posts",
                TableDef::new("")
                    .with_column(ColumnDef::primary_key("id", DataType::BigInt))
                    .with_column(ColumnDef::new("author_id", DataType::BigInt))
                    .with_foreign_key(ForeignKeyDef::new("fk_author", ["author_id"], users, ["id"])),
            )
            .unwrap();
        state
    }

    #[test]
    fn test_build_requires_changes() {
        let state = State::new();
        let root = state.current.clone();
        let err = MigrationPlan::build(&state, &root, &root).unwrap_err();
        assert!(matches!(err, MigrationError::NoChanges { .. }));
    }

    #[test]
    fn test_build_mirrors_connected_tables() {
        let mut state = state_with_users_and_posts();
        let from = state.current.clone();
        let to = state
            .changelog
            .add_change_set(
                "dev",
                "activation flag",
                vec![add_column("users", "active", DataType::Bool, Value::Bool(false), &[ColumnHint::NotNull])],
            )
            .id
            .clone();

        let plan = MigrationPlan::build(&state, &from, &to).unwrap();
        assert_eq!(plan.versions, vec![to.clone()]);
        assert_eq!(plan.tables.len(), 2);
        assert!(plan.tables.iter().all(|t| t.origin == TableOrigin::Mirror));
        assert_eq!(plan.steps[0].stage, OperationStage::MappingRecorded);

        // Parent tables are untouched.
        let old_users = state.table(&from, "users").unwrap();
        assert!(!old_users.has_column("active"));

        // Posts' ghost refers to the users ghost.
        let users = plan.ref_log.table_id(&to, "users").unwrap();
        let posts = plan.catalog.table(plan.ref_log.table_id(&to, "posts").unwrap()).unwrap();
        assert_eq!(posts.foreign_keys[0].referred_table, users);

        // Referred tables are created first.
        let order: Vec<&str> = plan.creation_order().unwrap().iter().map(|t| t.id.as_str()).collect();
        assert_eq!(order[0], users);

        let rules = plan.backfill_rules().unwrap();
        assert_eq!(rules.len(), 2);
        assert!(rules.iter().all(|r| plan.is_committed(&r.source_table)));
    }

    #[test]
    fn test_merge_into_commits_target() {
        let mut state = state_with_users_and_posts();
        let from = state.current.clone();
        let to = state
            .changelog
            .add_change_set("dev", "index", vec![create_index("users", ["name"])])
            .id
            .clone();

        let plan = MigrationPlan::build(&state, &from, &to).unwrap();
        let merged = plan.merge_into(&state).unwrap();

        assert_eq!(merged.current, to);
        assert_eq!(merged.catalog.len(), 4);
        assert!(merged.ref_log.is_frozen(&from));
        assert!(merged.table(&to, "users").unwrap().index_on(&["name".to_string()]).is_some());

        // A second commit of the same versions conflicts.
        let err = plan.merge_into(&merged).unwrap_err();
        assert!(matches!(err, MigrationError::StateCorrupted { .. }));
    }

    #[test]
    fn test_build_rejects_unrelated_versions() {
        let mut state = state_with_users_and_posts();
        let root = state.current.clone();
        let a = state
            .changelog
            .add_change_set("dev", "a", vec![create_index("users", ["name"])])
            .id
            .clone();
        let b = state
            .changelog
            .add_change_set_after(&root, "dev", "b", vec![drop_column("users", "name")])
            .unwrap()
            .id
            .clone();

        assert!(MigrationPlan::build(&state, &a, &b).is_err());
    }
}

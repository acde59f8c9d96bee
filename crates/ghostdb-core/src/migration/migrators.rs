//! Per-operation schema migrators.
//!
//! Every operation follows the same contract: mirror the touched tables at
//! the version, change the ghost definitions, record how the ghost's columns
//! derive from its source, and check that mappings and catalog are still
//! consistent. Tables of the parent version are never modified.

use super::data_mapping::Derivation;
use super::error::MigrationError;
use super::mirror::{successor, TransitiveTableMirrorer};
use super::plan::{MigrationPlan, OperationStage, PlannedStep, PlannedTable, TableOrigin};
use crate::catalog::{
    default_foreign_key_name, default_index_name, ColumnDef, ColumnHint, ConstraintDef,
    ConstraintKind, DataType, ForeignKeyDef, IndexDef, IndexKind, TableDef,
};
use crate::error::Error;
use crate::operation::{ForeignKeyRef, SchemaOperation};
use crate::value::Value;
use crate::versioning::VersionId;
use tracing::debug;

/// Apply one operation of `version`'s change-set to the plan.
pub fn apply(
    plan: &mut MigrationPlan,
    version: &VersionId,
    operation: &SchemaOperation,
) -> Result<(), MigrationError> {
    let mut migrator = Migrator {
        plan,
        version,
        operation,
        stage: OperationStage::Unapplied,
    };

    match operation {
        SchemaOperation::CreateTable {
            table,
            columns,
            foreign_keys,
        } => migrator.create_table(table, columns, foreign_keys)?,
        SchemaOperation::AddColumn { table, column } => migrator.add_column(table, column)?,
        SchemaOperation::DropColumn { table, column } => migrator.drop_column(table, column)?,
        SchemaOperation::RenameColumn {
            table,
            column,
            new_name,
        } => migrator.rename_column(table, column, new_name)?,
        SchemaOperation::AlterColumnType {
            table,
            column,
            data_type,
        } => migrator.alter_column_type(table, column, data_type)?,
        SchemaOperation::CreateIndex {
            table,
            name,
            columns,
            unique,
        } => migrator.create_index(table, name.as_deref(), columns, *unique, IndexKind::BTree)?,
        SchemaOperation::CreateFulltextIndex {
            table,
            name,
            columns,
        } => migrator.create_index(table, name.as_deref(), columns, false, IndexKind::Fulltext)?,
        SchemaOperation::DropIndex { table, columns } => migrator.drop_index(table, columns)?,
        SchemaOperation::AddForeignKey { table, foreign_key } => {
            migrator.add_foreign_key(table, foreign_key)?
        }
        SchemaOperation::DropForeignKey { table, name } => migrator.drop_foreign_key(table, name)?,
        SchemaOperation::AddConstraint { table, constraint } => {
            migrator.add_constraint(table, constraint)?
        }
        SchemaOperation::DropConstraint { table, name } => migrator.drop_constraint(table, name)?,
        SchemaOperation::CopyTable { source, target } => migrator.copy_table(source, target)?,
        SchemaOperation::RenameTable { table, new_name } => migrator.rename_table(table, new_name)?,
    }

    migrator.finish()
}

struct Migrator<'a> {
    plan: &'a mut MigrationPlan,
    version: &'a VersionId,
    operation: &'a SchemaOperation,
    stage: OperationStage,
}

impl<'a> Migrator<'a> {
    fn create_table(
        &mut self,
        logical: &str,
        columns: &[ColumnDef],
        foreign_keys: &[ForeignKeyRef],
    ) -> Result<(), MigrationError> {
        let reject = self.rejecter();
        if self.plan.ref_log.table_id(self.version, logical).is_ok() {
            return Err(reject(Error::TableRefExists {
                version: self.version.to_string(),
                table: logical.to_string(),
            }));
        }
        self.stage = OperationStage::Mirrored;

        let plan = &mut *self.plan;
        let catalog = &plan.catalog;
        let id = plan.ids.derive("table", &[self.version.as_str(), logical], |candidate| {
            catalog.contains(candidate)
        });

        let mut table = TableDef::new(&id);
        for column in columns {
            let column = normalize_column(logical, column).map_err(&reject)?;
            table.add_column(column).map_err(&reject)?;
        }
        if table.primary_key().is_empty() {
            return Err(reject(Error::MissingPrimaryKey(logical.to_string())));
        }

        for fk in foreign_keys {
            let definition = if fk.referred_table == logical {
                let definition = foreign_key_def(logical, fk, id.clone());
                check_foreign_key(&table, &table, &definition).map_err(&reject)?;
                definition
            } else {
                let referred_id = self.resolve(&fk.referred_table)?;
                let definition = foreign_key_def(logical, fk, referred_id.clone());
                let referred = self.plan.catalog.table(&referred_id)?;
                check_foreign_key(&table, referred, &definition).map_err(&reject)?;
                definition
            };
            table.add_foreign_key(definition).map_err(&reject)?;
        }

        self.plan.catalog.add_table(table).map_err(&reject)?;
        self.plan
            .ref_log
            .add_table(logical, &id, self.version)
            .map_err(&reject)?;
        self.plan.tables.push(PlannedTable {
            version: self.version.clone(),
            logical: logical.to_string(),
            table_id: id,
            source_table: None,
            origin: TableOrigin::Created,
        });
        self.stage = OperationStage::Mutated;
        Ok(())
    }

    fn add_column(&mut self, logical: &str, column: &ColumnDef) -> Result<(), MigrationError> {
        let reject = self.rejecter();
        let id = self.mirror(&[logical])?;
        if column.is_primary_key() {
            return Err(reject(Error::PrimaryKeyColumn {
                table: logical.to_string(),
                column: column.name.clone(),
            }));
        }
        let column = normalize_column(logical, column).map_err(&reject)?;
        if !column.is_nullable() && column.default.is_none() {
            return Err(reject(Error::NotNullWithoutDefault {
                table: logical.to_string(),
                column: column.name.clone(),
            }));
        }

        let name = column.name.clone();
        let fill = column.default.clone().unwrap_or(Value::Null);
        self.table_mut(&id)?
            .add_column(column)
            .map_err(&reject)?;
        self.stage = OperationStage::Mutated;

        if self.plan.data_mappings.contains(&id) {
            self.plan
                .data_mappings
                .set(&id, &name, Derivation::constant(fill))?;
        }
        Ok(())
    }

    fn drop_column(&mut self, logical: &str, column: &str) -> Result<(), MigrationError> {
        let reject = self.rejecter();
        let id = self.mirror(&[logical])?;
        let table = self.plan.catalog.table(&id)?;
        let definition = table.column(column).ok_or_else(|| {
            reject(Error::ColumnNotFound {
                table: logical.to_string(),
                column: column.to_string(),
            })
        })?;
        if definition.is_primary_key() {
            return Err(reject(Error::PrimaryKeyColumn {
                table: logical.to_string(),
                column: column.to_string(),
            }));
        }
        if let Some((referencing, fk)) = self
            .plan
            .catalog
            .referencing(&id)
            .into_iter()
            .find(|(t, fk)| t.id != id && fk.refers_to_column(column))
        {
            return Err(reject(Error::ColumnReferenced {
                table: logical.to_string(),
                column: column.to_string(),
                by: format!("{}.{}", self.display_name(&referencing.id), fk.name),
            }));
        }

        let table = self.table_mut(&id)?;
        table.remove_column(column).map_err(&reject)?;
        let removed = table.remove_dependents_of(column);
        // Self-referencing keys onto the dropped column go too.
        table
            .foreign_keys
            .retain(|fk| !(fk.referred_table == id && fk.refers_to_column(column)));
        if !removed.is_empty() {
            debug!(table = logical, column, removed = ?removed, "dropped dependents of column");
        }
        self.stage = OperationStage::Mutated;

        if self.plan.data_mappings.contains(&id) {
            self.plan.data_mappings.drop(&id, column)?;
        }
        Ok(())
    }

    fn rename_column(&mut self, logical: &str, column: &str, new_name: &str) -> Result<(), MigrationError> {
        let reject = self.rejecter();
        let id = self.mirror(&[logical])?;
        self.table_mut(&id)?
            .rename_column(column, new_name)
            .map_err(&reject)?;

        let referencing: Vec<(String, String)> = self
            .plan
            .catalog
            .referencing(&id)
            .into_iter()
            .filter(|(_, fk)| fk.refers_to_column(column))
            .map(|(t, fk)| (t.id.clone(), fk.name.clone()))
            .collect();
        for (table_id, fk_name) in referencing {
            let table = self.table_mut(&table_id)?;
            if let Some(fk) = table.foreign_keys.iter_mut().find(|fk| fk.name == fk_name) {
                for referred in fk.referred_columns.iter_mut().filter(|c| *c == column) {
                    *referred = new_name.to_string();
                }
            }
        }
        self.stage = OperationStage::Mutated;

        if self.plan.data_mappings.contains(&id) {
            self.plan.data_mappings.rename(&id, column, new_name)?;
        }
        Ok(())
    }

    fn alter_column_type(
        &mut self,
        logical: &str,
        column: &str,
        data_type: &DataType,
    ) -> Result<(), MigrationError> {
        let reject = self.rejecter();
        let id = self.mirror(&[logical])?;
        let table = self.plan.catalog.table(&id)?;
        let current = table
            .column(column)
            .ok_or_else(|| {
                reject(Error::ColumnNotFound {
                    table: logical.to_string(),
                    column: column.to_string(),
                })
            })?
            .clone();

        if !current.data_type.can_convert_to(data_type) {
            return Err(reject(Error::IncompatibleType {
                table: logical.to_string(),
                column: column.to_string(),
                from: current.data_type.to_string(),
                to: data_type.to_string(),
            }));
        }

        let outgoing = table.foreign_keys.iter().find(|fk| fk.uses_column(column));
        let incoming = self
            .plan
            .catalog
            .referencing(&id)
            .into_iter()
            .find(|(_, fk)| fk.refers_to_column(column))
            .map(|(_, fk)| fk);
        if let Some(fk) = outgoing.or(incoming) {
            return Err(reject(Error::ColumnInForeignKey {
                table: logical.to_string(),
                column: column.to_string(),
                foreign_key: fk.name.clone(),
            }));
        }

        if !data_type.is_text() {
            if let Some(idx) = table
                .indexes
                .iter()
                .find(|idx| idx.kind == IndexKind::Fulltext && idx.covers(column))
            {
                return Err(reject(Error::InvalidIndex {
                    table: logical.to_string(),
                    index: idx.name.clone(),
                    reason: format!("full-text column {} must stay text", column),
                }));
            }
        }

        let default = match &current.default {
            Some(value) => Some(value.cast(data_type).map_err(&reject)?),
            None => None,
        };
        let definition = self
            .table_mut(&id)?
            .column_mut(column)
            .ok_or_else(|| MigrationError::StateCorrupted {
                message: format!("column {} vanished from {}", column, id),
            })?;
        definition.data_type = data_type.clone();
        definition.default = default;
        self.stage = OperationStage::Mutated;

        if self.plan.data_mappings.contains(&id) {
            self.plan.data_mappings.cast(&id, column, data_type.clone())?;
        }
        Ok(())
    }

    fn create_index(
        &mut self,
        logical: &str,
        name: Option<&str>,
        columns: &[String],
        unique: bool,
        kind: IndexKind,
    ) -> Result<(), MigrationError> {
        let reject = self.rejecter();
        let id = self.mirror(&[logical])?;
        let name = name
            .map(String::from)
            .unwrap_or_else(|| default_index_name(logical, columns, kind));
        if columns.is_empty() {
            return Err(reject(Error::InvalidIndex {
                table: logical.to_string(),
                index: name,
                reason: "no columns".into(),
            }));
        }

        if kind == IndexKind::Fulltext {
            let table = self.plan.catalog.table(&id)?;
            for column in columns {
                if let Some(definition) = table.column(column) {
                    if !definition.data_type.is_text() {
                        return Err(reject(Error::InvalidIndex {
                            table: logical.to_string(),
                            index: name,
                            reason: format!("column {} is {}, not text", column, definition.data_type),
                        }));
                    }
                }
            }
        }

        let mut index = IndexDef::new(name, columns.iter().cloned());
        index.kind = kind;
        if unique {
            index = index.unique();
        }
        self.table_mut(&id)?
            .add_index(index)
            .map_err(&reject)?;
        self.stage = OperationStage::Mutated;
        Ok(())
    }

    fn drop_index(&mut self, logical: &str, columns: &[String]) -> Result<(), MigrationError> {
        let reject = self.rejecter();
        let id = self.mirror(&[logical])?;
        self.table_mut(&id)?
            .remove_index_on(columns)
            .map_err(&reject)?;
        self.stage = OperationStage::Mutated;
        Ok(())
    }

    fn add_foreign_key(&mut self, logical: &str, fk: &ForeignKeyRef) -> Result<(), MigrationError> {
        let reject = self.rejecter();
        self.mirror(&[logical, fk.referred_table.as_str()])?;
        let id = self.resolve(logical)?;
        let referred_id = self.resolve(&fk.referred_table)?;

        let definition = foreign_key_def(logical, fk, referred_id.clone());
        let table = self.plan.catalog.table(&id)?;
        let referred = self.plan.catalog.table(&referred_id)?;
        check_foreign_key(table, referred, &definition).map_err(&reject)?;

        self.table_mut(&id)?
            .add_foreign_key(definition)
            .map_err(&reject)?;
        self.stage = OperationStage::Mutated;
        Ok(())
    }

    fn drop_foreign_key(&mut self, logical: &str, name: &str) -> Result<(), MigrationError> {
        let reject = self.rejecter();
        let id = self.mirror(&[logical])?;
        self.table_mut(&id)?
            .remove_foreign_key(name)
            .map_err(&reject)?;
        self.stage = OperationStage::Mutated;
        Ok(())
    }

    fn add_constraint(&mut self, logical: &str, constraint: &ConstraintDef) -> Result<(), MigrationError> {
        let reject = self.rejecter();
        let id = self.mirror(&[logical])?;
        let table = self.table_mut(&id)?;
        table
            .add_constraint(constraint.clone())
            .map_err(&reject)?;
        if let ConstraintKind::NotNull { column } = &constraint.kind {
            if let Some(definition) = table.column_mut(column) {
                definition.set_hint(ColumnHint::NotNull);
            }
        }
        self.stage = OperationStage::Mutated;
        Ok(())
    }

    fn drop_constraint(&mut self, logical: &str, name: &str) -> Result<(), MigrationError> {
        let reject = self.rejecter();
        let id = self.mirror(&[logical])?;
        let table = self.table_mut(&id)?;
        let removed = table.remove_constraint(name).map_err(&reject)?;
        if let ConstraintKind::NotNull { column } = &removed.kind {
            let still_required = table.constraints.iter().any(|c| {
                matches!(&c.kind, ConstraintKind::NotNull { column: other } if other == column)
            });
            if let Some(definition) = table.column_mut(column) {
                if !still_required && !definition.is_primary_key() {
                    definition.remove_hint(ColumnHint::NotNull);
                }
            }
        }
        self.stage = OperationStage::Mutated;
        Ok(())
    }

    fn copy_table(&mut self, source: &str, target: &str) -> Result<(), MigrationError> {
        let reject = self.rejecter();
        let source_id = self.resolve(source)?;
        if self.plan.ref_log.table_id(self.version, target).is_ok() {
            return Err(reject(Error::TableRefExists {
                version: self.version.to_string(),
                table: target.to_string(),
            }));
        }
        self.stage = OperationStage::Mirrored;

        let plan = &mut *self.plan;
        let catalog = &plan.catalog;
        let id = plan.ids.derive("table", &[self.version.as_str(), target], |candidate| {
            catalog.contains(candidate)
        });

        let original = self.plan.catalog.table(&source_id)?;
        let mut copy = original.copy_as(&id);
        for fk in &original.foreign_keys {
            let mut fk = fk.clone();
            fk.referred_table = if fk.referred_table == source_id {
                id.clone()
            } else {
                successor(self.plan, self.version, &fk.referred_table).ok_or_else(|| {
                    reject(Error::InvalidForeignKey {
                        table: target.to_string(),
                        foreign_key: fk.name.clone(),
                        reason: format!("{} does not resolve at the version", fk.referred_table),
                    })
                })?
            };
            copy.foreign_keys.push(fk);
        }

        self.plan.catalog.add_table(copy).map_err(&reject)?;
        self.plan
            .ref_log
            .add_table(target, &id, self.version)
            .map_err(&reject)?;
        self.stage = OperationStage::Mutated;
        self.plan.data_mappings.copy(self.version, &source_id, &id)?;
        self.plan.tables.push(PlannedTable {
            version: self.version.clone(),
            logical: target.to_string(),
            table_id: id,
            source_table: Some(source_id),
            origin: TableOrigin::Copy,
        });
        Ok(())
    }

    fn rename_table(&mut self, logical: &str, new_name: &str) -> Result<(), MigrationError> {
        let reject = self.rejecter();
        self.stage = OperationStage::Mirrored;
        self.plan
            .ref_log
            .rename(self.version, logical, new_name)
            .map_err(&reject)?;
        if let Some(planned) = self
            .plan
            .tables
            .iter_mut()
            .find(|t| &t.version == self.version && t.logical == logical)
        {
            planned.logical = new_name.to_string();
        }
        self.stage = OperationStage::Mutated;
        Ok(())
    }

    /// Check mappings and catalog, then record the step.
    fn finish(mut self) -> Result<(), MigrationError> {
        let reject = self.rejecter();
        for planned in self.plan.tables.iter().filter(|t| &t.version == self.version) {
            self.plan
                .data_mappings
                .verify(&planned.table_id, &self.plan.catalog)
                .map_err(&reject)?;
        }
        self.plan.catalog.validate().map_err(&reject)?;

        self.stage = OperationStage::MappingRecorded;

        debug!(version = %self.version, operation = %self.operation, "operation applied");
        self.plan.steps.push(PlannedStep {
            version: self.version.clone(),
            operation: self.operation.clone(),
            stage: self.stage,
        });
        Ok(())
    }

    /// Mirror tables and return the physical identifier the first one
    /// resolves to at the version.
    fn mirror(&mut self, tables: &[&str]) -> Result<String, MigrationError> {
        for table in tables {
            self.resolve(table)?;
        }
        TransitiveTableMirrorer::new(self.plan, self.version).mirror(tables)?;
        self.stage = OperationStage::Mirrored;
        self.resolve(tables[0])
    }

    fn resolve(&self, logical: &str) -> Result<String, MigrationError> {
        self.plan
            .ref_log
            .table_id(self.version, logical)
            .map(String::from)
            .map_err(self.rejecter())
    }

    fn table_mut(&mut self, id: &str) -> Result<&mut TableDef, MigrationError> {
        Ok(self.plan.catalog.table_mut(id)?)
    }

    fn display_name(&self, id: &str) -> String {
        self.plan
            .ref_log
            .table_name(self.version, id)
            .unwrap_or(id)
            .to_string()
    }

    fn rejecter(&self) -> impl Fn(Error) -> MigrationError + 'a {
        let (version, operation) = (self.version, self.operation);
        move |source| {
            debug!(operation = %operation, error = %source, "operation rejected");
            MigrationError::Planning {
                version: version.to_string(),
                operation: operation.to_string(),
                source,
            }
        }
    }
}

/// Coerce a requested column's default to its type. A NULL default is the
/// same as none.
fn normalize_column(table: &str, column: &ColumnDef) -> Result<ColumnDef, Error> {
    let mut column = column.clone();
    if let Some(default) = column.default.take() {
        let value = default
            .coerce_to(&column.data_type)
            .map_err(|reason| Error::TypeMismatch {
                table: table.to_string(),
                column: column.name.clone(),
                expected: column.data_type.to_string(),
                reason,
            })?;
        if !value.is_null() {
            column.default = Some(value);
        }
    }
    Ok(column)
}

fn foreign_key_def(table: &str, fk: &ForeignKeyRef, referred_table: String) -> ForeignKeyDef {
    let name = fk
        .name
        .clone()
        .unwrap_or_else(|| default_foreign_key_name(table, &fk.columns));
    ForeignKeyDef::new(name, fk.columns.iter().cloned(), referred_table, fk.referred_columns.iter().cloned())
        .on_update(fk.on_update)
        .on_delete(fk.on_delete)
}

/// Check a foreign key of `table` against the table it refers to.
fn check_foreign_key(table: &TableDef, referred: &TableDef, fk: &ForeignKeyDef) -> Result<(), Error> {
    let invalid = |reason: String| Error::InvalidForeignKey {
        table: table.id.clone(),
        foreign_key: fk.name.clone(),
        reason,
    };

    if fk.referencing_columns.is_empty() || fk.referencing_columns.len() != fk.referred_columns.len() {
        return Err(invalid(format!(
            "{} referencing columns for {} referred columns",
            fk.referencing_columns.len(),
            fk.referred_columns.len()
        )));
    }
    for (local, remote) in fk.referencing_columns.iter().zip(&fk.referred_columns) {
        let local_column = table.column(local).ok_or_else(|| Error::ColumnNotFound {
            table: table.id.clone(),
            column: local.clone(),
        })?;
        let remote_column = referred.column(remote).ok_or_else(|| Error::ColumnNotFound {
            table: referred.id.clone(),
            column: remote.clone(),
        })?;
        if local_column.data_type != remote_column.data_type {
            return Err(invalid(format!(
                "{} is {} but {} is {}",
                local, local_column.data_type, remote, remote_column.data_type
            )));
        }
    }
    if !referred.is_unique_key(&fk.referred_columns) {
        return Err(invalid(format!(
            "({}) is not a unique key of the referred table",
            fk.referred_columns.join(", ")
        )));
    }
    Ok(())
}

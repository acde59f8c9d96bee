//! Table definitions and their structural operations.

use super::column::ColumnDef;
use super::constraint::{ConstraintDef, ConstraintKind};
use super::foreign_key::ForeignKeyDef;
use super::index::IndexDef;
use crate::error::Error;
use rkyv::{Archive, Deserialize, Serialize};

/// A physical table definition.
#[derive(
    Debug, Clone, PartialEq, Archive, Serialize, Deserialize, serde::Serialize, serde::Deserialize,
)]
pub struct TableDef {
    /// Physical table identifier.
    pub id: String,
    /// Columns in declaration order.
    pub columns: Vec<ColumnDef>,
    /// Indexes.
    #[serde(default)]
    pub indexes: Vec<IndexDef>,
    /// Outgoing foreign keys.
    #[serde(default)]
    pub foreign_keys: Vec<ForeignKeyDef>,
    /// Named constraints.
    #[serde(default)]
    pub constraints: Vec<ConstraintDef>,
}

impl TableDef {
    /// Create an empty table definition.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            columns: Vec::new(),
            indexes: Vec::new(),
            foreign_keys: Vec::new(),
            constraints: Vec::new(),
        }
    }

    /// Add a column.
    pub fn with_column(mut self, column: ColumnDef) -> Self {
        self.columns.push(column);
        self
    }

    /// Add an index.
    pub fn with_index(mut self, index: IndexDef) -> Self {
        self.indexes.push(index);
        self
    }

    /// Add a foreign key.
    pub fn with_foreign_key(mut self, foreign_key: ForeignKeyDef) -> Self {
        self.foreign_keys.push(foreign_key);
        self
    }

    /// Add a constraint.
    pub fn with_constraint(mut self, constraint: ConstraintDef) -> Self {
        self.constraints.push(constraint);
        self
    }

    /// Get a column by name.
    pub fn column(&self, name: &str) -> Option<&ColumnDef> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Get a column by name (mutable).
    pub fn column_mut(&mut self, name: &str) -> Option<&mut ColumnDef> {
        self.columns.iter_mut().find(|c| c.name == name)
    }

    /// Check if a column exists.
    pub fn has_column(&self, name: &str) -> bool {
        self.column(name).is_some()
    }

    /// Column names in declaration order.
    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }

    /// Primary key column names in declaration order.
    pub fn primary_key(&self) -> Vec<&str> {
        self.columns
            .iter()
            .filter(|c| c.is_primary_key())
            .map(|c| c.name.as_str())
            .collect()
    }

    /// Append a column.
    pub fn add_column(&mut self, column: ColumnDef) -> Result<(), Error> {
        if self.has_column(&column.name) {
            return Err(Error::ColumnExists {
                table: self.id.clone(),
                column: column.name,
            });
        }
        self.columns.push(column);
        Ok(())
    }

    /// Remove a column, leaving indexes and keys that mention it alone.
    pub fn remove_column(&mut self, name: &str) -> Result<ColumnDef, Error> {
        let pos = self
            .columns
            .iter()
            .position(|c| c.name == name)
            .ok_or_else(|| self.column_not_found(name))?;
        Ok(self.columns.remove(pos))
    }

    /// Remove every index, outgoing foreign key and constraint that names a
    /// column. Returns the names of what was removed.
    pub fn remove_dependents_of(&mut self, column: &str) -> Vec<String> {
        let mut removed = Vec::new();

        self.indexes.retain(|idx| {
            let keep = !idx.covers(column);
            if !keep {
                removed.push(idx.name.clone());
            }
            keep
        });
        self.foreign_keys.retain(|fk| {
            let keep = !fk.uses_column(column);
            if !keep {
                removed.push(fk.name.clone());
            }
            keep
        });
        self.constraints.retain(|c| {
            let keep = !c.covers(column);
            if !keep {
                removed.push(c.name.clone());
            }
            keep
        });

        removed
    }

    /// Rename a column and every reference to it within this table.
    pub fn rename_column(&mut self, old: &str, new: &str) -> Result<(), Error> {
        if self.has_column(new) {
            return Err(Error::ColumnExists {
                table: self.id.clone(),
                column: new.to_string(),
            });
        }
        let id = self.id.clone();
        let column = self.column_mut(old).ok_or_else(|| Error::ColumnNotFound {
            table: id,
            column: old.to_string(),
        })?;
        column.name = new.to_string();

        for idx in &mut self.indexes {
            for c in idx.columns.iter_mut().filter(|c| *c == old) {
                *c = new.to_string();
            }
        }
        for fk in &mut self.foreign_keys {
            for c in fk.referencing_columns.iter_mut().filter(|c| *c == old) {
                *c = new.to_string();
            }
        }
        for constraint in &mut self.constraints {
            constraint.rename_column(old, new);
        }
        Ok(())
    }

    /// Get the index on exactly these columns.
    pub fn index_on(&self, columns: &[String]) -> Option<&IndexDef> {
        self.indexes.iter().find(|idx| idx.is_on(columns))
    }

    /// Get an index by name.
    pub fn index_named(&self, name: &str) -> Option<&IndexDef> {
        self.indexes.iter().find(|idx| idx.name == name)
    }

    /// Add an index. Its name and column tuple must both be new.
    pub fn add_index(&mut self, index: IndexDef) -> Result<(), Error> {
        if let Some(missing) = index.columns.iter().find(|c| !self.has_column(c)) {
            return Err(self.column_not_found(missing));
        }
        if self.index_named(&index.name).is_some() {
            return Err(Error::IndexExists {
                table: self.id.clone(),
                index: index.name,
            });
        }
        if self.index_on(&index.columns).is_some() {
            return Err(Error::IndexExists {
                table: self.id.clone(),
                index: format!("({})", index.columns.join(", ")),
            });
        }
        self.indexes.push(index);
        Ok(())
    }

    /// Remove the index on exactly these columns.
    pub fn remove_index_on(&mut self, columns: &[String]) -> Result<IndexDef, Error> {
        let pos = self
            .indexes
            .iter()
            .position(|idx| idx.is_on(columns))
            .ok_or_else(|| Error::IndexNotFound {
                table: self.id.clone(),
                index: format!("({})", columns.join(", ")),
            })?;
        Ok(self.indexes.remove(pos))
    }

    /// Get a foreign key by name.
    pub fn foreign_key(&self, name: &str) -> Option<&ForeignKeyDef> {
        self.foreign_keys.iter().find(|fk| fk.name == name)
    }

    /// Add a foreign key. Its referencing columns must exist.
    pub fn add_foreign_key(&mut self, foreign_key: ForeignKeyDef) -> Result<(), Error> {
        if self.name_taken(&foreign_key.name) {
            return Err(Error::ConstraintExists {
                table: self.id.clone(),
                name: foreign_key.name,
            });
        }
        if let Some(missing) = foreign_key
            .referencing_columns
            .iter()
            .find(|c| !self.has_column(c))
        {
            return Err(self.column_not_found(missing));
        }
        self.foreign_keys.push(foreign_key);
        Ok(())
    }

    /// Remove a foreign key by name.
    pub fn remove_foreign_key(&mut self, name: &str) -> Result<ForeignKeyDef, Error> {
        let pos = self
            .foreign_keys
            .iter()
            .position(|fk| fk.name == name)
            .ok_or_else(|| Error::ForeignKeyNotFound {
                table: self.id.clone(),
                name: name.to_string(),
            })?;
        Ok(self.foreign_keys.remove(pos))
    }

    /// Get a constraint by name.
    pub fn constraint(&self, name: &str) -> Option<&ConstraintDef> {
        self.constraints.iter().find(|c| c.name == name)
    }

    /// Add a constraint. The columns it names must exist.
    pub fn add_constraint(&mut self, constraint: ConstraintDef) -> Result<(), Error> {
        if self.name_taken(&constraint.name) {
            return Err(Error::ConstraintExists {
                table: self.id.clone(),
                name: constraint.name,
            });
        }
        if let Some(missing) = constraint.columns().into_iter().find(|c| !self.has_column(c)) {
            return Err(self.column_not_found(missing));
        }
        self.constraints.push(constraint);
        Ok(())
    }

    /// Remove a constraint by name.
    pub fn remove_constraint(&mut self, name: &str) -> Result<ConstraintDef, Error> {
        let pos = self
            .constraints
            .iter()
            .position(|c| c.name == name)
            .ok_or_else(|| Error::ConstraintNotFound {
                table: self.id.clone(),
                name: name.to_string(),
            })?;
        Ok(self.constraints.remove(pos))
    }

    /// Unique column sets other than the primary key, by index or
    /// constraint name.
    pub fn unique_keys(&self) -> Vec<(&str, &[String])> {
        let mut keys: Vec<(&str, &[String])> = Vec::new();
        for idx in self.indexes.iter().filter(|idx| idx.unique) {
            keys.push((idx.name.as_str(), idx.columns.as_slice()));
        }
        for constraint in &self.constraints {
            if let ConstraintKind::Unique { columns } = &constraint.kind {
                if !keys.iter().any(|(_, cols)| *cols == columns.as_slice()) {
                    keys.push((constraint.name.as_str(), columns.as_slice()));
                }
            }
        }
        keys
    }

    /// Check if these columns identify at most one row.
    pub fn is_unique_key(&self, columns: &[String]) -> bool {
        let pk = self.primary_key();
        if !pk.is_empty() && pk.len() == columns.len() && pk.iter().zip(columns).all(|(a, b)| *a == b.as_str())
        {
            return true;
        }
        self.unique_keys().iter().any(|(_, cols)| *cols == columns)
    }

    /// Copy this definition under a new identifier, without foreign keys.
    pub fn copy_as(&self, id: impl Into<String>) -> TableDef {
        TableDef {
            id: id.into(),
            columns: self.columns.clone(),
            indexes: self.indexes.clone(),
            foreign_keys: Vec::new(),
            constraints: self.constraints.clone(),
        }
    }

    fn name_taken(&self, name: &str) -> bool {
        self.foreign_key(name).is_some() || self.constraint(name).is_some()
    }

    fn column_not_found(&self, column: &str) -> Error {
        Error::ColumnNotFound {
            table: self.id.clone(),
            column: column.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::DataType;

    fn users() -> TableDef {
        TableDef::new("table_users")
            .with_column(ColumnDef::primary_key("id", DataType::BigInt))
            .with_column(ColumnDef::new("name", DataType::Text))
            .with_column(ColumnDef::new("email", DataType::Varchar(255)))
            .with_index(IndexDef::new("idx_email", ["email"]).unique())
            .with_index(IndexDef::new("idx_name_email", ["name", "email"]))
            .with_constraint(ConstraintDef::not_null("nn_email", "email"))
    }

    #[test]
    fn test_primary_key() {
        assert_eq!(users().primary_key(), vec!["id"]);
        assert_eq!(users().column_names(), vec!["id", "name", "email"]);
    }

    #[test]
    fn test_add_duplicate_column() {
        let mut table = users();
        let err = table
            .add_column(ColumnDef::new("email", DataType::Text))
            .unwrap_err();
        assert!(matches!(err, Error::ColumnExists { .. }));
    }

    #[test]
    fn test_remove_column_dependents() {
        let mut table = users();
        table.remove_column("email").unwrap();
        let mut removed = table.remove_dependents_of("email");
        removed.sort();

        assert_eq!(removed, vec!["idx_email", "idx_name_email", "nn_email"]);
        assert!(table.indexes.is_empty());
        assert!(table.constraints.is_empty());
        assert!(matches!(
            table.remove_column("email"),
            Err(Error::ColumnNotFound { .. })
        ));
    }

    #[test]
    fn test_rename_column_updates_references() {
        let mut table = users();
        table.rename_column("email", "mail").unwrap();

        assert!(table.has_column("mail"));
        assert!(!table.has_column("email"));
        assert!(table.index_on(&["mail".to_string()]).is_some());
        assert!(table.constraint("nn_email").unwrap().covers("mail"));
        assert!(matches!(
            table.rename_column("name", "mail"),
            Err(Error::ColumnExists { .. })
        ));
    }

    #[test]
    fn test_index_identity_is_column_tuple() {
        let mut table = users();
        let err = table
            .add_index(IndexDef::new("other_name", ["email"]))
            .unwrap_err();
        assert!(matches!(err, Error::IndexExists { .. }));

        let err = table
            .add_index(IndexDef::new("idx_missing", ["missing"]))
            .unwrap_err();
        assert!(matches!(err, Error::ColumnNotFound { .. }));

        table.remove_index_on(&["email".to_string()]).unwrap();
        assert!(table.index_named("idx_email").is_none());
    }

    #[test]
    fn test_unique_keys() {
        let table = users().with_constraint(ConstraintDef::unique("uq_name", ["name"]));
        let keys = table.unique_keys();
        assert_eq!(keys.len(), 2);
        assert!(table.is_unique_key(&["id".to_string()]));
        assert!(table.is_unique_key(&["name".to_string()]));
        assert!(!table.is_unique_key(&["name".to_string(), "email".to_string()]));
    }

    #[test]
    fn test_copy_drops_foreign_keys() {
        let table = users().with_foreign_key(ForeignKeyDef::new(
            "fk_self",
            ["id"],
            "table_other",
            ["id"],
        ));
        let copy = table.copy_as("table_copy");

        assert_eq!(copy.id, "table_copy");
        assert_eq!(copy.columns, table.columns);
        assert_eq!(copy.indexes, table.indexes);
        assert!(copy.foreign_keys.is_empty());
    }
}

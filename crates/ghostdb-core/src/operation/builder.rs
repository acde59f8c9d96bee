//! Free functions that build schema operations.
//!
//! Each call yields exactly one immutable [`SchemaOperation`] and has no
//! side effects until the operation is added to a change-set.

use super::{ForeignKeyRef, SchemaOperation};
use crate::catalog::{ColumnDef, ColumnHint, ConstraintDef, DataType, ReferentialAction};
use crate::value::Value;

fn strings(items: impl IntoIterator<Item = impl Into<String>>) -> Vec<String> {
    items.into_iter().map(Into::into).collect()
}

/// Create a table with the given columns.
pub fn create_table(table: impl Into<String>, columns: Vec<ColumnDef>) -> SchemaOperation {
    SchemaOperation::CreateTable {
        table: table.into(),
        columns,
        foreign_keys: Vec::new(),
    }
}

/// Create a table with columns and outgoing foreign keys.
pub fn create_table_with_keys(
    table: impl Into<String>,
    columns: Vec<ColumnDef>,
    foreign_keys: Vec<ForeignKeyRef>,
) -> SchemaOperation {
    SchemaOperation::CreateTable {
        table: table.into(),
        columns,
        foreign_keys,
    }
}

/// Add a column with a default value and hints.
///
/// Pass [`Value::Null`] for no default.
pub fn add_column(
    table: impl Into<String>,
    name: impl Into<String>,
    data_type: DataType,
    default: Value,
    hints: &[ColumnHint],
) -> SchemaOperation {
    let mut column = ColumnDef::new(name, data_type).with_hints(hints);
    if !default.is_null() {
        column = column.with_default(default);
    }
    SchemaOperation::AddColumn {
        table: table.into(),
        column,
    }
}

/// Add a fully specified column.
pub fn add_column_def(table: impl Into<String>, column: ColumnDef) -> SchemaOperation {
    SchemaOperation::AddColumn {
        table: table.into(),
        column,
    }
}

/// Drop a column.
pub fn drop_column(table: impl Into<String>, column: impl Into<String>) -> SchemaOperation {
    SchemaOperation::DropColumn {
        table: table.into(),
        column: column.into(),
    }
}

/// Rename a column.
pub fn rename_column(
    table: impl Into<String>,
    column: impl Into<String>,
    new_name: impl Into<String>,
) -> SchemaOperation {
    SchemaOperation::RenameColumn {
        table: table.into(),
        column: column.into(),
        new_name: new_name.into(),
    }
}

/// Change a column's type.
pub fn alter_column_type(
    table: impl Into<String>,
    column: impl Into<String>,
    data_type: DataType,
) -> SchemaOperation {
    SchemaOperation::AlterColumnType {
        table: table.into(),
        column: column.into(),
        data_type,
    }
}

/// Create a non-unique index with a generated name.
pub fn create_index(
    table: impl Into<String>,
    columns: impl IntoIterator<Item = impl Into<String>>,
) -> SchemaOperation {
    SchemaOperation::CreateIndex {
        table: table.into(),
        name: None,
        columns: strings(columns),
        unique: false,
    }
}

/// Create a unique index with a generated name.
pub fn create_unique_index(
    table: impl Into<String>,
    columns: impl IntoIterator<Item = impl Into<String>>,
) -> SchemaOperation {
    SchemaOperation::CreateIndex {
        table: table.into(),
        name: None,
        columns: strings(columns),
        unique: true,
    }
}

/// Create an index with an explicit name.
pub fn create_named_index(
    table: impl Into<String>,
    name: impl Into<String>,
    columns: impl IntoIterator<Item = impl Into<String>>,
    unique: bool,
) -> SchemaOperation {
    SchemaOperation::CreateIndex {
        table: table.into(),
        name: Some(name.into()),
        columns: strings(columns),
        unique,
    }
}

/// Create a full-text index.
pub fn create_fulltext_index(
    table: impl Into<String>,
    columns: impl IntoIterator<Item = impl Into<String>>,
) -> SchemaOperation {
    SchemaOperation::CreateFulltextIndex {
        table: table.into(),
        name: None,
        columns: strings(columns),
    }
}

/// Drop the index on exactly these columns.
pub fn drop_index(
    table: impl Into<String>,
    columns: impl IntoIterator<Item = impl Into<String>>,
) -> SchemaOperation {
    SchemaOperation::DropIndex {
        table: table.into(),
        columns: strings(columns),
    }
}

/// Start building a foreign key from `table(columns)` to
/// `referred_table(referred_columns)`.
pub fn add_foreign_key(
    table: impl Into<String>,
    columns: impl IntoIterator<Item = impl Into<String>>,
    referred_table: impl Into<String>,
    referred_columns: impl IntoIterator<Item = impl Into<String>>,
) -> ForeignKeyBuilder {
    ForeignKeyBuilder {
        table: table.into(),
        foreign_key: foreign_key(columns, referred_table, referred_columns),
    }
}

/// A foreign key reference for use in [`create_table_with_keys`].
pub fn foreign_key(
    columns: impl IntoIterator<Item = impl Into<String>>,
    referred_table: impl Into<String>,
    referred_columns: impl IntoIterator<Item = impl Into<String>>,
) -> ForeignKeyRef {
    ForeignKeyRef {
        name: None,
        columns: strings(columns),
        referred_table: referred_table.into(),
        referred_columns: strings(referred_columns),
        on_update: ReferentialAction::NoAction,
        on_delete: ReferentialAction::NoAction,
    }
}

/// Builder for an add-foreign-key operation.
#[derive(Debug, Clone)]
pub struct ForeignKeyBuilder {
    table: String,
    foreign_key: ForeignKeyRef,
}

impl ForeignKeyBuilder {
    /// Name the foreign key.
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.foreign_key.name = Some(name.into());
        self
    }

    /// Set the on-update action.
    pub fn on_update(mut self, action: ReferentialAction) -> Self {
        self.foreign_key.on_update = action;
        self
    }

    /// Set the on-delete action.
    pub fn on_delete(mut self, action: ReferentialAction) -> Self {
        self.foreign_key.on_delete = action;
        self
    }

    /// Finish the operation.
    pub fn build(self) -> SchemaOperation {
        SchemaOperation::AddForeignKey {
            table: self.table,
            foreign_key: self.foreign_key,
        }
    }
}

impl From<ForeignKeyBuilder> for SchemaOperation {
    fn from(builder: ForeignKeyBuilder) -> Self {
        builder.build()
    }
}

/// Drop a foreign key by name.
pub fn drop_foreign_key(table: impl Into<String>, name: impl Into<String>) -> SchemaOperation {
    SchemaOperation::DropForeignKey {
        table: table.into(),
        name: name.into(),
    }
}

/// Add a unique constraint.
pub fn add_unique_constraint(
    table: impl Into<String>,
    name: impl Into<String>,
    columns: impl IntoIterator<Item = impl Into<String>>,
) -> SchemaOperation {
    SchemaOperation::AddConstraint {
        table: table.into(),
        constraint: ConstraintDef::unique(name, columns),
    }
}

/// Add a check constraint.
pub fn add_check_constraint(
    table: impl Into<String>,
    name: impl Into<String>,
    expression: impl Into<String>,
) -> SchemaOperation {
    SchemaOperation::AddConstraint {
        table: table.into(),
        constraint: ConstraintDef::check(name, expression),
    }
}

/// Add a not-null constraint.
pub fn add_not_null_constraint(
    table: impl Into<String>,
    name: impl Into<String>,
    column: impl Into<String>,
) -> SchemaOperation {
    SchemaOperation::AddConstraint {
        table: table.into(),
        constraint: ConstraintDef::not_null(name, column),
    }
}

/// Drop a constraint by name.
pub fn drop_constraint(table: impl Into<String>, name: impl Into<String>) -> SchemaOperation {
    SchemaOperation::DropConstraint {
        table: table.into(),
        name: name.into(),
    }
}

/// Copy a table and its rows under a new logical name.
pub fn copy_table(source: impl Into<String>, target: impl Into<String>) -> SchemaOperation {
    SchemaOperation::CopyTable {
        source: source.into(),
        target: target.into(),
    }
}

/// Rename a logical table.
pub fn rename_table(table: impl Into<String>, new_name: impl Into<String>) -> SchemaOperation {
    SchemaOperation::RenameTable {
        table: table.into(),
        new_name: new_name.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_column_without_default() {
        let op = add_column("users", "nickname", DataType::Text, Value::Null, &[]);
        match op {
            SchemaOperation::AddColumn { column, .. } => {
                assert_eq!(column.default, None);
                assert!(column.is_nullable());
            }
            other => panic!("unexpected operation {:?}", other),
        }
    }

    #[test]
    fn test_foreign_key_builder() {
        let op: SchemaOperation = add_foreign_key("posts", ["author_id"], "users", ["id"])
            .named("fk_author")
            .on_delete(ReferentialAction::Cascade)
            .into();

        match op {
            SchemaOperation::AddForeignKey { table, foreign_key } => {
                assert_eq!(table, "posts");
                assert_eq!(foreign_key.name.as_deref(), Some("fk_author"));
                assert_eq!(foreign_key.on_delete, ReferentialAction::Cascade);
                assert_eq!(foreign_key.on_update, ReferentialAction::NoAction);
            }
            other => panic!("unexpected operation {:?}", other),
        }
    }

    #[test]
    fn test_index_builders() {
        assert_eq!(
            create_unique_index("users", ["email"]),
            SchemaOperation::CreateIndex {
                table: "users".into(),
                name: None,
                columns: vec!["email".into()],
                unique: true,
            }
        );
        assert_eq!(
            create_named_index("users", "by_name", ["name"], false),
            SchemaOperation::CreateIndex {
                table: "users".into(),
                name: Some("by_name".into()),
                columns: vec!["name".into()],
                unique: false,
            }
        );
    }
}

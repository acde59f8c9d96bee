//! Schema operations: immutable values describing one requested change.
//!
//! Operations are built with the free functions in [`builder`] and grouped
//! into change-sets on the changelog. They name tables by logical name.

pub mod builder;

use crate::catalog::{ColumnDef, ConstraintDef, DataType, ReferentialAction};
use rkyv::{Archive, Deserialize, Serialize};
use std::fmt;

/// A foreign key as requested by an operation, referring to a logical table.
#[derive(
    Debug, Clone, PartialEq, Eq, Archive, Serialize, Deserialize, serde::Serialize, serde::Deserialize,
)]
pub struct ForeignKeyRef {
    /// Foreign key name; generated when absent.
    #[serde(default)]
    pub name: Option<String>,
    /// Columns of the referencing table.
    pub columns: Vec<String>,
    /// Logical name of the referred table.
    pub referred_table: String,
    /// Columns of the referred table.
    pub referred_columns: Vec<String>,
    /// Action on update of the referred row.
    #[serde(default)]
    pub on_update: ReferentialAction,
    /// Action on delete of the referred row.
    #[serde(default)]
    pub on_delete: ReferentialAction,
}

/// One requested schema change.
#[derive(
    Debug, Clone, PartialEq, Archive, Serialize, Deserialize, serde::Serialize, serde::Deserialize,
)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum SchemaOperation {
    /// Create a new logical table.
    CreateTable {
        /// Logical table name.
        table: String,
        /// Columns; at least one must be a primary key column.
        columns: Vec<ColumnDef>,
        /// Outgoing foreign keys.
        #[serde(default)]
        foreign_keys: Vec<ForeignKeyRef>,
    },
    /// Add a column.
    AddColumn {
        /// Logical table name.
        table: String,
        /// The new column.
        column: ColumnDef,
    },
    /// Drop a column.
    DropColumn {
        /// Logical table name.
        table: String,
        /// Column name.
        column: String,
    },
    /// Rename a column.
    RenameColumn {
        /// Logical table name.
        table: String,
        /// Current column name.
        column: String,
        /// New column name.
        new_name: String,
    },
    /// Change a column's type.
    AlterColumnType {
        /// Logical table name.
        table: String,
        /// Column name.
        column: String,
        /// New type.
        data_type: DataType,
    },
    /// Create a btree index.
    CreateIndex {
        /// Logical table name.
        table: String,
        /// Index name; generated when absent.
        #[serde(default)]
        name: Option<String>,
        /// Indexed columns.
        columns: Vec<String>,
        /// Whether values must be unique.
        #[serde(default)]
        unique: bool,
    },
    /// Create a full-text index over text columns.
    CreateFulltextIndex {
        /// Logical table name.
        table: String,
        /// Index name; generated when absent.
        #[serde(default)]
        name: Option<String>,
        /// Indexed columns.
        columns: Vec<String>,
    },
    /// Drop the index on exactly these columns.
    DropIndex {
        /// Logical table name.
        table: String,
        /// Indexed columns.
        columns: Vec<String>,
    },
    /// Add a foreign key.
    AddForeignKey {
        /// Logical name of the referencing table.
        table: String,
        /// The foreign key.
        foreign_key: ForeignKeyRef,
    },
    /// Drop a foreign key by name.
    DropForeignKey {
        /// Logical table name.
        table: String,
        /// Foreign key name.
        name: String,
    },
    /// Add a named constraint.
    AddConstraint {
        /// Logical table name.
        table: String,
        /// The constraint.
        constraint: ConstraintDef,
    },
    /// Drop a named constraint.
    DropConstraint {
        /// Logical table name.
        table: String,
        /// Constraint name.
        name: String,
    },
    /// Copy a table, with its rows, under a new logical name.
    CopyTable {
        /// Logical name of the source table.
        source: String,
        /// Logical name of the copy.
        target: String,
    },
    /// Rename a logical table.
    RenameTable {
        /// Current logical name.
        table: String,
        /// New logical name.
        new_name: String,
    },
}

impl SchemaOperation {
    /// Short name of the operation kind.
    pub fn kind(&self) -> &'static str {
        match self {
            SchemaOperation::CreateTable { .. } => "create_table",
            SchemaOperation::AddColumn { .. } => "add_column",
            SchemaOperation::DropColumn { .. } => "drop_column",
            SchemaOperation::RenameColumn { .. } => "rename_column",
            SchemaOperation::AlterColumnType { .. } => "alter_column_type",
            SchemaOperation::CreateIndex { .. } => "create_index",
            SchemaOperation::CreateFulltextIndex { .. } => "create_fulltext_index",
            SchemaOperation::DropIndex { .. } => "drop_index",
            SchemaOperation::AddForeignKey { .. } => "add_foreign_key",
            SchemaOperation::DropForeignKey { .. } => "drop_foreign_key",
            SchemaOperation::AddConstraint { .. } => "add_constraint",
            SchemaOperation::DropConstraint { .. } => "drop_constraint",
            SchemaOperation::CopyTable { .. } => "copy_table",
            SchemaOperation::RenameTable { .. } => "rename_table",
        }
    }

    /// Logical table names the operation reads or changes.
    pub fn tables(&self) -> Vec<&str> {
        match self {
            SchemaOperation::CreateTable {
                table,
                foreign_keys,
                ..
            } => {
                let mut tables = vec![table.as_str()];
                tables.extend(foreign_keys.iter().map(|fk| fk.referred_table.as_str()));
                tables
            }
            SchemaOperation::AddForeignKey { table, foreign_key } => {
                vec![table.as_str(), foreign_key.referred_table.as_str()]
            }
            SchemaOperation::CopyTable { source, target } => vec![source.as_str(), target.as_str()],
            SchemaOperation::RenameTable { table, new_name } => {
                vec![table.as_str(), new_name.as_str()]
            }
            SchemaOperation::AddColumn { table, .. }
            | SchemaOperation::DropColumn { table, .. }
            | SchemaOperation::RenameColumn { table, .. }
            | SchemaOperation::AlterColumnType { table, .. }
            | SchemaOperation::CreateIndex { table, .. }
            | SchemaOperation::CreateFulltextIndex { table, .. }
            | SchemaOperation::DropIndex { table, .. }
            | SchemaOperation::DropForeignKey { table, .. }
            | SchemaOperation::AddConstraint { table, .. }
            | SchemaOperation::DropConstraint { table, .. } => vec![table.as_str()],
        }
    }
}

impl fmt::Display for SchemaOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchemaOperation::CreateTable { table, columns, .. } => {
                let names: Vec<&str> = columns.iter().map(|c| c.name.as_str()).collect();
                write!(f, "create_table {}({})", table, names.join(", "))
            }
            SchemaOperation::AddColumn { table, column } => {
                write!(f, "add_column {}.{} {}", table, column.name, column.data_type)
            }
            SchemaOperation::DropColumn { table, column } => {
                write!(f, "drop_column {}.{}", table, column)
            }
            SchemaOperation::RenameColumn {
                table,
                column,
                new_name,
            } => write!(f, "rename_column {}.{} to {}", table, column, new_name),
            SchemaOperation::AlterColumnType {
                table,
                column,
                data_type,
            } => write!(f, "alter_column_type {}.{} to {}", table, column, data_type),
            SchemaOperation::CreateIndex { table, columns, .. } => {
                write!(f, "create_index {}({})", table, columns.join(", "))
            }
            SchemaOperation::CreateFulltextIndex { table, columns, .. } => {
                write!(f, "create_fulltext_index {}({})", table, columns.join(", "))
            }
            SchemaOperation::DropIndex { table, columns } => {
                write!(f, "drop_index {}({})", table, columns.join(", "))
            }
            SchemaOperation::AddForeignKey { table, foreign_key } => write!(
                f,
                "add_foreign_key {}({}) -> {}({})",
                table,
                foreign_key.columns.join(", "),
                foreign_key.referred_table,
                foreign_key.referred_columns.join(", ")
            ),
            SchemaOperation::DropForeignKey { table, name } => {
                write!(f, "drop_foreign_key {}.{}", table, name)
            }
            SchemaOperation::AddConstraint { table, constraint } => {
                write!(f, "add_constraint {}.{}", table, constraint.name)
            }
            SchemaOperation::DropConstraint { table, name } => {
                write!(f, "drop_constraint {}.{}", table, name)
            }
            SchemaOperation::CopyTable { source, target } => {
                write!(f, "copy_table {} to {}", source, target)
            }
            SchemaOperation::RenameTable { table, new_name } => {
                write!(f, "rename_table {} to {}", table, new_name)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::ColumnHint;
    use crate::value::Value;

    #[test]
    fn test_kind_and_tables() {
        let op = builder::add_foreign_key("posts", ["author_id"], "users", ["id"]).build();
        assert_eq!(op.kind(), "add_foreign_key");
        assert_eq!(op.tables(), vec!["posts", "users"]);

        let op = builder::rename_table("users", "accounts");
        assert_eq!(op.tables(), vec!["users", "accounts"]);
    }

    #[test]
    fn test_display() {
        let op = builder::drop_column("users", "email");
        assert_eq!(op.to_string(), "drop_column users.email");

        let op = builder::add_column(
            "users",
            "activated_account",
            DataType::Bool,
            Value::Bool(false),
            &[ColumnHint::NotNull],
        );
        assert_eq!(op.to_string(), "add_column users.activated_account bool");
    }

    #[test]
    fn test_json_format() {
        let json = r#"[
            {"op": "add_column", "table": "users",
             "column": {"name": "age", "data_type": "integer", "hints": ["NOT_NULL"], "default": {"int": 0}}},
            {"op": "drop_index", "table": "users", "columns": ["email"]},
            {"op": "alter_column_type", "table": "users", "column": "name", "data_type": {"varchar": 64}}
        ]"#;
        let ops: Vec<SchemaOperation> = serde_json::from_str(json).unwrap();

        assert_eq!(ops.len(), 3);
        assert_eq!(
            ops[0],
            builder::add_column("users", "age", DataType::Integer, Value::Int(0), &[ColumnHint::NotNull])
        );
        assert_eq!(ops[1], builder::drop_index("users", ["email"]));
        assert_eq!(
            ops[2],
            builder::alter_column_type("users", "name", DataType::Varchar(64))
        );

        let back = serde_json::to_string(&ops).unwrap();
        let again: Vec<SchemaOperation> = serde_json::from_str(&back).unwrap();
        assert_eq!(again, ops);
    }
}

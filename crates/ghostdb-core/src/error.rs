//! Core error types.

use thiserror::Error;

/// Core database errors.
#[derive(Debug, Error)]
pub enum Error {
    /// Storage layer error.
    #[error("storage error: {0}")]
    Storage(#[from] sled::Error),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Deserialization error.
    #[error("deserialization error: {0}")]
    Deserialization(String),

    /// A physical table is not present in the catalog.
    #[error("table not found: {0}")]
    TableNotFound(String),

    /// A physical table identifier is already taken.
    #[error("table already exists: {0}")]
    TableExists(String),

    /// A column is not present in a table.
    #[error("column {column} not found in table {table}")]
    ColumnNotFound {
        /// Table identifier.
        table: String,
        /// Column name.
        column: String,
    },

    /// A column name is already taken in a table.
    #[error("column {column} already exists in table {table}")]
    ColumnExists {
        /// Table identifier.
        table: String,
        /// Column name.
        column: String,
    },

    /// No index matches the requested column tuple or name.
    #[error("index {index} not found in table {table}")]
    IndexNotFound {
        /// Table identifier.
        table: String,
        /// Index name or column tuple.
        index: String,
    },

    /// An index with the same name or column tuple already exists.
    #[error("index {index} already exists in table {table}")]
    IndexExists {
        /// Table identifier.
        table: String,
        /// Index name or column tuple.
        index: String,
    },

    /// A named foreign key is not present.
    #[error("foreign key {name} not found in table {table}")]
    ForeignKeyNotFound {
        /// Table identifier.
        table: String,
        /// Foreign key name.
        name: String,
    },

    /// A named constraint is not present.
    #[error("constraint {name} not found in table {table}")]
    ConstraintNotFound {
        /// Table identifier.
        table: String,
        /// Constraint name.
        name: String,
    },

    /// A named constraint or foreign key already exists.
    #[error("constraint {name} already exists in table {table}")]
    ConstraintExists {
        /// Table identifier.
        table: String,
        /// Constraint name.
        name: String,
    },

    /// A foreign key refers to a table or column missing from the catalog.
    #[error("foreign key {foreign_key} of table {table} refers to missing {referred}")]
    DanglingForeignKey {
        /// Referencing table identifier.
        table: String,
        /// Foreign key name.
        foreign_key: String,
        /// The missing table or column.
        referred: String,
    },

    /// A version is not known to the changelog or the ref log.
    #[error("version not found: {0}")]
    VersionNotFound(String),

    /// A logical table name does not resolve at a version.
    #[error("table {table} does not exist at version {version}")]
    TableRefNotFound {
        /// Version identifier.
        version: String,
        /// Logical table name.
        table: String,
    },

    /// A logical name is already registered at a version.
    #[error("table {table} is already registered at version {version}")]
    TableRefExists {
        /// Version identifier.
        version: String,
        /// Logical table name.
        table: String,
    },

    /// A version already has children and its mapping can no longer change.
    #[error("version {0} is frozen: a child version has already forked from it")]
    VersionFrozen(String),

    /// A version's mapping scope has not been forked yet.
    #[error("version {0} has not been forked in the ref log")]
    VersionNotForked(String),

    /// A row violates a NOT NULL column.
    #[error("null value in column {column} of table {table} violates not-null constraint")]
    NotNullViolation {
        /// Table identifier.
        table: String,
        /// Column name.
        column: String,
    },

    /// A row violates a unique index or constraint.
    #[error("duplicate key in table {table} violates unique index {index}")]
    UniqueViolation {
        /// Table identifier.
        table: String,
        /// Index or constraint name.
        index: String,
    },

    /// A column added as NOT NULL has no default to fill existing rows.
    #[error("column {column} of table {table} is NOT NULL but has no default value")]
    NotNullWithoutDefault {
        /// Table name.
        table: String,
        /// Column name.
        column: String,
    },

    /// Primary key columns cannot be dropped or added.
    #[error("column {column} is part of the primary key of table {table}")]
    PrimaryKeyColumn {
        /// Table name.
        table: String,
        /// Column name.
        column: String,
    },

    /// A column is referred to by another table's foreign key.
    #[error("column {column} of table {table} is referred to by foreign key {by}")]
    ColumnReferenced {
        /// Table name.
        table: String,
        /// Column name.
        column: String,
        /// The referring foreign key, as `table.name`.
        by: String,
    },

    /// A column takes part in a foreign key and cannot change type.
    #[error("column {column} of table {table} takes part in foreign key {foreign_key}")]
    ColumnInForeignKey {
        /// Table name.
        table: String,
        /// Column name.
        column: String,
        /// Foreign key name.
        foreign_key: String,
    },

    /// A column type change has no conversion.
    #[error("cannot change column {column} of table {table} from {from} to {to}")]
    IncompatibleType {
        /// Table name.
        table: String,
        /// Column name.
        column: String,
        /// Current type.
        from: String,
        /// Requested type.
        to: String,
    },

    /// An index definition is invalid.
    #[error("invalid index {index} on table {table}: {reason}")]
    InvalidIndex {
        /// Table name.
        table: String,
        /// Index name.
        index: String,
        /// What is wrong.
        reason: String,
    },

    /// A foreign key definition is invalid.
    #[error("invalid foreign key {foreign_key} on table {table}: {reason}")]
    InvalidForeignKey {
        /// Table name.
        table: String,
        /// Foreign key name.
        foreign_key: String,
        /// What is wrong.
        reason: String,
    },

    /// `from` is not an ancestor of `to` in the changelog.
    #[error("version {from} is not an ancestor of version {to}")]
    NotAncestor {
        /// Source version.
        from: String,
        /// Target version.
        to: String,
    },

    /// A data mapping already exists for a destination table.
    #[error("data mapping for table {0} already exists")]
    MappingExists(String),

    /// No data mapping exists for a destination table.
    #[error("no data mapping for table {0}")]
    MappingNotFound(String),

    /// A destination column has no valid derivation.
    #[error("column {column} of table {table} cannot be derived: {reason}")]
    UnmappedColumn {
        /// Destination table identifier.
        table: String,
        /// Destination column name.
        column: String,
        /// Why the derivation is invalid.
        reason: String,
    },

    /// An update or reconciliation targeted a row that does not exist.
    #[error("row not found in table {0}")]
    RowNotFound(String),

    /// A value does not conform to the column type.
    #[error("value for column {column} of table {table} is not a valid {expected}: {reason}")]
    TypeMismatch {
        /// Table identifier.
        table: String,
        /// Column name.
        column: String,
        /// Expected column type.
        expected: String,
        /// Why the value was rejected.
        reason: String,
    },

    /// A value cannot be converted to another type.
    #[error("cannot convert {value} to {target}")]
    Conversion {
        /// Rendered source value.
        value: String,
        /// Target type.
        target: String,
    },

    /// A table has no primary key.
    #[error("table {0} has no primary key")]
    MissingPrimaryKey(String),

    /// A row is missing one of its primary key values.
    #[error("row for table {table} is missing primary key column {column}")]
    MissingKey {
        /// Table identifier.
        table: String,
        /// Column name.
        column: String,
    },

    /// JSON encoding error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Invalid data format.
    #[error("invalid data: {0}")]
    InvalidData(String),
}

/// Convenience result alias for core operations.
pub type Result<T, E = Error> = std::result::Result<T, E>;

//! Column definitions.

use super::types::DataType;
use crate::value::Value;
use rkyv::{Archive, Deserialize, Serialize};

/// Hints attached to a column.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Archive,
    Serialize,
    Deserialize,
    serde::Serialize,
    serde::Deserialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ColumnHint {
    /// The column rejects NULL.
    NotNull,
    /// The column is part of the primary key.
    PrimaryKey,
    /// Values are assigned from a sequence when absent.
    AutoIncrement,
    /// The column is an identity column.
    Identity,
}

/// A column definition within a table.
#[derive(
    Debug, Clone, PartialEq, Archive, Serialize, Deserialize, serde::Serialize, serde::Deserialize,
)]
pub struct ColumnDef {
    /// Column name.
    pub name: String,
    /// Column data type.
    pub data_type: DataType,
    /// Column hints.
    #[serde(default)]
    pub hints: Vec<ColumnHint>,
    /// Default value used when a row omits the column.
    #[serde(default)]
    pub default: Option<Value>,
}

impl ColumnDef {
    /// Create a nullable column without a default.
    pub fn new(name: impl Into<String>, data_type: DataType) -> Self {
        Self {
            name: name.into(),
            data_type,
            hints: Vec::new(),
            default: None,
        }
    }

    /// Create a primary key column.
    pub fn primary_key(name: impl Into<String>, data_type: DataType) -> Self {
        Self::new(name, data_type).with_hint(ColumnHint::PrimaryKey)
    }

    /// Add a hint.
    pub fn with_hint(mut self, hint: ColumnHint) -> Self {
        self.set_hint(hint);
        self
    }

    /// Add several hints.
    pub fn with_hints(mut self, hints: &[ColumnHint]) -> Self {
        for hint in hints {
            self.set_hint(*hint);
        }
        self
    }

    /// Set the default value.
    pub fn with_default(mut self, default: Value) -> Self {
        self.default = Some(default);
        self
    }

    /// Check whether a hint is set.
    pub fn has_hint(&self, hint: ColumnHint) -> bool {
        self.hints.contains(&hint)
    }

    /// Set a hint if not already present.
    pub fn set_hint(&mut self, hint: ColumnHint) {
        if !self.has_hint(hint) {
            self.hints.push(hint);
        }
    }

    /// Remove a hint.
    pub fn remove_hint(&mut self, hint: ColumnHint) {
        self.hints.retain(|h| *h != hint);
    }

    /// Check if this column is part of the primary key.
    pub fn is_primary_key(&self) -> bool {
        self.has_hint(ColumnHint::PrimaryKey)
    }

    /// Check if this column accepts NULL.
    pub fn is_nullable(&self) -> bool {
        !self.has_hint(ColumnHint::NotNull) && !self.is_primary_key()
    }
}

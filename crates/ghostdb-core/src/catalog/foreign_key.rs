//! Foreign key definitions.

use rkyv::{Archive, Deserialize, Serialize};
use std::fmt;

/// Action taken on referencing rows when a referred row changes.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Default,
    Archive,
    Serialize,
    Deserialize,
    serde::Serialize,
    serde::Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum ReferentialAction {
    /// Reject the change at the end of the statement.
    #[default]
    NoAction,
    /// Reject the change immediately.
    Restrict,
    /// Propagate the change.
    Cascade,
    /// Set referencing columns to NULL.
    SetNull,
    /// Set referencing columns to their defaults.
    SetDefault,
}

impl fmt::Display for ReferentialAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReferentialAction::NoAction => write!(f, "NO ACTION"),
            ReferentialAction::Restrict => write!(f, "RESTRICT"),
            ReferentialAction::Cascade => write!(f, "CASCADE"),
            ReferentialAction::SetNull => write!(f, "SET NULL"),
            ReferentialAction::SetDefault => write!(f, "SET DEFAULT"),
        }
    }
}

/// An outgoing foreign key of a table.
///
/// `referred_table` is a physical table identifier, so a foreign key always
/// points at one specific generation of the referred table.
#[derive(
    Debug, Clone, PartialEq, Eq, Archive, Serialize, Deserialize, serde::Serialize, serde::Deserialize,
)]
pub struct ForeignKeyDef {
    /// Foreign key name, unique within the referencing table.
    pub name: String,
    /// Columns of the referencing table.
    pub referencing_columns: Vec<String>,
    /// Physical identifier of the referred table.
    pub referred_table: String,
    /// Columns of the referred table.
    pub referred_columns: Vec<String>,
    /// Action on update of the referred row.
    pub on_update: ReferentialAction,
    /// Action on delete of the referred row.
    pub on_delete: ReferentialAction,
}

impl ForeignKeyDef {
    /// Create a foreign key with default actions.
    pub fn new(
        name: impl Into<String>,
        referencing_columns: impl IntoIterator<Item = impl Into<String>>,
        referred_table: impl Into<String>,
        referred_columns: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        Self {
            name: name.into(),
            referencing_columns: referencing_columns.into_iter().map(Into::into).collect(),
            referred_table: referred_table.into(),
            referred_columns: referred_columns.into_iter().map(Into::into).collect(),
            on_update: ReferentialAction::NoAction,
            on_delete: ReferentialAction::NoAction,
        }
    }

    /// Set the on-update action.
    pub fn on_update(mut self, action: ReferentialAction) -> Self {
        self.on_update = action;
        self
    }

    /// Set the on-delete action.
    pub fn on_delete(mut self, action: ReferentialAction) -> Self {
        self.on_delete = action;
        self
    }

    /// Check if a referencing column takes part in this key.
    pub fn uses_column(&self, column: &str) -> bool {
        self.referencing_columns.iter().any(|c| c == column)
    }

    /// Check if a column of the referred table takes part in this key.
    pub fn refers_to_column(&self, column: &str) -> bool {
        self.referred_columns.iter().any(|c| c == column)
    }
}

/// Default name for a foreign key created without one.
pub fn default_foreign_key_name(table: &str, columns: &[String]) -> String {
    format!("fk_{}_{}", table, columns.join("_"))
}

//! Named table constraints.

use rkyv::{Archive, Deserialize, Serialize};

/// What a constraint enforces.
#[derive(
    Debug, Clone, PartialEq, Eq, Archive, Serialize, Deserialize, serde::Serialize, serde::Deserialize,
)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ConstraintKind {
    /// Values of the columns must be unique together.
    Unique {
        /// Constrained columns.
        columns: Vec<String>,
    },
    /// A boolean expression every row must satisfy.
    ///
    /// The expression is kept as metadata and is not evaluated.
    Check {
        /// Boolean expression.
        expression: String,
    },
    /// The column rejects NULL.
    NotNull {
        /// Constrained column.
        column: String,
    },
}

/// A named table constraint.
#[derive(
    Debug, Clone, PartialEq, Eq, Archive, Serialize, Deserialize, serde::Serialize, serde::Deserialize,
)]
pub struct ConstraintDef {
    /// Constraint name, unique within the table.
    pub name: String,
    /// What the constraint enforces.
    #[serde(flatten)]
    pub kind: ConstraintKind,
}

impl ConstraintDef {
    /// Create a unique constraint.
    pub fn unique(
        name: impl Into<String>,
        columns: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        Self {
            name: name.into(),
            kind: ConstraintKind::Unique {
                columns: columns.into_iter().map(Into::into).collect(),
            },
        }
    }

    /// Create a check constraint.
    pub fn check(name: impl Into<String>, expression: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: ConstraintKind::Check {
                expression: expression.into(),
            },
        }
    }

    /// Create a not-null constraint.
    pub fn not_null(name: impl Into<String>, column: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: ConstraintKind::NotNull {
                column: column.into(),
            },
        }
    }

    /// Columns the constraint names explicitly.
    pub fn columns(&self) -> Vec<&str> {
        match &self.kind {
            ConstraintKind::Unique { columns } => columns.iter().map(String::as_str).collect(),
            ConstraintKind::NotNull { column } => vec![column.as_str()],
            ConstraintKind::Check { .. } => Vec::new(),
        }
    }

    /// Check if the constraint names a column.
    pub fn covers(&self, column: &str) -> bool {
        self.columns().contains(&column)
    }

    /// Rename a column wherever the constraint names it.
    pub fn rename_column(&mut self, old: &str, new: &str) {
        match &mut self.kind {
            ConstraintKind::Unique { columns } => {
                for c in columns.iter_mut().filter(|c| *c == old) {
                    *c = new.to_string();
                }
            }
            ConstraintKind::NotNull { column } => {
                if column == old {
                    *column = new.to_string();
                }
            }
            ConstraintKind::Check { .. } => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constraint_columns() {
        let unique = ConstraintDef::unique("uq_email", ["email", "tenant"]);
        assert_eq!(unique.columns(), vec!["email", "tenant"]);
        assert!(unique.covers("tenant"));

        let check = ConstraintDef::check("ck_age", "age >= 0");
        assert!(check.columns().is_empty());
        assert!(!check.covers("age"));
    }

    #[test]
    fn test_rename_column() {
        let mut nn = ConstraintDef::not_null("nn_email", "email");
        nn.rename_column("email", "mail");
        assert_eq!(nn.kind, ConstraintKind::NotNull { column: "mail".into() });

        let mut unique = ConstraintDef::unique("uq", ["a", "b"]);
        unique.rename_column("b", "c");
        assert_eq!(unique.columns(), vec!["a", "c"]);
    }

    #[test]
    fn test_json_shape() {
        let json = serde_json::to_value(ConstraintDef::not_null("nn", "email")).unwrap();
        assert_eq!(json["kind"], "not_null");
        assert_eq!(json["column"], "email");
        assert_eq!(json["name"], "nn");
    }
}

//! Index definitions.

use rkyv::{Archive, Deserialize, Serialize};

/// Kind of index.
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
pub enum IndexKind {
    /// Ordered index.
    #[default]
    BTree,
    /// Full-text search index over text columns.
    Fulltext,
}

/// An index on a table.
///
/// Within a table an index is identified by its column tuple.
#[derive(
    Debug, Clone, PartialEq, Eq, Archive, Serialize, Deserialize, serde::Serialize, serde::Deserialize,
)]
pub struct IndexDef {
    /// Index name.
    pub name: String,
    /// Indexed columns, in order.
    pub columns: Vec<String>,
    /// Whether values must be unique.
    #[serde(default)]
    pub unique: bool,
    /// Index kind.
    #[serde(default)]
    pub kind: IndexKind,
}

impl IndexDef {
    /// Create a non-unique btree index.
    pub fn new(name: impl Into<String>, columns: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            name: name.into(),
            columns: columns.into_iter().map(Into::into).collect(),
            unique: false,
            kind: IndexKind::BTree,
        }
    }

    /// Mark the index as unique.
    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    /// Make this a full-text index.
    pub fn fulltext(mut self) -> Self {
        self.kind = IndexKind::Fulltext;
        self
    }

    /// Check if the index includes a column.
    pub fn covers(&self, column: &str) -> bool {
        self.columns.iter().any(|c| c == column)
    }

    /// Check if the index is on exactly these columns.
    pub fn is_on(&self, columns: &[String]) -> bool {
        self.columns == columns
    }
}

/// Default name for an index created without one.
pub fn default_index_name(table: &str, columns: &[String], kind: IndexKind) -> String {
    let prefix = match kind {
        IndexKind::BTree => "idx",
        IndexKind::Fulltext => "ftx",
    };
    format!("{}_{}_{}", prefix, table, columns.join("_"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_index_builders() {
        let idx = IndexDef::new("idx_users_email", ["email"]).unique();
        assert!(idx.unique);
        assert_eq!(idx.kind, IndexKind::BTree);
        assert!(idx.covers("email"));
        assert!(!idx.covers("name"));
        assert!(idx.is_on(&["email".to_string()]));
    }

    #[test]
    fn test_default_index_name() {
        let cols = vec!["first".to_string(), "last".to_string()];
        assert_eq!(
            default_index_name("users", &cols, IndexKind::BTree),
            "idx_users_first_last"
        );
        assert_eq!(
            default_index_name("posts", &["body".to_string()], IndexKind::Fulltext),
            "ftx_posts_body"
        );
    }
}

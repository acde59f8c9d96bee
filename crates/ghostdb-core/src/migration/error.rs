//! Migration-specific error types.

use crate::error::Error;
use thiserror::Error;

/// Migration-specific errors.
///
/// Planning errors are raised before anything physical changes. Every other
/// kind aborts the migration and leaves the committed state at the source
/// version.
#[derive(Debug, Error)]
pub enum MigrationError {
    /// An operation is invalid against the catalog at its version.
    #[error("cannot apply {operation} at version {version}: {source}")]
    Planning {
        /// Version whose change-set holds the operation.
        version: String,
        /// The rejected operation.
        operation: String,
        /// Why it was rejected.
        source: Error,
    },

    /// The foreign-key graph or ref log is inconsistent.
    #[error("mirroring {table} at version {version} failed: {reason}")]
    Mirroring {
        /// Version being planned.
        version: String,
        /// Logical or physical table involved.
        table: String,
        /// What is inconsistent.
        reason: String,
    },

    /// The backend failed during a phase.
    #[error("backend failed while {phase}: {source}")]
    Backend {
        /// Migration phase.
        phase: String,
        /// Underlying error.
        source: Error,
    },

    /// The backend failed on a specific table.
    #[error("backend failed while {phase} table {table}: {source}")]
    Table {
        /// Migration phase.
        phase: String,
        /// Physical table identifier.
        table: String,
        /// Underlying error.
        source: Error,
    },

    /// A ghost table still differs from its source after catch-up.
    #[error("table {table} diverged from {source_table}: {mismatched} rows differ")]
    Divergence {
        /// Ghost table.
        table: String,
        /// Source table.
        source_table: String,
        /// Number of differing rows.
        mismatched: u64,
    },

    /// The migration was cancelled.
    #[error("migration cancelled while {phase}")]
    Cancelled {
        /// Phase during which the cancellation was observed.
        phase: String,
    },

    /// There is nothing to migrate between the two versions.
    #[error("no changes between versions {from} and {to}")]
    NoChanges {
        /// Source version.
        from: String,
        /// Target version.
        to: String,
    },

    /// A migration is already in progress.
    #[error("migration already in progress: {migration_id:02x?}")]
    MigrationInProgress {
        /// The ID of the migration in progress.
        migration_id: [u8; 16],
    },

    /// Migration not found.
    #[error("migration not found: {migration_id:02x?}")]
    MigrationNotFound {
        /// The ID of the migration that was not found.
        migration_id: [u8; 16],
    },

    /// A version cannot be dropped while it is being served.
    #[error("version {0} is in use")]
    VersionInUse(String),

    /// Migration state is corrupted.
    #[error("migration state corrupted: {message}")]
    StateCorrupted {
        /// Description of the corruption.
        message: String,
    },

    /// Storage error.
    #[error("storage error: {0}")]
    Storage(#[from] Error),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Deserialization error.
    #[error("deserialization error: {0}")]
    Deserialization(String),
}

impl MigrationError {
    /// Check if the migration was rejected before anything physical changed.
    pub fn is_planning(&self) -> bool {
        matches!(
            self,
            MigrationError::Planning { .. }
                | MigrationError::Mirroring { .. }
                | MigrationError::NoChanges { .. }
        )
    }

    /// Check if the migration was cancelled.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, MigrationError::Cancelled { .. })
    }

    /// Wrap a backend error for a phase.
    pub fn backend(phase: impl Into<String>, source: impl Into<Error>) -> Self {
        MigrationError::Backend {
            phase: phase.into(),
            source: source.into(),
        }
    }

    /// Wrap a backend error for a table within a phase.
    pub fn table(phase: impl Into<String>, table: impl Into<String>, source: impl Into<Error>) -> Self {
        MigrationError::Table {
            phase: phase.into(),
            table: table.into(),
            source: source.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_planning_error_display() {
        let err = MigrationError::Planning {
            version: "v_1".into(),
            operation: "drop_column users.email".into(),
            source: Error::ColumnNotFound {
                table: "users".into(),
                column: "email".into(),
            },
        };
        let text = err.to_string();
        assert!(text.contains("drop_column users.email"));
        assert!(text.contains("v_1"));
        assert!(err.is_planning());
        assert!(!err.is_cancelled());
    }

    #[test]
    fn test_divergence_display() {
        let err = MigrationError::Divergence {
            table: "table_b".into(),
            source_table: "table_a".into(),
            mismatched: 3,
        };
        assert!(err.to_string().contains("3 rows differ"));
        assert!(!err.is_planning());
    }

    #[test]
    fn test_backend_helpers() {
        let err = MigrationError::table("backfilling", "table_a", Error::RowNotFound("table_a".into()));
        assert!(err.to_string().contains("backfilling table table_a"));

        let err = MigrationError::backend("cutting over", sled::Error::ReportableBug("x".into()));
        assert!(matches!(err, MigrationError::Backend { .. }));
    }
}

//! The capabilities the migrator needs from a database.
//!
//! A [`Backend`] persists the versioned [`State`], serves versioned
//! [`Connection`]s, creates and drops physical tables through its
//! [`TableCreator`], and moves rows between table generations through its
//! [`DatabaseMigrator`]. [`embedded::SledBackend`] implements all of them on
//! an embedded sled database.

pub mod embedded;
mod row;

pub use row::Row;

use crate::catalog::TableDef;
use crate::error::Error;
use crate::migration::{MigrationStateStore, SyncRule};
use crate::value::Value;
use crate::versioning::{State, VersionId};
use rkyv::{Archive, Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;

/// Kind of a captured row change.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Archive,
    Serialize,
    Deserialize,
    serde::Serialize,
    serde::Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    /// A row was inserted.
    Insert,
    /// A row was updated in place.
    Update,
    /// A row was deleted.
    Delete,
}

/// One entry of the change-data-capture log.
#[derive(
    Debug, Clone, PartialEq, Eq, Archive, Serialize, Deserialize, serde::Serialize, serde::Deserialize,
)]
pub struct ChangeRecord {
    /// Log sequence number.
    pub lsn: u64,
    /// Physical table identifier.
    pub table: String,
    /// Encoded primary key of the row.
    pub key: Vec<u8>,
    /// What happened to the row.
    pub kind: ChangeKind,
}

/// Outcome of comparing a table with the table it is synchronized from.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct ComparisonReport {
    /// Rows seen in the source.
    pub source_rows: u64,
    /// Rows seen in the target.
    pub target_rows: u64,
    /// Source rows with no target row.
    pub missing: u64,
    /// Target rows with no source row.
    pub extra: u64,
    /// Rows present in both whose values differ.
    pub mismatched: u64,
    /// Differences fixed during the comparison.
    pub repaired: u64,
}

impl ComparisonReport {
    /// Total number of differences found.
    pub fn differences(&self) -> u64 {
        self.missing + self.extra + self.mismatched
    }

    /// Check if no differences were found.
    pub fn is_consistent(&self) -> bool {
        self.differences() == 0
    }
}

/// A database holding versioned tables.
pub trait Backend: Send + Sync {
    /// Versioned session type.
    type Connection: Connection;
    /// Physical table management.
    type TableCreator: TableCreator;
    /// Row movement between table generations.
    type Migrator: DatabaseMigrator;

    /// Read the persisted state.
    fn load_state(&self) -> Result<State, Error>;

    /// Persist a new state atomically and make it the committed snapshot.
    fn persist_state(&self, state: &State) -> Result<(), Error>;

    /// The committed state.
    fn snapshot(&self) -> Arc<State>;

    /// Open a session resolving logical names at `version`.
    fn connect(&self, version: &VersionId) -> Result<Self::Connection, Error>;

    /// Physical table management.
    fn table_creator(&self) -> &Self::TableCreator;

    /// Row movement between table generations.
    fn migrator(&self) -> &Self::Migrator;

    /// Where migration progress is persisted, if anywhere.
    fn state_store(&self) -> Option<&MigrationStateStore>;
}

/// Creates and drops physical tables.
pub trait TableCreator: Send + Sync {
    /// Create an empty physical table.
    fn create_table(&self, table: &TableDef) -> Result<(), Error>;

    /// Drop a physical table with its rows and sync rules.
    fn drop_table(&self, table_id: &str) -> Result<(), Error>;

    /// Check if a physical table exists.
    fn table_exists(&self, table_id: &str) -> Result<bool, Error>;
}

/// Moves rows between physical tables while they are being written.
pub trait DatabaseMigrator: Send + Sync {
    /// Rows of a table in key order, strictly after `after`.
    fn scan_batch(
        &self,
        table_id: &str,
        after: Option<&[u8]>,
        limit: usize,
    ) -> Result<Vec<(Vec<u8>, Row)>, Error>;

    /// Number of rows in a table.
    fn count_rows(&self, table_id: &str) -> Result<u64, Error>;

    /// Insert or replace rows in one transaction. Not captured and not
    /// forwarded.
    fn write_batch(&self, table_id: &str, rows: &[Row]) -> Result<(), Error>;

    /// Highest assigned change-log position.
    fn current_lsn(&self) -> Result<u64, Error>;

    /// Changes with `after < lsn <= until` on the given tables.
    fn changes_since(
        &self,
        after: u64,
        until: u64,
        tables: &BTreeSet<String>,
    ) -> Result<Vec<ChangeRecord>, Error>;

    /// Start forwarding every write on the rule's source to its target.
    /// Returns the change-log position at activation.
    fn install_sync_rule(&self, rule: &SyncRule) -> Result<u64, Error>;

    /// Remove every rule reading from or writing to a table. Returns how
    /// many were removed.
    fn uninstall_sync_rules(&self, table_id: &str) -> Result<usize, Error>;

    /// Make the target row for one source key match the source row.
    /// Returns whether the target changed.
    fn reconcile_key(&self, rule: &SyncRule, source_key: &[u8]) -> Result<bool, Error>;

    /// Compare a rule's target with its source, optionally repairing
    /// differences.
    fn compare(&self, rule: &SyncRule, repair: bool) -> Result<ComparisonReport, Error>;

    /// Remove change-log entries before `lsn`. Returns how many were removed.
    fn truncate_changes(&self, before: u64) -> Result<u64, Error>;
}

/// A session whose logical table names resolve at one version.
pub trait Connection {
    /// Version the session reads and writes.
    fn version(&self) -> &VersionId;

    /// Insert a row.
    fn insert(&self, table: &str, row: Row) -> Result<(), Error>;

    /// Replace the row with the same primary key.
    fn update(&self, table: &str, row: Row) -> Result<(), Error>;

    /// Delete the row with this primary key. Returns whether it existed.
    fn delete(&self, table: &str, key: &[Value]) -> Result<bool, Error>;

    /// Get the row with this primary key.
    fn get(&self, table: &str, key: &[Value]) -> Result<Option<Row>, Error>;

    /// All rows in primary key order.
    fn scan(&self, table: &str) -> Result<Vec<Row>, Error>;

    /// Number of rows.
    fn count(&self, table: &str) -> Result<u64, Error>;
}

//! Embedded backend on a sled database.
//!
//! Trees:
//!
//! - `state`: the committed [`State`], one key per component
//! - `t:{table}` / `u:{table}`: rows and unique-index entries of a table
//! - `cdc`: the change-data-capture log
//! - `sync_rules`: installed sync rules, keyed by target table
//! - `migration:state`: migration progress
//!
//! On open, tables and rules left behind by an interrupted migration are
//! removed and the migration is marked as failed.

mod cdc;
mod config;
mod connection;
mod reconcile;
mod table;
mod write;

pub use cdc::ChangeCapture;
pub use config::EmbeddedConfig;
pub use connection::SledConnection;

use self::table::{TableHandle, ROWS_PREFIX, UNIQUE_PREFIX};
use crate::backend::{
    Backend, ChangeRecord, ComparisonReport, DatabaseMigrator, Row, TableCreator,
};
use crate::catalog::{Catalog, TableDef};
use crate::error::Error;
use crate::migration::{DataMappings, MigrationError, MigrationStateStore, SyncRule};
use crate::versioning::{Changelog, RefLog, State, VersionId};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::RwLock;
use sled::transaction::TransactionError;
use sled::{Db, Tree};
use std::collections::{BTreeMap, BTreeSet};
use std::ops::Bound;
use std::sync::Arc;
use tracing::{debug, info, warn};

const STATE_TREE: &str = "state";
const RULES_TREE: &str = "sync_rules";

const CATALOG_KEY: &str = "catalog";
const CHANGELOG_KEY: &str = "changelog";
const REF_LOG_KEY: &str = "ref_log";
const DATA_MAPPINGS_KEY: &str = "data_mappings";
const CURRENT_KEY: &str = "current";

/// Shared state of an open backend.
pub(crate) struct Inner {
    db: Db,
    meta: Tree,
    rules_tree: Tree,
    cdc: ChangeCapture,
    state_store: MigrationStateStore,
    snapshot: RwLock<Arc<State>>,
    tables: DashMap<String, Arc<TableHandle>>,
    rules: RwLock<BTreeMap<String, SyncRule>>,
}

impl Inner {
    /// The committed state.
    pub(crate) fn snapshot(&self) -> Arc<State> {
        Arc::clone(&self.snapshot.read())
    }

    /// Look up a registered table.
    pub(crate) fn table(&self, id: &str) -> Result<Arc<TableHandle>, Error> {
        self.tables
            .get(id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| Error::TableNotFound(id.to_string()))
    }

    /// Rules reading from a table.
    pub(crate) fn rules_from(&self, source: &str) -> Vec<SyncRule> {
        self.rules
            .read()
            .values()
            .filter(|rule| rule.source_table() == source)
            .cloned()
            .collect()
    }

    fn register(&self, def: TableDef) -> Result<(), Error> {
        let id = def.id.clone();
        let handle = TableHandle::open(&self.db, def)?;
        self.tables.insert(id, Arc::new(handle));
        Ok(())
    }

    fn remove_rules(&self, table_id: &str) -> Result<usize, Error> {
        let mut rules = self.rules.write();
        let doomed: Vec<String> = rules
            .values()
            .filter(|r| r.source_table() == table_id || r.target_table() == table_id)
            .map(|r| r.target_table().to_string())
            .collect();
        for target in &doomed {
            rules.remove(target);
            self.rules_tree.remove(target.as_bytes())?;
        }
        Ok(doomed.len())
    }

    /// Drop physical tables and rules an interrupted migration left behind.
    fn recover(&self) -> Result<(), Error> {
        let mut orphans = 0;
        for name in self.db.tree_names() {
            let text = String::from_utf8_lossy(&name);
            let id = text
                .strip_prefix(ROWS_PREFIX)
                .or_else(|| text.strip_prefix(UNIQUE_PREFIX));
            if let Some(id) = id {
                if !self.tables.contains_key(id) {
                    self.db.drop_tree(&name)?;
                    orphans += 1;
                }
            }
        }

        let mut stale = 0;
        let mut rules = self.rules.write();
        for result in self.rules_tree.iter() {
            let (key, value) = result?;
            let rule = SyncRule::from_bytes(&value)?;
            if self.tables.contains_key(rule.source_table())
                && self.tables.contains_key(rule.target_table())
            {
                rules.insert(rule.target_table().to_string(), rule);
            } else {
                self.rules_tree.remove(key)?;
                stale += 1;
            }
        }
        drop(rules);

        let interrupted = self
            .state_store
            .fail_interrupted("process stopped while the migration was running")
            .map_err(into_core_error)?;

        if orphans > 0 || stale > 0 || interrupted > 0 {
            warn!(
                orphan_trees = orphans,
                stale_rules = stale,
                interrupted_migrations = interrupted,
                "cleaned up after an interrupted migration"
            );
        }
        Ok(())
    }
}

/// Embedded backend storing everything in one sled database.
#[derive(Clone)]
pub struct SledBackend {
    inner: Arc<Inner>,
}

impl SledBackend {
    /// Open or create a database.
    pub fn open(config: &EmbeddedConfig) -> Result<Self, Error> {
        let db = config.to_sled_config().open()?;
        let meta = db.open_tree(STATE_TREE)?;

        let state = if meta.is_empty() {
            let state = State::new();
            write_state(&meta, &state)?;
            info!(root = %state.current, "initialized new database");
            state
        } else {
            read_state(&meta)?
        };

        let rules_tree = db.open_tree(RULES_TREE)?;
        let cdc = ChangeCapture::open(&db)?;
        let state_store = MigrationStateStore::open(&db).map_err(into_core_error)?;

        let inner = Inner {
            db,
            meta,
            rules_tree,
            cdc,
            state_store,
            snapshot: RwLock::new(Arc::new(state.clone())),
            tables: DashMap::new(),
            rules: RwLock::new(BTreeMap::new()),
        };
        for table in state.catalog.tables() {
            inner.register(table.clone())?;
        }
        inner.recover()?;

        debug!(
            tables = inner.tables.len(),
            rules = inner.rules.read().len(),
            lsn = inner.cdc.current_lsn(),
            current = %state.current,
            "database opened"
        );
        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    /// Open a temporary database, deleted on drop.
    pub fn temporary() -> Result<Self, Error> {
        Self::open(&EmbeddedConfig::temporary())
    }

    /// The change-data-capture log.
    pub fn change_log(&self) -> &ChangeCapture {
        &self.inner.cdc
    }

    /// Installed sync rules.
    pub fn sync_rules(&self) -> Vec<SyncRule> {
        self.inner.rules.read().values().cloned().collect()
    }

    /// Definition of a registered physical table.
    pub fn table_def(&self, table_id: &str) -> Result<TableDef, Error> {
        Ok(self.inner.table(table_id)?.def.clone())
    }

    /// Flush all trees to disk.
    pub fn flush(&self) -> Result<(), Error> {
        self.inner.db.flush()?;
        Ok(())
    }
}

impl Backend for SledBackend {
    type Connection = SledConnection;
    type TableCreator = SledBackend;
    type Migrator = SledBackend;

    fn load_state(&self) -> Result<State, Error> {
        read_state(&self.inner.meta)
    }

    fn persist_state(&self, state: &State) -> Result<(), Error> {
        write_state(&self.inner.meta, state)?;
        self.inner.meta.flush()?;
        *self.inner.snapshot.write() = Arc::new(state.clone());
        Ok(())
    }

    fn snapshot(&self) -> Arc<State> {
        self.inner.snapshot()
    }

    fn connect(&self, version: &VersionId) -> Result<SledConnection, Error> {
        if !self.inner.snapshot().ref_log.contains_version(version) {
            return Err(Error::VersionNotForked(version.to_string()));
        }
        Ok(SledConnection::new(Arc::clone(&self.inner), version.clone()))
    }

    fn table_creator(&self) -> &SledBackend {
        self
    }

    fn migrator(&self) -> &SledBackend {
        self
    }

    fn state_store(&self) -> Option<&MigrationStateStore> {
        Some(&self.inner.state_store)
    }
}

impl TableCreator for SledBackend {
    fn create_table(&self, table: &TableDef) -> Result<(), Error> {
        if table.primary_key().is_empty() {
            return Err(Error::MissingPrimaryKey(table.id.clone()));
        }
        let handle = TableHandle::open(&self.inner.db, table.clone())?;
        match self.inner.tables.entry(table.id.clone()) {
            Entry::Occupied(_) => Err(Error::TableExists(table.id.clone())),
            Entry::Vacant(slot) => {
                handle.rows.clear()?;
                handle.unique.clear()?;
                slot.insert(Arc::new(handle));
                debug!(table = %table.id, "table created");
                Ok(())
            }
        }
    }

    fn drop_table(&self, table_id: &str) -> Result<(), Error> {
        let (_, handle) = self
            .inner
            .tables
            .remove(table_id)
            .ok_or_else(|| Error::TableNotFound(table_id.to_string()))?;
        let _guard = handle.lock();
        let rules = self.inner.remove_rules(table_id)?;
        self.inner.db.drop_tree(table::rows_tree(table_id))?;
        self.inner.db.drop_tree(table::unique_tree(table_id))?;
        debug!(table = %table_id, rules, "table dropped");
        Ok(())
    }

    fn table_exists(&self, table_id: &str) -> Result<bool, Error> {
        Ok(self.inner.tables.contains_key(table_id))
    }
}

impl DatabaseMigrator for SledBackend {
    fn scan_batch(
        &self,
        table_id: &str,
        after: Option<&[u8]>,
        limit: usize,
    ) -> Result<Vec<(Vec<u8>, Row)>, Error> {
        let handle = self.inner.table(table_id)?;
        let iter = match after {
            Some(key) => handle
                .rows
                .range::<Vec<u8>, _>((Bound::Excluded(key.to_vec()), Bound::Unbounded)),
            None => handle.rows.iter(),
        };
        iter.take(limit)
            .map(|result| {
                let (key, value) = result?;
                Ok((key.to_vec(), Row::from_bytes(&value)?))
            })
            .collect()
    }

    fn count_rows(&self, table_id: &str) -> Result<u64, Error> {
        Ok(self.inner.table(table_id)?.rows.len() as u64)
    }

    fn write_batch(&self, table_id: &str, rows: &[Row]) -> Result<(), Error> {
        let handle = self.inner.table(table_id)?;
        self.inner.write_batch(&handle, rows)
    }

    fn current_lsn(&self) -> Result<u64, Error> {
        Ok(self.inner.cdc.current_lsn())
    }

    fn changes_since(
        &self,
        after: u64,
        until: u64,
        tables: &BTreeSet<String>,
    ) -> Result<Vec<ChangeRecord>, Error> {
        self.inner.cdc.scan_range(after, until, tables)
    }

    fn install_sync_rule(&self, rule: &SyncRule) -> Result<u64, Error> {
        let source = self.inner.table(rule.source_table())?;
        self.inner.table(rule.target_table())?;

        let _guard = source.lock();
        self.inner
            .rules_tree
            .insert(rule.target_table().as_bytes(), rule.to_bytes()?)?;
        self.inner
            .rules
            .write()
            .insert(rule.target_table().to_string(), rule.clone());
        Ok(self.inner.cdc.current_lsn())
    }

    fn uninstall_sync_rules(&self, table_id: &str) -> Result<usize, Error> {
        self.inner.remove_rules(table_id)
    }

    fn reconcile_key(&self, rule: &SyncRule, source_key: &[u8]) -> Result<bool, Error> {
        self.inner.reconcile_key(rule, source_key)
    }

    fn compare(&self, rule: &SyncRule, repair: bool) -> Result<ComparisonReport, Error> {
        self.inner.compare(rule, repair)
    }

    fn truncate_changes(&self, before: u64) -> Result<u64, Error> {
        self.inner.cdc.truncate_before(before)
    }
}

fn write_state(meta: &Tree, state: &State) -> Result<(), Error> {
    let catalog = state.catalog.to_bytes()?;
    let changelog = state.changelog.to_bytes()?;
    let ref_log = state.ref_log.to_bytes()?;
    let data_mappings = state.data_mappings.to_bytes()?;
    let current = state.current.as_str().as_bytes();

    let result: Result<(), TransactionError<Error>> = meta.transaction(|tx| {
        tx.insert(CATALOG_KEY, catalog.as_slice())?;
        tx.insert(CHANGELOG_KEY, changelog.as_slice())?;
        tx.insert(REF_LOG_KEY, ref_log.as_slice())?;
        tx.insert(DATA_MAPPINGS_KEY, data_mappings.as_slice())?;
        tx.insert(CURRENT_KEY, current)?;
        Ok(())
    });

    match result {
        Ok(()) => Ok(()),
        Err(TransactionError::Abort(e)) => Err(e),
        Err(TransactionError::Storage(e)) => Err(Error::Storage(e)),
    }
}

fn read_state(meta: &Tree) -> Result<State, Error> {
    let get = |key: &str| {
        meta.get(key)?
            .ok_or_else(|| Error::InvalidData(format!("persisted state is missing {}", key)))
    };

    let current = String::from_utf8(get(CURRENT_KEY)?.to_vec())
        .map_err(|_| Error::InvalidData("current version is not UTF-8".into()))?;

    Ok(State {
        catalog: Catalog::from_bytes(&get(CATALOG_KEY)?)?,
        changelog: Changelog::from_bytes(&get(CHANGELOG_KEY)?)?,
        ref_log: RefLog::from_bytes(&get(REF_LOG_KEY)?)?,
        data_mappings: DataMappings::from_bytes(&get(DATA_MAPPINGS_KEY)?)?,
        current: VersionId::new(current),
    })
}

fn into_core_error(err: MigrationError) -> Error {
    match err {
        MigrationError::Storage(e) => e,
        other => Error::InvalidData(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{ChangeKind, Connection};
    use crate::catalog::{ColumnDef, DataType, IndexDef};
    use crate::migration::{Derivation, ResolvedMapping};
    use crate::value::Value;
    use tempfile::tempdir;

    fn users() -> TableDef {
        TableDef::new("")
            .with_column(ColumnDef::primary_key("id", DataType::BigInt))
            .with_column(ColumnDef::new("name", DataType::Text))
            .with_column(ColumnDef::new("email", DataType::Text))
            .with_index(IndexDef::new("idx_email", ["email"]).unique())
    }

    /// Backend with a committed `users` table; returns its physical id.
    fn backend_with_users() -> (SledBackend, String) {
        let backend = SledBackend::temporary().unwrap();
        let mut state = (*backend.snapshot()).clone();
        let id = state.create_table("users", users()).unwrap();
        backend
            .create_table(state.catalog.table(&id).unwrap())
            .unwrap();
        backend.persist_state(&state).unwrap();
        (backend, id)
    }

    fn ghost_of(backend: &SledBackend, source: &str, ghost: &str) -> SyncRule {
        let def = backend.table_def(source).unwrap().copy_as(ghost);
        backend.create_table(&def).unwrap();
        let mut columns = BTreeMap::new();
        for column in ["id", "name", "email"] {
            columns.insert(column.to_string(), Derivation::column(column));
        }
        SyncRule::new(
            [1; 16],
            ResolvedMapping {
                source_table: source.to_string(),
                target_table: ghost.to_string(),
                columns,
            },
        )
    }

    fn row(id: i64, name: &str) -> Row {
        Row::new().with("id", id).with("name", name)
    }

    #[test]
    fn test_connection_crud() {
        let (backend, _) = backend_with_users();
        let conn = backend.connect(&backend.snapshot().current).unwrap();

        conn.insert("users", row(1, "ada")).unwrap();
        conn.insert("users", row(2, "bob")).unwrap();
        assert!(matches!(
            conn.insert("users", row(1, "dup")),
            Err(Error::UniqueViolation { .. })
        ));

        conn.update("users", row(2, "robert")).unwrap();
        assert!(matches!(
            conn.update("users", row(9, "nobody")),
            Err(Error::RowNotFound(_))
        ));

        let fetched = conn.get("users", &[Value::Int(2)]).unwrap().unwrap();
        assert_eq!(fetched.get("name"), Some(&Value::String("robert".into())));
        assert_eq!(fetched.get("email"), Some(&Value::Null));

        assert!(conn.delete("users", &[Value::Int(1)]).unwrap());
        assert!(!conn.delete("users", &[Value::Int(1)]).unwrap());
        assert_eq!(conn.count("users").unwrap(), 1);
        assert_eq!(conn.scan("users").unwrap().len(), 1);
        assert!(matches!(
            conn.insert("missing", row(1, "x")),
            Err(Error::TableRefNotFound { .. })
        ));
    }

    #[test]
    fn test_unique_index_enforced() {
        let (backend, _) = backend_with_users();
        let conn = backend.connect(&backend.snapshot().current).unwrap();

        conn.insert("users", row(1, "a").with("email", "x@y")).unwrap();
        let err = conn
            .insert("users", row(2, "b").with("email", "x@y"))
            .unwrap_err();
        assert!(matches!(err, Error::UniqueViolation { ref index, .. } if index == "idx_email"));

        // Freeing the value makes it available again.
        conn.update("users", row(1, "a").with("email", "z@y")).unwrap();
        conn.insert("users", row(2, "b").with("email", "x@y")).unwrap();
    }

    #[test]
    fn test_writes_are_captured() {
        let (backend, id) = backend_with_users();
        let conn = backend.connect(&backend.snapshot().current).unwrap();
        let start = backend.current_lsn().unwrap();

        conn.insert("users", row(1, "a")).unwrap();
        conn.update("users", row(1, "b")).unwrap();
        conn.delete("users", &[Value::Int(1)]).unwrap();

        let tables: BTreeSet<String> = [id].into_iter().collect();
        let kinds: Vec<ChangeKind> = backend
            .changes_since(start, backend.current_lsn().unwrap(), &tables)
            .unwrap()
            .into_iter()
            .map(|c| c.kind)
            .collect();
        assert_eq!(kinds, vec![ChangeKind::Insert, ChangeKind::Update, ChangeKind::Delete]);
    }

    #[test]
    fn test_sync_rule_forwards_writes_across_generations() {
        let (backend, id) = backend_with_users();
        let conn = backend.connect(&backend.snapshot().current).unwrap();
        conn.insert("users", row(1, "before")).unwrap();

        let first = ghost_of(&backend, &id, "g1");
        backend.install_sync_rule(&first).unwrap();
        let second = ghost_of(&backend, "g1", "g2");
        backend.install_sync_rule(&second).unwrap();

        conn.insert("users", row(2, "after")).unwrap();
        conn.update("users", row(2, "changed")).unwrap();

        let g2 = backend.scan_batch("g2", None, 10).unwrap();
        assert_eq!(g2.len(), 1);
        assert_eq!(g2[0].1.get("name"), Some(&Value::String("changed".into())));

        conn.delete("users", &[Value::Int(2)]).unwrap();
        assert_eq!(backend.count_rows("g1").unwrap(), 0);
        assert_eq!(backend.count_rows("g2").unwrap(), 0);

        // Pre-existing rows are not forwarded until reconciled.
        let key = crate::value::encode_key(&[Value::Int(1)]);
        assert!(backend.reconcile_key(&first, &key).unwrap());
        assert!(!backend.reconcile_key(&first, &key).unwrap());
        assert_eq!(backend.count_rows("g2").unwrap(), 1);
    }

    #[test]
    fn test_compare_repairs_differences() {
        let (backend, id) = backend_with_users();
        let conn = backend.connect(&backend.snapshot().current).unwrap();
        for i in 1..=3 {
            conn.insert("users", row(i, "x")).unwrap();
        }
        let rule = ghost_of(&backend, &id, "g1");
        backend
            .write_batch("g1", &[row(1, "x"), row(2, "stale"), row(7, "gone")])
            .unwrap();

        let report = backend.compare(&rule, false).unwrap();
        assert_eq!(report.source_rows, 3);
        assert_eq!(report.missing, 1);
        assert_eq!(report.mismatched, 1);
        assert_eq!(report.extra, 1);
        assert_eq!(report.repaired, 0);

        let report = backend.compare(&rule, true).unwrap();
        assert_eq!(report.repaired, 3);
        assert!(backend.compare(&rule, false).unwrap().is_consistent());
    }

    #[test]
    fn test_write_batch_is_not_captured() {
        let (backend, id) = backend_with_users();
        let lsn = backend.current_lsn().unwrap();
        backend.write_batch(&id, &[row(1, "a"), row(2, "b")]).unwrap();
        assert_eq!(backend.current_lsn().unwrap(), lsn);
        assert_eq!(backend.count_rows(&id).unwrap(), 2);

        let page = backend.scan_batch(&id, None, 1).unwrap();
        let rest = backend.scan_batch(&id, Some(&page[0].0), 10).unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].1.get("id"), Some(&Value::Int(2)));
    }

    #[test]
    fn test_table_lifecycle() {
        let (backend, id) = backend_with_users();
        assert!(backend.table_exists(&id).unwrap());
        let def = backend.table_def(&id).unwrap();
        assert!(matches!(
            backend.create_table(&def),
            Err(Error::TableExists(_))
        ));

        let rule = ghost_of(&backend, &id, "g1");
        backend.install_sync_rule(&rule).unwrap();
        backend.drop_table("g1").unwrap();
        assert!(!backend.table_exists("g1").unwrap());
        assert!(backend.sync_rules().is_empty());
        assert!(matches!(
            backend.drop_table("g1"),
            Err(Error::TableNotFound(_))
        ));
    }

    #[test]
    fn test_reopen_restores_state_and_drops_orphans() {
        let dir = tempdir().unwrap();
        // No background flusher, so dropping the backend releases the lock.
        let config = EmbeddedConfig::new(dir.path().join("db")).with_flush_every_ms(None);
        let id;
        let expected;
        {
            let backend = SledBackend::open(&config).unwrap();
            let mut state = (*backend.snapshot()).clone();
            id = state.create_table("users", users()).unwrap();
            backend
                .create_table(state.catalog.table(&id).unwrap())
                .unwrap();
            state.changelog.add_change_set(
                "dev",
                "drop email",
                vec![crate::operation::builder::drop_column("users", "email")],
            );
            backend.persist_state(&state).unwrap();
            backend
                .connect(&state.current)
                .unwrap()
                .insert("users", row(1, "kept"))
                .unwrap();

            // A ghost that never made it into the catalog.
            let rule = ghost_of(&backend, &id, "g_orphan");
            backend.install_sync_rule(&rule).unwrap();
            backend.flush().unwrap();
            expected = state;
        }

        let backend = SledBackend::open(&config).unwrap();
        let state = backend.snapshot();
        assert_eq!(*state, expected);
        assert_eq!(backend.load_state().unwrap(), expected);
        assert_eq!(state.changelog.versions().count(), 2);
        assert!(state.ref_log.contains_version(&state.current));
        assert!(state.catalog.contains(&id));
        assert!(!backend.table_exists("g_orphan").unwrap());
        assert!(backend.sync_rules().is_empty());

        let conn = backend.connect(&state.current).unwrap();
        assert_eq!(conn.count("users").unwrap(), 1);
    }
}

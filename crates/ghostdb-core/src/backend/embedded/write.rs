//! The row write path.
//!
//! A write locks its table, then follows the sync rules reading from that
//! table: each target is locked in turn (older generation first), the
//! mapped row or key is computed, and the walk continues from the target.
//! Every resulting row change is then committed in one sled transaction
//! together with its unique-index entries and change-log records.

use super::cdc;
use super::table::{TableGuard, TableHandle};
use super::Inner;
use crate::backend::{ChangeKind, ChangeRecord, Row};
use crate::error::Error;
use sled::transaction::{ConflictableTransactionError, TransactionError, TransactionalTree};
use sled::{Transactional, Tree};
use std::collections::HashMap;
use std::sync::Arc;

/// A write requested on one table.
pub(crate) enum RowWrite {
    /// Insert a new row; fails if the key exists.
    Insert(Row),
    /// Replace an existing row; fails if the key does not exist.
    Update(Row),
    /// Insert or replace.
    Upsert(Row),
    /// Delete the row with this encoded key, if any.
    Delete(Vec<u8>),
}

/// One row change about to be committed.
struct PendingWrite {
    table: Arc<TableHandle>,
    key: Vec<u8>,
    old: Option<Row>,
    new: Option<Row>,
}

impl PendingWrite {
    fn kind(&self) -> ChangeKind {
        match (&self.old, &self.new) {
            (None, _) => ChangeKind::Insert,
            (Some(_), Some(_)) => ChangeKind::Update,
            (Some(_), None) => ChangeKind::Delete,
        }
    }
}

impl Inner {
    /// Apply a write to a table and forward it through the sync rules.
    ///
    /// Returns whether the table changed; for a delete, whether the row
    /// existed.
    pub(crate) fn write(&self, table: &Arc<TableHandle>, write: RowWrite) -> Result<bool, Error> {
        let mut guards = Vec::new();
        self.write_locked(table, write, &mut guards)
    }

    /// Like [`Inner::write`], keeping the taken locks in `guards`.
    ///
    /// The caller may already hold locks of tables older than `table`.
    pub(crate) fn write_locked(
        &self,
        table: &Arc<TableHandle>,
        write: RowWrite,
        guards: &mut Vec<TableGuard>,
    ) -> Result<bool, Error> {
        guards.push(table.lock());

        let (key, new) = match write {
            RowWrite::Insert(row) => {
                let row = table.prepare_insert(row)?;
                let key = row.key(&table.def)?;
                if table.get(&key)?.is_some() {
                    return Err(Error::UniqueViolation {
                        table: table.id().to_string(),
                        index: "primary key".into(),
                    });
                }
                (key, Some(row))
            }
            RowWrite::Update(row) => {
                let row = table.normalize(row)?;
                let key = row.key(&table.def)?;
                if table.get(&key)?.is_none() {
                    return Err(Error::RowNotFound(table.id().to_string()));
                }
                (key, Some(row))
            }
            RowWrite::Upsert(row) => {
                let row = table.normalize(row)?;
                (row.key(&table.def)?, Some(row))
            }
            RowWrite::Delete(key) => (key, None),
        };

        let mut pending = Vec::new();
        self.cascade(Arc::clone(table), key, new, &mut pending, guards)?;
        let changed = !pending.is_empty();
        self.commit(&pending, true)?;
        Ok(changed)
    }

    /// Record the change of one row and follow the rules reading from its
    /// table. Unchanged rows stop the walk.
    fn cascade(
        &self,
        table: Arc<TableHandle>,
        key: Vec<u8>,
        new: Option<Row>,
        pending: &mut Vec<PendingWrite>,
        guards: &mut Vec<TableGuard>,
    ) -> Result<(), Error> {
        let old = table.get(&key)?;
        if old == new {
            return Ok(());
        }

        // Read under the table's lock: installing a rule takes it too.
        let rules = self.rules_from(table.id());
        let mut forwarded = Vec::with_capacity(rules.len());
        for rule in &rules {
            let target = self.table(rule.target_table())?;
            guards.push(target.lock());
            let (target_key, target_row) = match &new {
                Some(row) => {
                    let mapped = target.normalize(rule.map_row(row)?)?;
                    (mapped.key(&target.def)?, Some(mapped))
                }
                None => (rule.target_key(&table.def, &target.def, &key)?, None),
            };
            forwarded.push((target, target_key, target_row));
        }

        pending.push(PendingWrite {
            table,
            key,
            old,
            new,
        });
        for (target, target_key, target_row) in forwarded {
            self.cascade(target, target_key, target_row, pending, guards)?;
        }
        Ok(())
    }

    /// Insert or replace rows of one table without capturing or forwarding
    /// them.
    pub(crate) fn write_batch(&self, table: &Arc<TableHandle>, rows: &[Row]) -> Result<(), Error> {
        let _guard = table.lock();
        let mut pending = Vec::with_capacity(rows.len());
        for row in rows {
            let row = table.normalize(row.clone())?;
            let key = row.key(&table.def)?;
            let old = table.get(&key)?;
            if old.as_ref() == Some(&row) {
                continue;
            }
            pending.push(PendingWrite {
                table: Arc::clone(table),
                key,
                old,
                new: Some(row),
            });
        }
        self.commit(&pending, false)
    }

    /// Commit row changes atomically, maintaining unique indexes and, if
    /// `capture` is set, the change log.
    fn commit(&self, pending: &[PendingWrite], capture: bool) -> Result<(), Error> {
        if pending.is_empty() {
            return Ok(());
        }

        // Each table contributes its row and unique trees, the change log
        // comes last.
        let mut trees: Vec<Tree> = Vec::with_capacity(pending.len() * 2 + 1);
        let mut slots: HashMap<&str, usize> = HashMap::new();
        for write in pending {
            if !slots.contains_key(write.table.id()) {
                slots.insert(write.table.id(), trees.len());
                trees.push(write.table.rows.clone());
                trees.push(write.table.unique.clone());
            }
        }
        let cdc_slot = trees.len();
        trees.push(self.cdc.tree().clone());

        let first_lsn = if capture {
            self.cdc.reserve(pending.len())
        } else {
            0
        };

        let result: Result<(), TransactionError<Error>> =
            trees.as_slice().transaction(|views| {
                for (offset, write) in pending.iter().enumerate() {
                    let slot = slots[write.table.id()];
                    Self::apply_row(&views[slot], &views[slot + 1], write)?;

                    if capture {
                        let lsn = first_lsn + offset as u64;
                        let record = ChangeRecord {
                            lsn,
                            table: write.table.id().to_string(),
                            key: write.key.clone(),
                            kind: write.kind(),
                        };
                        let bytes = cdc::encode(&record).map_err(ConflictableTransactionError::Abort)?;
                        views[cdc_slot].insert(lsn.to_be_bytes().to_vec(), bytes)?;
                    }
                }
                Ok(())
            });

        match result {
            Ok(()) => Ok(()),
            Err(TransactionError::Abort(e)) => Err(e),
            Err(TransactionError::Storage(e)) => Err(Error::Storage(e)),
        }
    }

    /// Write one row change and its unique-index entries.
    fn apply_row(
        rows: &TransactionalTree,
        unique: &TransactionalTree,
        write: &PendingWrite,
    ) -> Result<(), ConflictableTransactionError<Error>> {
        if let Some(old) = &write.old {
            for (_, entry) in write.table.unique_entries(old) {
                unique.remove(entry)?;
            }
        }

        match &write.new {
            Some(row) => {
                for (name, entry) in write.table.unique_entries(row) {
                    if let Some(owner) = unique.get(&entry)? {
                        if owner.as_ref() != write.key.as_slice() {
                            return Err(ConflictableTransactionError::Abort(
                                Error::UniqueViolation {
                                    table: write.table.id().to_string(),
                                    index: name,
                                },
                            ));
                        }
                    }
                    unique.insert(entry, write.key.as_slice())?;
                }
                let bytes = row.to_bytes().map_err(ConflictableTransactionError::Abort)?;
                rows.insert(write.key.as_slice(), bytes)?;
            }
            None => {
                rows.remove(write.key.as_slice())?;
            }
        }
        Ok(())
    }
}

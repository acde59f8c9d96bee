//! Persistent change-data-capture log.
//!
//! Every captured row write gets a Log Sequence Number (LSN). Entries are
//! keyed by their LSN (big-endian for ordering), so a range scan returns
//! them in write order. Migrations replay the log to catch ghost tables up
//! with writes that landed before their sync rules were active.

use crate::backend::ChangeRecord;
use crate::error::Error;
use sled::{Db, Tree};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};

/// Tree holding the change log.
pub(crate) const CDC_TREE: &str = "cdc";

/// Persistent change log backed by sled.
pub struct ChangeCapture {
    /// The sled tree storing change records.
    tree: Tree,
    /// Current (highest reserved) LSN.
    current_lsn: AtomicU64,
}

impl ChangeCapture {
    /// Open or create the change log in the given sled database.
    pub fn open(db: &Db) -> Result<Self, Error> {
        let tree = db.open_tree(CDC_TREE)?;
        let current_lsn = Self::load_last_lsn(&tree)?;

        Ok(Self {
            tree,
            current_lsn: AtomicU64::new(current_lsn),
        })
    }

    /// Load the last LSN from the tree, or 0 if empty.
    fn load_last_lsn(tree: &Tree) -> Result<u64, Error> {
        if let Some((key, _)) = tree.last()? {
            if let Ok(bytes) = <[u8; 8]>::try_from(key.as_ref()) {
                return Ok(u64::from_be_bytes(bytes));
            }
        }
        Ok(0)
    }

    /// Reserve `count` consecutive LSNs and return the first.
    ///
    /// Reserved numbers that end up unused leave gaps in the log.
    pub fn reserve(&self, count: usize) -> u64 {
        self.current_lsn.fetch_add(count as u64, Ordering::SeqCst) + 1
    }

    /// Get the current (highest reserved) LSN.
    pub fn current_lsn(&self) -> u64 {
        self.current_lsn.load(Ordering::SeqCst)
    }

    /// The underlying tree, for writing records inside row transactions.
    pub(crate) fn tree(&self) -> &Tree {
        &self.tree
    }

    /// Get a record by its LSN.
    pub fn get(&self, lsn: u64) -> Result<Option<ChangeRecord>, Error> {
        match self.tree.get(lsn.to_be_bytes())? {
            Some(value) => Ok(Some(decode(&value)?)),
            None => Ok(None),
        }
    }

    /// Records with `after < lsn <= until` on the given tables, in LSN order.
    pub fn scan_range(
        &self,
        after: u64,
        until: u64,
        tables: &BTreeSet<String>,
    ) -> Result<Vec<ChangeRecord>, Error> {
        if until <= after {
            return Ok(Vec::new());
        }
        let start = (after + 1).to_be_bytes();
        let end = until.to_be_bytes();

        let mut records = Vec::new();
        for result in self.tree.range(start..=end) {
            let (_, value) = result?;
            let record = decode(&value)?;
            if tables.contains(&record.table) {
                records.push(record);
            }
        }
        Ok(records)
    }

    /// Truncate records before the given LSN (exclusive).
    ///
    /// Returns the number of records removed.
    pub fn truncate_before(&self, before_lsn: u64) -> Result<u64, Error> {
        let mut removed = 0u64;
        let end_key = before_lsn.to_be_bytes();

        for result in self.tree.range(..end_key) {
            let (key, _) = result?;
            self.tree.remove(key)?;
            removed += 1;
        }

        Ok(removed)
    }

    /// Get the number of records in the log.
    pub fn len(&self) -> usize {
        self.tree.len()
    }

    /// Check if the log is empty.
    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }
}

/// Serialize a change record.
pub(crate) fn encode(record: &ChangeRecord) -> Result<Vec<u8>, Error> {
    rkyv::to_bytes::<rkyv::rancor::Error>(record)
        .map(|v| v.to_vec())
        .map_err(|e| Error::Serialization(e.to_string()))
}

fn decode(bytes: &[u8]) -> Result<ChangeRecord, Error> {
    rkyv::from_bytes::<ChangeRecord, rkyv::rancor::Error>(&crate::codec::aligned(bytes))
        .map_err(|e| Error::Deserialization(e.to_string()))
}

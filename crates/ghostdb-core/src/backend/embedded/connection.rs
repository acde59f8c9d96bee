//! Versioned sessions on the embedded backend.

use super::write::RowWrite;
use super::Inner;
use crate::backend::{Connection, Row};
use crate::error::Error;
use crate::value::Value;
use crate::versioning::VersionId;
use std::sync::Arc;

/// A session resolving logical table names at one version.
///
/// Names are resolved against the committed state on every call, so a
/// session opened before a cutover keeps working at its version.
pub struct SledConnection {
    inner: Arc<Inner>,
    version: VersionId,
}

impl SledConnection {
    pub(crate) fn new(inner: Arc<Inner>, version: VersionId) -> Self {
        Self { inner, version }
    }

    fn resolve(&self, table: &str) -> Result<Arc<super::table::TableHandle>, Error> {
        let snapshot = self.inner.snapshot();
        let physical = snapshot.ref_log.table_id(&self.version, table)?;
        self.inner.table(physical)
    }
}

impl Connection for SledConnection {
    fn version(&self) -> &VersionId {
        &self.version
    }

    fn insert(&self, table: &str, row: Row) -> Result<(), Error> {
        let handle = self.resolve(table)?;
        self.inner.write(&handle, RowWrite::Insert(row))?;
        Ok(())
    }

    fn update(&self, table: &str, row: Row) -> Result<(), Error> {
        let handle = self.resolve(table)?;
        self.inner.write(&handle, RowWrite::Update(row))?;
        Ok(())
    }

    fn delete(&self, table: &str, key: &[Value]) -> Result<bool, Error> {
        let handle = self.resolve(table)?;
        let key = handle.encode_key_values(key)?;
        self.inner.write(&handle, RowWrite::Delete(key))
    }

    fn get(&self, table: &str, key: &[Value]) -> Result<Option<Row>, Error> {
        let handle = self.resolve(table)?;
        handle.get(&handle.encode_key_values(key)?)
    }

    fn scan(&self, table: &str) -> Result<Vec<Row>, Error> {
        let handle = self.resolve(table)?;
        handle
            .rows
            .iter()
            .values()
            .map(|bytes| Row::from_bytes(&bytes?))
            .collect()
    }

    fn count(&self, table: &str) -> Result<u64, Error> {
        Ok(self.resolve(table)?.rows.len() as u64)
    }
}

//! Physical tables of the embedded backend.
//!
//! Each table owns two sled trees: `t:{id}` maps encoded primary keys to
//! rows, and `u:{id}` maps unique-key entries to the primary key owning
//! them. Writers serialize on the table's lock.

use crate::backend::Row;
use crate::catalog::{ColumnHint, TableDef};
use crate::error::Error;
use crate::value::{decode_key, encode_key, Value};
use parking_lot::{lock_api::ArcMutexGuard, Mutex, RawMutex};
use sled::{Db, Tree};
use std::sync::Arc;

/// Prefix of row trees.
pub(crate) const ROWS_PREFIX: &str = "t:";
/// Prefix of unique-index trees.
pub(crate) const UNIQUE_PREFIX: &str = "u:";

/// An owned lock on a table.
pub(crate) type TableGuard = ArcMutexGuard<RawMutex, ()>;

/// A registered physical table.
pub(crate) struct TableHandle {
    pub(crate) def: TableDef,
    pub(crate) rows: Tree,
    pub(crate) unique: Tree,
    lock: Arc<Mutex<()>>,
}

impl TableHandle {
    /// Open the trees of a table.
    pub(crate) fn open(db: &Db, def: TableDef) -> Result<Self, Error> {
        let rows = db.open_tree(rows_tree(&def.id))?;
        let unique = db.open_tree(unique_tree(&def.id))?;
        Ok(Self {
            def,
            rows,
            unique,
            lock: Arc::new(Mutex::new(())),
        })
    }

    /// Take the table's write lock.
    pub(crate) fn lock(&self) -> TableGuard {
        self.lock.lock_arc()
    }

    /// Physical table identifier.
    pub(crate) fn id(&self) -> &str {
        &self.def.id
    }

    /// Get a row by encoded key.
    pub(crate) fn get(&self, key: &[u8]) -> Result<Option<Row>, Error> {
        self.rows
            .get(key)?
            .map(|bytes| Row::from_bytes(&bytes))
            .transpose()
    }

    /// Check a row against the table definition.
    ///
    /// Unknown columns are rejected, missing columns take their default (or
    /// NULL), and every value is coerced to its column type.
    pub(crate) fn normalize(&self, row: Row) -> Result<Row, Error> {
        if let Some(unknown) = row.columns().find(|c| !self.def.has_column(c)) {
            return Err(Error::ColumnNotFound {
                table: self.def.id.clone(),
                column: unknown.to_string(),
            });
        }

        let mut normalized = Row::new();
        for column in &self.def.columns {
            let value = match row.get(&column.name) {
                Some(value) => value.clone(),
                None => column.default.clone().unwrap_or(Value::Null),
            };
            let value = value
                .coerce_to(&column.data_type)
                .map_err(|reason| Error::TypeMismatch {
                    table: self.def.id.clone(),
                    column: column.name.clone(),
                    expected: column.data_type.to_string(),
                    reason,
                })?;
            if value.is_null() && !column.is_nullable() {
                return Err(Error::NotNullViolation {
                    table: self.def.id.clone(),
                    column: column.name.clone(),
                });
            }
            normalized.set(column.name.clone(), value);
        }
        Ok(normalized)
    }

    /// Fill an auto-increment primary key, then normalize.
    ///
    /// Only a single-column integer key is generated: one past the largest
    /// stored key.
    pub(crate) fn prepare_insert(&self, mut row: Row) -> Result<Row, Error> {
        let pk = self.def.primary_key();
        if let [name] = pk.as_slice() {
            let generated = self.def.column(name).is_some_and(|c| {
                c.data_type.is_integer()
                    && (c.has_hint(ColumnHint::AutoIncrement) || c.has_hint(ColumnHint::Identity))
            });
            if generated && row.get(name).map_or(true, Value::is_null) {
                let next = match self.rows.last()? {
                    Some((key, _)) => match decode_key(&key)?.first() {
                        Some(Value::Int(last)) => last.saturating_add(1),
                        _ => 1,
                    },
                    None => 1,
                };
                row.set(name.to_string(), Value::Int(next));
            }
        }
        self.normalize(row)
    }

    /// Encode primary key values given by a caller, coercing them to the
    /// key column types.
    pub(crate) fn encode_key_values(&self, values: &[Value]) -> Result<Vec<u8>, Error> {
        let pk = self.def.primary_key();
        if pk.len() != values.len() {
            return Err(Error::InvalidData(format!(
                "table {} has a {}-column primary key, got {} values",
                self.def.id,
                pk.len(),
                values.len()
            )));
        }
        let coerced = pk
            .iter()
            .zip(values)
            .map(|(name, value)| {
                let column = self.def.column(name).ok_or_else(|| Error::ColumnNotFound {
                    table: self.def.id.clone(),
                    column: name.to_string(),
                })?;
                value
                    .clone()
                    .coerce_to(&column.data_type)
                    .map_err(|reason| Error::TypeMismatch {
                        table: self.def.id.clone(),
                        column: column.name.clone(),
                        expected: column.data_type.to_string(),
                        reason,
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(encode_key(&coerced))
    }

    /// Unique-index entries of a row, with the index or constraint name.
    ///
    /// Keys with a NULL component are not indexed.
    pub(crate) fn unique_entries(&self, row: &Row) -> Vec<(String, Vec<u8>)> {
        self.def
            .unique_keys()
            .into_iter()
            .filter_map(|(name, columns)| {
                let values: Vec<Value> = columns
                    .iter()
                    .map(|c| row.get(c).cloned().unwrap_or(Value::Null))
                    .collect();
                if values.iter().any(Value::is_null) {
                    return None;
                }
                let mut entry = Vec::with_capacity(name.len() + 1 + values.len() * 9);
                entry.extend_from_slice(name.as_bytes());
                entry.push(0);
                entry.extend_from_slice(&encode_key(&values));
                Some((name.to_string(), entry))
            })
            .collect()
    }
}

/// Name of a table's row tree.
pub(crate) fn rows_tree(id: &str) -> String {
    format!("{}{}", ROWS_PREFIX, id)
}

/// Name of a table's unique-index tree.
pub(crate) fn unique_tree(id: &str) -> String {
    format!("{}{}", UNIQUE_PREFIX, id)
}

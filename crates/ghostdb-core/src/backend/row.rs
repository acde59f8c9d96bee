//! Rows as column-name to value maps.

use crate::catalog::TableDef;
use crate::error::Error;
use crate::value::{encode_key, Value};
use rkyv::{Archive, Deserialize, Serialize};
use std::collections::BTreeMap;

/// A table row.
#[derive(
    Debug,
    Clone,
    Default,
    PartialEq,
    Archive,
    Serialize,
    Deserialize,
    serde::Serialize,
    serde::Deserialize,
)]
#[serde(transparent)]
pub struct Row {
    values: BTreeMap<String, Value>,
}

impl Row {
    /// Create an empty row.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a column value.
    pub fn with(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.values.insert(column.into(), value.into());
        self
    }

    /// Get a column value.
    pub fn get(&self, column: &str) -> Option<&Value> {
        self.values.get(column)
    }

    /// Set a column value.
    pub fn set(&mut self, column: impl Into<String>, value: Value) {
        self.values.insert(column.into(), value);
    }

    /// Remove a column value.
    pub fn remove(&mut self, column: &str) -> Option<Value> {
        self.values.remove(column)
    }

    /// Iterate over columns in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Column names in name order.
    pub fn columns(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    /// Number of columns present.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Check if no column is present.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Primary key values of the row for a table, in key order.
    pub fn key_values(&self, table: &TableDef) -> Result<Vec<Value>, Error> {
        let pk = table.primary_key();
        if pk.is_empty() {
            return Err(Error::MissingPrimaryKey(table.id.clone()));
        }
        pk.into_iter()
            .map(|column| match self.get(column) {
                Some(value) if !value.is_null() => Ok(value.clone()),
                _ => Err(Error::MissingKey {
                    table: table.id.clone(),
                    column: column.to_string(),
                }),
            })
            .collect()
    }

    /// Encoded primary key of the row for a table.
    pub fn key(&self, table: &TableDef) -> Result<Vec<u8>, Error> {
        Ok(encode_key(&self.key_values(table)?))
    }

    /// Serialize the row to bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, Error> {
        rkyv::to_bytes::<rkyv::rancor::Error>(self)
            .map(|v| v.to_vec())
            .map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Deserialize a row from bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, Error> {
        rkyv::from_bytes::<Self, rkyv::rancor::Error>(&crate::codec::aligned(bytes))
            .map_err(|e| Error::Deserialization(e.to_string()))
    }
}

impl FromIterator<(String, Value)> for Row {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        Self {
            values: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{ColumnDef, DataType};

    fn users() -> TableDef {
        TableDef::new("t_users")
            .with_column(ColumnDef::primary_key("id", DataType::BigInt))
            .with_column(ColumnDef::new("name", DataType::Text))
    }

    #[test]
    fn test_row_accessors() {
        let mut row = Row::new().with("id", 1i64).with("name", "ada");
        assert_eq!(row.get("name"), Some(&Value::String("ada".into())));
        assert_eq!(row.columns().collect::<Vec<_>>(), vec!["id", "name"]);

        row.set("name", Value::Null);
        assert_eq!(row.remove("name"), Some(Value::Null));
        assert_eq!(row.len(), 1);
    }

    #[test]
    fn test_key() {
        let row = Row::new().with("id", 7i64).with("name", "x");
        assert_eq!(row.key(&users()).unwrap(), encode_key(&[Value::Int(7)]));

        let missing = Row::new().with("name", "x");
        assert!(matches!(
            missing.key(&users()),
            Err(Error::MissingKey { .. })
        ));

        let no_pk = TableDef::new("t").with_column(ColumnDef::new("a", DataType::Text));
        assert!(matches!(
            row.key(&no_pk),
            Err(Error::MissingPrimaryKey(_))
        ));
    }

    #[test]
    fn test_serialization() {
        let row = Row::new().with("id", 1i64).with("ok", true).with("blob", vec![0u8, 1]);
        assert_eq!(Row::from_bytes(&row.to_bytes().unwrap()).unwrap(), row);
    }
}

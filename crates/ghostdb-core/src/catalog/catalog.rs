//! The catalog of every physical table known to a database.

use super::foreign_key::ForeignKeyDef;
use super::table::TableDef;
use crate::error::Error;
use rkyv::{Archive, Deserialize, Serialize};
use std::collections::BTreeMap;

/// Every physical table across all versions, keyed by physical identifier.
///
/// Invariants: identifiers are unique and every foreign key refers to a table
/// and columns present in the catalog (see [`Catalog::validate`]).
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
pub struct Catalog {
    tables: BTreeMap<String, TableDef>,
}

impl Catalog {
    /// Create an empty catalog.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a table. Its identifier must be new.
    pub fn add_table(&mut self, table: TableDef) -> Result<(), Error> {
        if self.tables.contains_key(&table.id) {
            return Err(Error::TableExists(table.id));
        }
        self.tables.insert(table.id.clone(), table);
        Ok(())
    }

    /// Remove a table.
    pub fn remove_table(&mut self, id: &str) -> Result<TableDef, Error> {
        self.tables
            .remove(id)
            .ok_or_else(|| Error::TableNotFound(id.to_string()))
    }

    /// Get a table by identifier.
    pub fn get(&self, id: &str) -> Option<&TableDef> {
        self.tables.get(id)
    }

    /// Get a table by identifier, failing if absent.
    pub fn table(&self, id: &str) -> Result<&TableDef, Error> {
        self.get(id).ok_or_else(|| Error::TableNotFound(id.to_string()))
    }

    /// Get a table by identifier for mutation, failing if absent.
    pub fn table_mut(&mut self, id: &str) -> Result<&mut TableDef, Error> {
        self.tables
            .get_mut(id)
            .ok_or_else(|| Error::TableNotFound(id.to_string()))
    }

    /// Check if a table exists.
    pub fn contains(&self, id: &str) -> bool {
        self.tables.contains_key(id)
    }

    /// Iterate over all tables in identifier order.
    pub fn tables(&self) -> impl Iterator<Item = &TableDef> {
        self.tables.values()
    }

    /// All table identifiers.
    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.tables.keys().map(String::as_str)
    }

    /// Number of tables.
    pub fn len(&self) -> usize {
        self.tables.len()
    }

    /// Check if the catalog is empty.
    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    /// Foreign keys of other tables that refer to `id`.
    pub fn referencing(&self, id: &str) -> Vec<(&TableDef, &ForeignKeyDef)> {
        self.tables
            .values()
            .flat_map(|t| t.foreign_keys.iter().map(move |fk| (t, fk)))
            .filter(|(_, fk)| fk.referred_table == id)
            .collect()
    }

    /// Check that every foreign key refers to an existing table and columns.
    pub fn validate(&self) -> Result<(), Error> {
        for table in self.tables.values() {
            for fk in &table.foreign_keys {
                let referred = self.get(&fk.referred_table).ok_or_else(|| {
                    Error::DanglingForeignKey {
                        table: table.id.clone(),
                        foreign_key: fk.name.clone(),
                        referred: fk.referred_table.clone(),
                    }
                })?;
                if let Some(missing) = fk
                    .referred_columns
                    .iter()
                    .find(|c| !referred.has_column(c))
                {
                    return Err(Error::DanglingForeignKey {
                        table: table.id.clone(),
                        foreign_key: fk.name.clone(),
                        referred: format!("{}.{}", fk.referred_table, missing),
                    });
                }
            }
        }
        Ok(())
    }

    /// Serialize the catalog to bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, Error> {
        rkyv::to_bytes::<rkyv::rancor::Error>(self)
            .map(|v| v.to_vec())
            .map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Deserialize a catalog from bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, Error> {
        rkyv::from_bytes::<Self, rkyv::rancor::Error>(&crate::codec::aligned(bytes))
            .map_err(|e| Error::Deserialization(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{ColumnDef, DataType};

    fn sample_catalog() -> Catalog {
        let users = TableDef::new("t_users")
            .with_column(ColumnDef::primary_key("id", DataType::BigInt))
            .with_column(ColumnDef::new("name", DataType::Text));
        let posts = TableDef::new("t_posts")
            .with_column(ColumnDef::primary_key("id", DataType::BigInt))
            .with_column(ColumnDef::new("author_id", DataType::BigInt))
            .with_foreign_key(ForeignKeyDef::new(
                "fk_posts_author",
                ["author_id"],
                "t_users",
                ["id"],
            ));

        let mut catalog = Catalog::new();
        catalog.add_table(users).unwrap();
        catalog.add_table(posts).unwrap();
        catalog
    }

    #[test]
    fn test_add_and_remove() {
        let mut catalog = sample_catalog();
        assert_eq!(catalog.len(), 2);

        let err = catalog.add_table(TableDef::new("t_users")).unwrap_err();
        assert!(matches!(err, Error::TableExists(_)));

        catalog.remove_table("t_posts").unwrap();
        assert!(!catalog.contains("t_posts"));
        assert!(matches!(
            catalog.remove_table("t_posts"),
            Err(Error::TableNotFound(_))
        ));
    }

    #[test]
    fn test_referencing() {
        let catalog = sample_catalog();
        let refs = catalog.referencing("t_users");
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].0.id, "t_posts");
        assert!(catalog.referencing("t_posts").is_empty());
    }

    #[test]
    fn test_validate_detects_dangling_keys() {
        let mut catalog = sample_catalog();
        assert!(catalog.validate().is_ok());

        catalog.remove_table("t_users").unwrap();
        assert!(matches!(
            catalog.validate(),
            Err(Error::DanglingForeignKey { .. })
        ));
    }

    #[test]
    fn test_validate_detects_missing_referred_column() {
        let mut catalog = sample_catalog();
        catalog.table_mut("t_users").unwrap().remove_column("id").unwrap();
        assert!(matches!(
            catalog.validate(),
            Err(Error::DanglingForeignKey { .. })
        ));
    }

    #[test]
    fn test_serialization() {
        let catalog = sample_catalog();
        let bytes = catalog.to_bytes().unwrap();
        let restored = Catalog::from_bytes(&bytes).unwrap();
        assert_eq!(restored, catalog);
    }
}

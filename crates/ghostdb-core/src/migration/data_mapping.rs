//! Per-table column derivations between table generations.
//!
//! A [`TableMapping`] says how each column of a destination table is computed
//! from one source table. Mappings chain: the source of one mapping may be the
//! destination of another, and [`DataMappings::resolve`] collapses a chain
//! into a single mapping by substitution.

use crate::backend::Row;
use crate::catalog::{Catalog, DataType};
use crate::error::Error;
use crate::value::Value;
use crate::versioning::VersionId;
use rkyv::{Archive, Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Where a derived value comes from.
#[derive(
    Debug, Clone, PartialEq, Archive, Serialize, Deserialize, serde::Serialize, serde::Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Source {
    /// A column of the source table.
    Column(String),
    /// A constant, typically a column default.
    Constant(Value),
}

/// How one destination column is computed: a source followed by casts.
#[derive(
    Debug, Clone, PartialEq, Archive, Serialize, Deserialize, serde::Serialize, serde::Deserialize,
)]
pub struct Derivation {
    /// Value source.
    pub source: Source,
    /// Type conversions applied in order.
    pub casts: Vec<DataType>,
}

impl Derivation {
    /// Copy a source column unchanged.
    pub fn column(name: impl Into<String>) -> Self {
        Self {
            source: Source::Column(name.into()),
            casts: Vec::new(),
        }
    }

    /// Use a constant.
    pub fn constant(value: Value) -> Self {
        Self {
            source: Source::Constant(value),
            casts: Vec::new(),
        }
    }

    /// Append a cast.
    pub fn with_cast(mut self, data_type: DataType) -> Self {
        self.casts.push(data_type);
        self
    }

    /// The source column, if the value comes from one.
    pub fn source_column(&self) -> Option<&str> {
        match &self.source {
            Source::Column(name) => Some(name),
            Source::Constant(_) => None,
        }
    }

    /// Replace this derivation's source column with how `inner` derives it.
    fn substitute(&self, inner: &TableMapping) -> Derivation {
        match &self.source {
            Source::Column(name) => {
                let mut derived = inner.derivation_for(name);
                derived.casts.extend(self.casts.iter().cloned());
                derived
            }
            Source::Constant(_) => self.clone(),
        }
    }

    /// Compute the value for a source row.
    pub fn evaluate(&self, row: &Row) -> Result<Value, Error> {
        let mut value = match &self.source {
            Source::Column(name) => row.get(name).cloned().unwrap_or(Value::Null),
            Source::Constant(value) => value.clone(),
        };
        for data_type in &self.casts {
            value = value.cast(data_type)?;
        }
        Ok(value)
    }
}

/// Column derivations from one source table into one destination table.
///
/// Destination columns without an explicit derivation copy the same-named
/// source column.
#[derive(
    Debug, Clone, PartialEq, Archive, Serialize, Deserialize, serde::Serialize, serde::Deserialize,
)]
pub struct TableMapping {
    /// Version the destination table belongs to.
    pub version: VersionId,
    /// Physical identifier of the source table.
    pub source_table: String,
    /// Physical identifier of the destination table.
    pub target_table: String,
    /// Explicit derivations by destination column.
    pub columns: BTreeMap<String, Derivation>,
    /// Source columns intentionally not carried over.
    pub dropped: BTreeSet<String>,
}

impl TableMapping {
    /// An identity mapping.
    pub fn identity(
        version: VersionId,
        source_table: impl Into<String>,
        target_table: impl Into<String>,
    ) -> Self {
        Self {
            version,
            source_table: source_table.into(),
            target_table: target_table.into(),
            columns: BTreeMap::new(),
            dropped: BTreeSet::new(),
        }
    }

    /// How a destination column is derived.
    pub fn derivation_for(&self, column: &str) -> Derivation {
        self.columns
            .get(column)
            .cloned()
            .unwrap_or_else(|| Derivation::column(column))
    }

    /// Collapse `inner` (A to B) followed by `outer` (B to C) into one
    /// mapping from A to C.
    pub fn compose(inner: &TableMapping, outer: &TableMapping) -> TableMapping {
        let names: BTreeSet<&String> = outer.columns.keys().chain(inner.columns.keys()).collect();
        let columns = names
            .into_iter()
            .map(|name| (name.clone(), outer.derivation_for(name).substitute(inner)))
            .collect();

        TableMapping {
            version: outer.version.clone(),
            source_table: inner.source_table.clone(),
            target_table: outer.target_table.clone(),
            columns,
            dropped: inner.dropped.union(&outer.dropped).cloned().collect(),
        }
    }
}

/// A collapsed mapping ready to be applied to rows.
#[derive(
    Debug, Clone, PartialEq, Archive, Serialize, Deserialize, serde::Serialize, serde::Deserialize,
)]
pub struct ResolvedMapping {
    /// Physical identifier of the table rows are read from.
    pub source_table: String,
    /// Physical identifier of the table rows are written to.
    pub target_table: String,
    /// Derivation of every destination column.
    pub columns: BTreeMap<String, Derivation>,
}

impl ResolvedMapping {
    /// Compute the destination row for a source row.
    pub fn apply(&self, row: &Row) -> Result<Row, Error> {
        self.columns
            .iter()
            .map(|(name, derivation)| Ok((name.clone(), derivation.evaluate(row)?)))
            .collect()
    }
}

/// Every table mapping, keyed by destination table.
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
pub struct DataMappings {
    tables: BTreeMap<String, TableMapping>,
}

impl DataMappings {
    /// Create an empty set of mappings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Begin an identity mapping from `source` into `target`.
    pub fn copy(&mut self, version: &VersionId, source: &str, target: &str) -> Result<(), Error> {
        if self.tables.contains_key(target) {
            return Err(Error::MappingExists(target.to_string()));
        }
        self.tables.insert(
            target.to_string(),
            TableMapping::identity(version.clone(), source, target),
        );
        Ok(())
    }

    /// Record that a source column is not carried into `target`.
    pub fn drop(&mut self, target: &str, column: &str) -> Result<(), Error> {
        let mapping = self.mapping_mut(target)?;
        mapping.columns.remove(column);
        mapping.dropped.insert(column.to_string());
        Ok(())
    }

    /// Set the derivation of a destination column.
    pub fn set(&mut self, target: &str, column: &str, derivation: Derivation) -> Result<(), Error> {
        self.mapping_mut(target)?
            .columns
            .insert(column.to_string(), derivation);
        Ok(())
    }

    /// Rename a destination column, keeping its derivation.
    pub fn rename(&mut self, target: &str, old: &str, new: &str) -> Result<(), Error> {
        let mapping = self.mapping_mut(target)?;
        let derivation = mapping.derivation_for(old);
        mapping.columns.remove(old);
        mapping.columns.insert(new.to_string(), derivation);
        Ok(())
    }

    /// Append a cast to a destination column's derivation.
    pub fn cast(&mut self, target: &str, column: &str, data_type: DataType) -> Result<(), Error> {
        let mapping = self.mapping_mut(target)?;
        let derivation = mapping.derivation_for(column).with_cast(data_type);
        mapping.columns.insert(column.to_string(), derivation);
        Ok(())
    }

    /// Add a mapping built elsewhere.
    pub fn insert(&mut self, mapping: TableMapping) -> Result<(), Error> {
        if self.tables.contains_key(&mapping.target_table) {
            return Err(Error::MappingExists(mapping.target_table));
        }
        self.tables.insert(mapping.target_table.clone(), mapping);
        Ok(())
    }

    /// Get the mapping into a destination table.
    pub fn get(&self, target: &str) -> Option<&TableMapping> {
        self.tables.get(target)
    }

    /// Check if a destination table has a mapping.
    pub fn contains(&self, target: &str) -> bool {
        self.tables.contains_key(target)
    }

    /// How a destination column is derived from its direct source.
    pub fn derivation_for(&self, target: &str, column: &str) -> Result<Derivation, Error> {
        Ok(self.mapping(target)?.derivation_for(column))
    }

    /// Iterate over all mappings.
    pub fn iter(&self) -> impl Iterator<Item = &TableMapping> {
        self.tables.values()
    }

    /// Remove the mapping into a destination table.
    pub fn remove(&mut self, target: &str) -> Option<TableMapping> {
        self.tables.remove(target)
    }

    /// Keep only mappings whose destination satisfies the predicate.
    pub fn retain(&mut self, mut keep: impl FnMut(&TableMapping) -> bool) {
        self.tables.retain(|_, mapping| keep(mapping));
    }

    /// Follow the chain of mappings into `target` back to the nearest source
    /// for which `stop` holds (or that has no mapping of its own), and
    /// collapse it into one mapping for the given destination columns.
    pub fn resolve<'a>(
        &self,
        target: &str,
        columns: impl IntoIterator<Item = &'a str>,
        stop: impl Fn(&str) -> bool,
    ) -> Result<ResolvedMapping, Error> {
        let mut collapsed = self.mapping(target)?.clone();
        let mut hops = 0;

        while !stop(&collapsed.source_table) {
            let Some(inner) = self.tables.get(&collapsed.source_table) else {
                break;
            };
            hops += 1;
            if hops > self.tables.len() {
                return Err(Error::InvalidData(format!(
                    "data mappings into {} form a cycle",
                    target
                )));
            }
            collapsed = TableMapping::compose(inner, &collapsed);
        }

        Ok(ResolvedMapping {
            source_table: collapsed.source_table.clone(),
            target_table: target.to_string(),
            columns: columns
                .into_iter()
                .map(|c| (c.to_string(), collapsed.derivation_for(c)))
                .collect(),
        })
    }

    /// Check that every column of `target` derives from columns that exist
    /// in its source table, through conversions that exist.
    ///
    /// Tables without a mapping (new tables) pass.
    pub fn verify(&self, target: &str, catalog: &Catalog) -> Result<(), Error> {
        let Some(mapping) = self.get(target) else {
            return Ok(());
        };
        let table = catalog.table(target)?;
        let source = catalog.table(&mapping.source_table)?;

        for column in &table.columns {
            let derivation = mapping.derivation_for(&column.name);
            let unmapped = |reason: String| Error::UnmappedColumn {
                table: target.to_string(),
                column: column.name.clone(),
                reason,
            };

            let mut current = match &derivation.source {
                Source::Column(name) => match source.column(name) {
                    Some(source_column) => Some(source_column.data_type.clone()),
                    None => {
                        return Err(unmapped(format!(
                            "source column {} does not exist in {}",
                            name, source.id
                        )))
                    }
                },
                Source::Constant(value) => {
                    if value.is_null() && !column.is_nullable() {
                        return Err(unmapped("NULL constant for a NOT NULL column".into()));
                    }
                    None
                }
            };

            for data_type in &derivation.casts {
                if let Some(from) = &current {
                    if !from.can_convert_to(data_type) {
                        return Err(unmapped(format!("no conversion from {} to {}", from, data_type)));
                    }
                }
                current = Some(data_type.clone());
            }

            if let Some(from) = &current {
                if !from.can_convert_to(&column.data_type) {
                    return Err(unmapped(format!(
                        "no conversion from {} to {}",
                        from, column.data_type
                    )));
                }
            }
        }
        Ok(())
    }

    /// Serialize the mappings to bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, Error> {
        rkyv::to_bytes::<rkyv::rancor::Error>(self)
            .map(|v| v.to_vec())
            .map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Deserialize mappings from bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, Error> {
        rkyv::from_bytes::<Self, rkyv::rancor::Error>(&crate::codec::aligned(bytes))
            .map_err(|e| Error::Deserialization(e.to_string()))
    }

    fn mapping(&self, target: &str) -> Result<&TableMapping, Error> {
        self.tables
            .get(target)
            .ok_or_else(|| Error::MappingNotFound(target.to_string()))
    }

    fn mapping_mut(&mut self, target: &str) -> Result<&mut TableMapping, Error> {
        self.tables
            .get_mut(target)
            .ok_or_else(|| Error::MappingNotFound(target.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{ColumnDef, ColumnHint, TableDef};

    fn v(id: &str) -> VersionId {
        VersionId::new(id)
    }

    #[test]
    fn test_untouched_columns_are_identity() {
        let mut mappings = DataMappings::new();
        mappings.copy(&v("v1"), "t0", "t1").unwrap();

        assert_eq!(
            mappings.derivation_for("t1", "name").unwrap(),
            Derivation::column("name")
        );
        assert!(matches!(
            mappings.copy(&v("v1"), "t0", "t1"),
            Err(Error::MappingExists(_))
        ));
        assert!(matches!(
            mappings.drop("t9", "x"),
            Err(Error::MappingNotFound(_))
        ));
    }

    #[test]
    fn test_rename_then_cast() {
        let mut mappings = DataMappings::new();
        mappings.copy(&v("v1"), "t0", "t1").unwrap();
        mappings.rename("t1", "age", "years").unwrap();
        mappings.cast("t1", "years", DataType::Text).unwrap();

        assert_eq!(
            mappings.derivation_for("t1", "years").unwrap(),
            Derivation::column("age").with_cast(DataType::Text)
        );
        assert!(!mappings.get("t1").unwrap().columns.contains_key("age"));
    }

    #[test]
    fn test_resolve_composes_chain() {
        let mut mappings = DataMappings::new();
        mappings.copy(&v("v1"), "t0", "t1").unwrap();
        mappings.rename("t1", "a", "b").unwrap();
        mappings
            .set("t1", "flag", Derivation::constant(Value::Bool(false)))
            .unwrap();
        mappings.copy(&v("v2"), "t1", "t2").unwrap();
        mappings.rename("t2", "b", "c").unwrap();
        mappings.cast("t2", "c", DataType::Text).unwrap();

        let resolved = mappings
            .resolve("t2", ["id", "c", "flag"], |t| t == "t0")
            .unwrap();
        assert_eq!(resolved.source_table, "t0");
        assert_eq!(resolved.columns["id"], Derivation::column("id"));
        assert_eq!(
            resolved.columns["c"],
            Derivation::column("a").with_cast(DataType::Text)
        );
        assert_eq!(
            resolved.columns["flag"],
            Derivation::constant(Value::Bool(false))
        );

        let row = Row::new().with("id", 1i64).with("a", 5i64);
        let out = resolved.apply(&row).unwrap();
        assert_eq!(out.get("c"), Some(&Value::String("5".into())));
        assert_eq!(out.get("flag"), Some(&Value::Bool(false)));

        let one_hop = mappings.resolve("t2", ["c"], |t| t == "t1").unwrap();
        assert_eq!(one_hop.source_table, "t1");
        assert_eq!(
            one_hop.columns["c"],
            Derivation::column("b").with_cast(DataType::Text)
        );
    }

    #[test]
    fn test_composition_is_associative() {
        let mut a = TableMapping::identity(v("v1"), "t0", "t1");
        a.columns.insert("x".into(), Derivation::column("y").with_cast(DataType::BigInt));
        a.columns.insert("k".into(), Derivation::constant(Value::Int(3)));

        let mut b = TableMapping::identity(v("v2"), "t1", "t2");
        b.columns.insert("z".into(), Derivation::column("x").with_cast(DataType::Text));
        b.columns.insert("y".into(), Derivation::column("k"));

        let mut c = TableMapping::identity(v("v3"), "t2", "t3");
        c.columns.insert("w".into(), Derivation::column("z"));
        c.columns.insert("k".into(), Derivation::column("y").with_cast(DataType::Double));

        let left = TableMapping::compose(&TableMapping::compose(&a, &b), &c);
        let right = TableMapping::compose(&a, &TableMapping::compose(&b, &c));

        for column in ["w", "k", "x", "y", "z", "untouched"] {
            assert_eq!(
                left.derivation_for(column),
                right.derivation_for(column),
                "column {}",
                column
            );
        }
        assert_eq!(
            left.derivation_for("w"),
            Derivation::column("y")
                .with_cast(DataType::BigInt)
                .with_cast(DataType::Text)
        );
        assert_eq!(left.source_table, "t0");
        assert_eq!(left.target_table, "t3");
    }

    #[test]
    fn test_verify() {
        let mut catalog = Catalog::new();
        catalog
            .add_table(
                TableDef::new("t0")
                    .with_column(ColumnDef::primary_key("id", DataType::BigInt))
                    .with_column(ColumnDef::new("email", DataType::Text)),
            )
            .unwrap();
        catalog
            .add_table(
                TableDef::new("t1")
                    .with_column(ColumnDef::primary_key("id", DataType::BigInt))
                    .with_column(ColumnDef::new("mail", DataType::Text))
                    .with_column(
                        ColumnDef::new("active", DataType::Bool).with_hint(ColumnHint::NotNull),
                    ),
            )
            .unwrap();

        let mut mappings = DataMappings::new();
        mappings.copy(&v("v1"), "t0", "t1").unwrap();
        mappings
            .set("t1", "active", Derivation::constant(Value::Bool(true)))
            .unwrap();

        let err = mappings.verify("t1", &catalog).unwrap_err();
        assert!(matches!(err, Error::UnmappedColumn { ref column, .. } if column == "mail"));

        mappings.rename("t1", "email", "mail").unwrap();
        mappings.verify("t1", &catalog).unwrap();

        mappings
            .set("t1", "active", Derivation::constant(Value::Null))
            .unwrap();
        assert!(mappings.verify("t1", &catalog).is_err());

        assert!(mappings.verify("t0", &catalog).is_ok());
    }
}

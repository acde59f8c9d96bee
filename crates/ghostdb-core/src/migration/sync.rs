//! Keeping ghost tables in step with their sources while a migration runs.
//!
//! Synchronization has four steps:
//!
//! 1. **Install** a [`SyncRule`] per ghost table. From then on, every write
//!    to the source is forwarded to the ghost under the source's write lock.
//! 2. **Catch up** on the writes that landed between the start of the
//!    backfill and rule activation, by replaying the keys the change log
//!    recorded for the source tables.
//! 3. **Reconcile** with a full comparison pass that repairs any difference.
//! 4. **Verify** with a second comparison pass; any difference left is a
//!    divergence and fails the migration.

use super::data_mapping::{Derivation, ResolvedMapping};
use super::error::MigrationError;
use crate::backend::{DatabaseMigrator, Row};
use crate::catalog::TableDef;
use crate::error::Error;
use crate::value::{decode_key, encode_key};
use rkyv::{Archive, Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info, warn};

/// Forwarding of writes from a source table to a ghost table.
#[derive(
    Debug, Clone, PartialEq, Archive, Serialize, Deserialize, serde::Serialize, serde::Deserialize,
)]
pub struct SyncRule {
    /// Migration that installed the rule.
    pub migration_id: [u8; 16],
    /// How target rows are computed from source rows.
    pub mapping: ResolvedMapping,
}

impl SyncRule {
    /// Create a rule for a resolved mapping.
    pub fn new(migration_id: [u8; 16], mapping: ResolvedMapping) -> Self {
        Self {
            migration_id,
            mapping,
        }
    }

    /// Physical identifier of the table writes come from.
    pub fn source_table(&self) -> &str {
        &self.mapping.source_table
    }

    /// Physical identifier of the table writes go to.
    pub fn target_table(&self) -> &str {
        &self.mapping.target_table
    }

    /// Compute the target row for a source row.
    pub fn map_row(&self, row: &Row) -> Result<Row, Error> {
        self.mapping.apply(row)
    }

    /// Compute the encoded target key for an encoded source key.
    ///
    /// Used when the source row is gone and only its key is known.
    pub fn target_key(
        &self,
        source: &TableDef,
        target: &TableDef,
        source_key: &[u8],
    ) -> Result<Vec<u8>, Error> {
        let values = decode_key(source_key)?;
        let source_pk = source.primary_key();
        if values.len() != source_pk.len() {
            return Err(Error::InvalidData(format!(
                "key with {} values does not match the primary key of {}",
                values.len(),
                source.id
            )));
        }
        let partial: Row = source_pk
            .into_iter()
            .map(String::from)
            .zip(values)
            .collect();

        let mut key = Vec::new();
        for column in target.primary_key() {
            let derivation = self.derivation(column);
            if let Some(name) = derivation.source_column() {
                if partial.get(name).is_none() {
                    return Err(Error::InvalidData(format!(
                        "primary key column {} of {} is not derived from the primary key of {}",
                        column, target.id, source.id
                    )));
                }
            }
            key.push(derivation.evaluate(&partial)?);
        }
        Ok(encode_key(&key))
    }

    /// Compute the encoded source key a target row was derived from.
    ///
    /// Returns `None` when the target key does not determine the source key.
    pub fn source_key(
        &self,
        source: &TableDef,
        target: &TableDef,
        target_row: &Row,
    ) -> Result<Option<Vec<u8>>, Error> {
        let target_pk = target.primary_key();
        let mut values = Vec::new();

        for column in source.primary_key() {
            let derived_from = target_pk
                .iter()
                .find(|t| self.derivation(t).source_column() == Some(column));
            let Some(value) = derived_from.and_then(|t| target_row.get(t)) else {
                return Ok(None);
            };
            let data_type = &source
                .column(column)
                .ok_or_else(|| Error::ColumnNotFound {
                    table: source.id.clone(),
                    column: column.to_string(),
                })?
                .data_type;
            values.push(value.cast(data_type)?);
        }
        Ok(Some(encode_key(&values)))
    }

    /// Serialize the rule to bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, Error> {
        rkyv::to_bytes::<rkyv::rancor::Error>(self)
            .map(|v| v.to_vec())
            .map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Deserialize a rule from bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, Error> {
        rkyv::from_bytes::<Self, rkyv::rancor::Error>(&crate::codec::aligned(bytes))
            .map_err(|e| Error::Deserialization(e.to_string()))
    }

    fn derivation(&self, column: &str) -> Derivation {
        self.mapping
            .columns
            .get(column)
            .cloned()
            .unwrap_or_else(|| Derivation::column(column))
    }
}

/// Outcome of synchronizing a set of ghost tables.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct SyncReport {
    /// Change-log position at which the last rule became active.
    pub activation_lsn: u64,
    /// Distinct source keys replayed from the change log.
    pub replayed_keys: u64,
    /// Target rows changed by the replay.
    pub reconciled: u64,
    /// Differences repaired by the comparison pass.
    pub repaired: u64,
}

/// Drives the synchronization steps through a [`DatabaseMigrator`].
pub struct Synchronizer<'a, M: DatabaseMigrator> {
    migrator: &'a M,
    cancel: &'a AtomicBool,
}

impl<'a, M: DatabaseMigrator> Synchronizer<'a, M> {
    /// Create a synchronizer observing a cancellation flag.
    pub fn new(migrator: &'a M, cancel: &'a AtomicBool) -> Self {
        Self { migrator, cancel }
    }

    /// Run every step for `rules`, replaying changes after `sync_start_lsn`.
    pub fn run(&self, rules: &[SyncRule], sync_start_lsn: u64) -> Result<SyncReport, MigrationError> {
        if rules.is_empty() {
            return Ok(SyncReport {
                activation_lsn: self
                    .migrator
                    .current_lsn()
                    .map_err(|e| MigrationError::backend("synchronizing", e))?,
                ..SyncReport::default()
            });
        }

        let activation_lsn = self.install(rules)?;
        let (replayed_keys, reconciled) = self.catch_up(rules, sync_start_lsn, activation_lsn)?;
        let repaired = self.reconcile(rules)?;
        self.verify(rules)?;

        let report = SyncReport {
            activation_lsn,
            replayed_keys,
            reconciled,
            repaired,
        };
        info!(
            tables = rules.len(),
            activation_lsn,
            replayed_keys,
            reconciled,
            repaired,
            "ghost tables synchronized"
        );
        Ok(report)
    }

    /// Install every rule. Returns the highest activation position.
    pub fn install(&self, rules: &[SyncRule]) -> Result<u64, MigrationError> {
        let mut activation_lsn = 0;
        for rule in rules {
            self.check_cancelled()?;
            let lsn = self
                .migrator
                .install_sync_rule(rule)
                .map_err(|e| MigrationError::table("synchronizing", rule.target_table(), e))?;
            debug!(
                source = %rule.source_table(),
                target = %rule.target_table(),
                lsn,
                "sync rule installed"
            );
            activation_lsn = activation_lsn.max(lsn);
        }
        Ok(activation_lsn)
    }

    /// Replay the source keys changed in `after < lsn <= until`.
    ///
    /// Returns the number of distinct keys replayed and of target rows
    /// changed.
    pub fn catch_up(
        &self,
        rules: &[SyncRule],
        after: u64,
        until: u64,
    ) -> Result<(u64, u64), MigrationError> {
        self.check_cancelled()?;
        let sources: BTreeSet<String> = rules.iter().map(|r| r.source_table().to_string()).collect();
        let changes = self
            .migrator
            .changes_since(after, until, &sources)
            .map_err(|e| MigrationError::backend("synchronizing", e))?;

        let mut seen = BTreeSet::new();
        let mut reconciled = 0;
        for change in changes {
            if !seen.insert((change.table.clone(), change.key.clone())) {
                continue;
            }
            for rule in rules.iter().filter(|r| r.source_table() == change.table) {
                let changed = self
                    .migrator
                    .reconcile_key(rule, &change.key)
                    .map_err(|e| MigrationError::table("synchronizing", rule.target_table(), e))?;
                if changed {
                    reconciled += 1;
                }
            }
        }

        debug!(after, until, keys = seen.len(), reconciled, "change log replayed");
        Ok((seen.len() as u64, reconciled))
    }

    /// Compare every target with its source and repair differences.
    /// Returns the number of repairs.
    pub fn reconcile(&self, rules: &[SyncRule]) -> Result<u64, MigrationError> {
        let mut repaired = 0;
        for rule in rules {
            self.check_cancelled()?;
            let report = self
                .migrator
                .compare(rule, true)
                .map_err(|e| MigrationError::table("synchronizing", rule.target_table(), e))?;
            if report.repaired > 0 {
                warn!(
                    source = %rule.source_table(),
                    target = %rule.target_table(),
                    missing = report.missing,
                    extra = report.extra,
                    mismatched = report.mismatched,
                    "repaired differences after catch-up"
                );
            }
            repaired += report.repaired;
        }
        Ok(repaired)
    }

    /// Fail with a divergence if any target still differs from its source.
    pub fn verify(&self, rules: &[SyncRule]) -> Result<(), MigrationError> {
        for rule in rules {
            self.check_cancelled()?;
            let report = self
                .migrator
                .compare(rule, false)
                .map_err(|e| MigrationError::table("synchronizing", rule.target_table(), e))?;
            if !report.is_consistent() {
                return Err(MigrationError::Divergence {
                    table: rule.target_table().to_string(),
                    source_table: rule.source_table().to_string(),
                    mismatched: report.differences(),
                });
            }
        }
        Ok(())
    }

    fn check_cancelled(&self) -> Result<(), MigrationError> {
        if self.cancel.load(Ordering::SeqCst) {
            return Err(MigrationError::Cancelled {
                phase: "synchronizing".into(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{ColumnDef, DataType};
    use crate::value::Value;
    use std::collections::BTreeMap;

    fn tables() -> (TableDef, TableDef) {
        let source = TableDef::new("t_src")
            .with_column(ColumnDef::primary_key("id", DataType::BigInt))
            .with_column(ColumnDef::primary_key("region", DataType::Text))
            .with_column(ColumnDef::new("name", DataType::Text));
        let target = TableDef::new("t_dst")
            .with_column(ColumnDef::primary_key("id", DataType::Text))
            .with_column(ColumnDef::primary_key("zone", DataType::Text))
            .with_column(ColumnDef::new("label", DataType::Text));
        (source, target)
    }

    fn rule() -> SyncRule {
        let mut columns = BTreeMap::new();
        columns.insert("id".into(), Derivation::column("id").with_cast(DataType::Text));
        columns.insert("zone".into(), Derivation::column("region"));
        columns.insert("label".into(), Derivation::column("name"));
        SyncRule::new(
            [7; 16],
            ResolvedMapping {
                source_table: "t_src".into(),
                target_table: "t_dst".into(),
                columns,
            },
        )
    }

    #[test]
    fn test_map_row() {
        let row = Row::new().with("id", 4i64).with("region", "eu").with("name", "ada");
        let mapped = rule().map_row(&row).unwrap();
        assert_eq!(mapped.get("id"), Some(&Value::String("4".into())));
        assert_eq!(mapped.get("zone"), Some(&Value::String("eu".into())));
        assert_eq!(mapped.get("label"), Some(&Value::String("ada".into())));
    }

    #[test]
    fn test_keys_map_both_ways() {
        let (source, target) = tables();
        let rule = rule();
        let source_row = Row::new().with("id", 4i64).with("region", "eu").with("name", "ada");
        let source_key = source_row.key(&source).unwrap();

        let target_key = rule.target_key(&source, &target, &source_key).unwrap();
        let target_row = rule.map_row(&source_row).unwrap();
        assert_eq!(target_key, target_row.key(&target).unwrap());

        let back = rule.source_key(&source, &target, &target_row).unwrap();
        assert_eq!(back, Some(source_key));
    }

    #[test]
    fn test_target_key_needs_key_derivation() {
        let (source, target) = tables();
        let mut rule = rule();
        rule.mapping
            .columns
            .insert("zone".into(), Derivation::column("name"));

        let key = encode_key(&[Value::Int(1), Value::String("eu".into())]);
        assert!(rule.target_key(&source, &target, &key).is_err());

        let target_row = Row::new().with("id", "1").with("zone", "x");
        assert_eq!(rule.source_key(&source, &target, &target_row).unwrap(), None);
    }

    #[test]
    fn test_serialization() {
        let rule = rule();
        let restored = SyncRule::from_bytes(&rule.to_bytes().unwrap()).unwrap();
        assert_eq!(restored, rule);
    }
}

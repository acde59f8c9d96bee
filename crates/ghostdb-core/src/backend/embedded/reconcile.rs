//! Bringing a ghost table back in line with the table it is synchronized
//! from.
//!
//! Both operations read the source under its lock, so they never race with
//! the forwarding of a concurrent write to the same source row.

use super::write::RowWrite;
use super::Inner;
use crate::backend::ComparisonReport;
use crate::error::Error;
use crate::migration::SyncRule;
use std::collections::HashSet;
use tracing::debug;

impl Inner {
    /// Make the target row for one source key match the source row.
    pub(crate) fn reconcile_key(&self, rule: &SyncRule, source_key: &[u8]) -> Result<bool, Error> {
        let source = self.table(rule.source_table())?;
        let target = self.table(rule.target_table())?;

        let mut guards = vec![source.lock()];
        let write = match source.get(source_key)? {
            Some(row) => RowWrite::Upsert(rule.map_row(&row)?),
            None => RowWrite::Delete(rule.target_key(&source.def, &target.def, source_key)?),
        };
        self.write_locked(&target, write, &mut guards)
    }

    /// Compare a rule's target with its source.
    ///
    /// The source pass checks every source row against the target row it
    /// maps to. The target pass looks for target rows no source row maps
    /// to; each candidate is re-checked against the source under the
    /// source lock, since the row may have been inserted after the first
    /// pass read past it.
    pub(crate) fn compare(&self, rule: &SyncRule, repair: bool) -> Result<ComparisonReport, Error> {
        let source = self.table(rule.source_table())?;
        let target = self.table(rule.target_table())?;
        let mut report = ComparisonReport::default();
        let mut expected: HashSet<Vec<u8>> = HashSet::new();

        let source_keys = source
            .rows
            .iter()
            .keys()
            .map(|k| k.map(|k| k.to_vec()))
            .collect::<Result<Vec<_>, _>>()?;
        for key in source_keys {
            let mut guards = vec![source.lock()];
            let Some(row) = source.get(&key)? else {
                continue;
            };
            report.source_rows += 1;

            let desired = target.normalize(rule.map_row(&row)?)?;
            let target_key = desired.key(&target.def)?;
            match target.get(&target_key)? {
                None => report.missing += 1,
                Some(current) if current != desired => report.mismatched += 1,
                Some(_) => {
                    expected.insert(target_key);
                    continue;
                }
            }
            expected.insert(target_key);

            if repair && self.write_locked(&target, RowWrite::Upsert(desired), &mut guards)? {
                report.repaired += 1;
            }
        }

        let target_keys = target
            .rows
            .iter()
            .keys()
            .map(|k| k.map(|k| k.to_vec()))
            .collect::<Result<Vec<_>, _>>()?;
        for key in target_keys {
            if expected.contains(&key) {
                continue;
            }
            let mut guards = vec![source.lock()];
            let Some(row) = target.get(&key)? else {
                continue;
            };
            if let Some(source_key) = rule.source_key(&source.def, &target.def, &row)? {
                if source.get(&source_key)?.is_some() {
                    continue;
                }
            }
            report.extra += 1;

            if repair && self.write_locked(&target, RowWrite::Delete(key), &mut guards)? {
                report.repaired += 1;
            }
        }

        report.target_rows = target.rows.len() as u64;
        debug!(
            source = %rule.source_table(),
            target = %rule.target_table(),
            source_rows = report.source_rows,
            target_rows = report.target_rows,
            missing = report.missing,
            extra = report.extra,
            mismatched = report.mismatched,
            repaired = report.repaired,
            "tables compared"
        );
        Ok(report)
    }
}

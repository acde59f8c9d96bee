//! Backfill executor for migrations.
//!
//! Streams the rows of each source table through its collapsed mapping into
//! the ghost table, one batch per transaction. Tables are filled in parallel
//! by a bounded set of scoped worker threads.

use super::data_mapping::ResolvedMapping;
use super::error::MigrationError;
use crate::backend::DatabaseMigrator;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tracing::{debug, info};

/// Configuration for backfill execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackfillConfig {
    /// Number of rows per batch.
    pub batch_size: usize,
    /// Delay between batches in milliseconds (for yielding to writes).
    pub batch_delay_ms: u64,
    /// Maximum number of tables filled at the same time.
    pub max_concurrent_jobs: usize,
}

impl Default for BackfillConfig {
    fn default() -> Self {
        Self {
            batch_size: 1000,
            batch_delay_ms: 10,
            max_concurrent_jobs: 1,
        }
    }
}

impl BackfillConfig {
    /// Set the batch size.
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Set the delay between batches.
    pub fn with_batch_delay_ms(mut self, delay: u64) -> Self {
        self.batch_delay_ms = delay;
        self
    }

    /// Set the number of tables filled in parallel.
    pub fn with_max_concurrent_jobs(mut self, jobs: usize) -> Self {
        self.max_concurrent_jobs = jobs;
        self
    }
}

/// Progress of filling one table.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct BackfillProgress {
    /// Table rows are read from.
    pub source_table: String,
    /// Table rows are written to.
    pub target_table: String,
    /// Rows written so far.
    pub processed_count: u64,
    /// Rows in the source when the table was started.
    pub total_count: u64,
    /// Batches written so far.
    pub batches: u64,
    /// Encoded key of the last row read.
    pub last_key: Option<Vec<u8>>,
    /// Whether the source has been read to the end.
    pub completed: bool,
}

impl BackfillProgress {
    /// Create a new progress report.
    pub fn new(rule: &ResolvedMapping, total_count: u64) -> Self {
        Self {
            source_table: rule.source_table.clone(),
            target_table: rule.target_table.clone(),
            processed_count: 0,
            total_count,
            batches: 0,
            last_key: None,
            completed: false,
        }
    }

    /// Percentage complete.
    ///
    /// Rows inserted during the backfill can push this above 100.
    pub fn percent_complete(&self) -> f64 {
        if self.total_count == 0 {
            return 100.0;
        }
        (self.processed_count as f64 / self.total_count as f64) * 100.0
    }
}

/// Executor for backfill operations.
pub struct BackfillExecutor<'a, M: DatabaseMigrator> {
    migrator: &'a M,
    config: BackfillConfig,
    cancel: &'a AtomicBool,
}

impl<'a, M: DatabaseMigrator> BackfillExecutor<'a, M> {
    /// Create a new backfill executor.
    pub fn new(migrator: &'a M, config: BackfillConfig, cancel: &'a AtomicBool) -> Self {
        Self {
            migrator,
            config,
            cancel,
        }
    }

    /// Fill the target of every rule.
    ///
    /// `on_progress` is called after every batch, from the worker thread
    /// that wrote it. The first failure stops the remaining workers.
    pub fn execute<F>(
        &self,
        rules: &[ResolvedMapping],
        on_progress: F,
    ) -> Result<Vec<BackfillProgress>, MigrationError>
    where
        F: Fn(&BackfillProgress) + Sync,
    {
        if rules.is_empty() {
            return Ok(Vec::new());
        }

        let workers = self.config.max_concurrent_jobs.max(1).min(rules.len());
        let next = AtomicUsize::new(0);
        let stop = AtomicBool::new(false);
        let results: Mutex<Vec<Option<BackfillProgress>>> = Mutex::new(vec![None; rules.len()]);

        info!(tables = rules.len(), workers, batch_size = self.config.batch_size, "backfill started");

        let outcomes: Vec<Result<(), MigrationError>> = std::thread::scope(|s| {
            let mut joins = Vec::with_capacity(workers);
            for _ in 0..workers {
                let next = &next;
                let stop = &stop;
                let results = &results;
                let on_progress = &on_progress;
                joins.push(s.spawn(move || {
                    loop {
                        if stop.load(Ordering::SeqCst) {
                            return Ok(());
                        }
                        let index = next.fetch_add(1, Ordering::SeqCst);
                        let Some(rule) = rules.get(index) else {
                            return Ok(());
                        };
                        match self.fill(rule, stop, on_progress) {
                            Ok(progress) => results.lock()[index] = Some(progress),
                            Err(e) => {
                                stop.store(true, Ordering::SeqCst);
                                return Err(e);
                            }
                        }
                    }
                }));
            }
            joins
                .into_iter()
                .map(|join| {
                    join.join().unwrap_or_else(|_| {
                        Err(MigrationError::backend(
                            "backfilling",
                            crate::error::Error::InvalidData("backfill worker panicked".into()),
                        ))
                    })
                })
                .collect()
        });

        // A cancellation only wins when no worker failed for another reason.
        let mut cancelled = None;
        for outcome in outcomes {
            match outcome {
                Err(e) if e.is_cancelled() => cancelled = Some(e),
                Err(e) => return Err(e),
                Ok(()) => {}
            }
        }
        if let Some(e) = cancelled {
            return Err(e);
        }

        let progress: Vec<BackfillProgress> = results.into_inner().into_iter().flatten().collect();
        info!(
            tables = progress.len(),
            rows = progress.iter().map(|p| p.processed_count).sum::<u64>(),
            "backfill finished"
        );
        Ok(progress)
    }

    /// Copy every row of one source table into its target.
    fn fill<F>(
        &self,
        rule: &ResolvedMapping,
        stop: &AtomicBool,
        on_progress: &F,
    ) -> Result<BackfillProgress, MigrationError>
    where
        F: Fn(&BackfillProgress) + Sync,
    {
        let phase = "backfilling";
        let total = self
            .migrator
            .count_rows(&rule.source_table)
            .map_err(|e| MigrationError::table(phase, &rule.source_table, e))?;
        let mut progress = BackfillProgress::new(rule, total);
        let batch_size = self.config.batch_size.max(1);

        loop {
            if self.cancel.load(Ordering::SeqCst) {
                return Err(MigrationError::Cancelled {
                    phase: phase.into(),
                });
            }
            if stop.load(Ordering::SeqCst) {
                // Another table failed; its error is reported instead.
                return Ok(progress);
            }

            let batch = self
                .migrator
                .scan_batch(&rule.source_table, progress.last_key.as_deref(), batch_size)
                .map_err(|e| MigrationError::table(phase, &rule.source_table, e))?;
            let exhausted = batch.len() < batch_size;

            if let Some((key, _)) = batch.last() {
                progress.last_key = Some(key.clone());
            }
            let rows = batch
                .iter()
                .map(|(_, row)| rule.apply(row))
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| MigrationError::table(phase, &rule.target_table, e))?;

            if !rows.is_empty() {
                self.migrator
                    .write_batch(&rule.target_table, &rows)
                    .map_err(|e| MigrationError::table(phase, &rule.target_table, e))?;
                progress.processed_count += rows.len() as u64;
                progress.batches += 1;
            }

            if exhausted {
                progress.completed = true;
                on_progress(&progress);
                break;
            }
            on_progress(&progress);

            if self.config.batch_delay_ms > 0 {
                std::thread::sleep(Duration::from_millis(self.config.batch_delay_ms));
            }
        }

        debug!(
            source = %rule.source_table,
            target = %rule.target_table,
            rows = progress.processed_count,
            batches = progress.batches,
            "table backfilled"
        );
        Ok(progress)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn test_backfill_config_default() {
        let config = BackfillConfig::default();
        assert_eq!(config.batch_size, 1000);
        assert_eq!(config.batch_delay_ms, 10);
        assert_eq!(config.max_concurrent_jobs, 1);

        let config = config
            .with_batch_size(10)
            .with_batch_delay_ms(0)
            .with_max_concurrent_jobs(4);
        assert_eq!(config.batch_size, 10);
        assert_eq!(config.batch_delay_ms, 0);
        assert_eq!(config.max_concurrent_jobs, 4);
    }

    #[test]
    fn test_backfill_progress() {
        let rule = ResolvedMapping {
            source_table: "table_a".into(),
            target_table: "table_b".into(),
            columns: BTreeMap::new(),
        };
        let mut progress = BackfillProgress::new(&rule, 200);
        assert_eq!(progress.source_table, "table_a");
        assert_eq!(progress.percent_complete(), 0.0);

        progress.processed_count = 50;
        assert_eq!(progress.percent_complete(), 25.0);

        let empty = BackfillProgress::new(&rule, 0);
        assert_eq!(empty.percent_complete(), 100.0);
    }
}

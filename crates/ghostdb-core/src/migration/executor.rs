//! Migration executor - orchestrates the migration workflow.
//!
//! Runs a plan through mirroring, backfill, synchronization and cutover,
//! persisting progress at every phase transition.

use super::backfill::{BackfillConfig, BackfillExecutor, BackfillProgress};
use super::error::MigrationError;
use super::plan::{MigrationPlan, PlanReport};
use super::state::{MigrationState, MigrationStatus, StepProgress, StepStatus};
use super::sync::{SyncReport, SyncRule, Synchronizer};
use crate::backend::{Backend, DatabaseMigrator, TableCreator};
use crate::catalog::TableDef;
use crate::ids::migration_id_hex;
use crate::operation::SchemaOperation;
use crate::versioning::{State, VersionId};
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Migration executor configuration.
#[derive(Debug, Clone)]
pub struct MigrationConfig {
    /// Backfill configuration.
    pub backfill: BackfillConfig,
    /// Whether a failed migration drops the tables it created.
    pub teardown_on_failure: bool,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            backfill: BackfillConfig::default(),
            teardown_on_failure: true,
        }
    }
}

impl MigrationConfig {
    /// Set the backfill configuration.
    pub fn with_backfill(mut self, backfill: BackfillConfig) -> Self {
        self.backfill = backfill;
        self
    }

    /// Keep the created tables of a failed migration for inspection.
    pub fn keep_failed_tables(mut self) -> Self {
        self.teardown_on_failure = false;
        self
    }
}

/// Result of a completed migration.
#[derive(Debug, Clone, serde::Serialize)]
pub struct MigrationResult {
    /// Hex migration ID.
    pub migration_id: String,
    /// Source version.
    pub from: VersionId,
    /// Target version.
    pub to: VersionId,
    /// Final status.
    pub status: MigrationStatus,
    /// Versions committed by the migration.
    pub versions: Vec<VersionId>,
    /// Physical tables created.
    pub tables_created: Vec<String>,
    /// Backfill progress per filled table.
    pub backfill_progress: Vec<BackfillProgress>,
    /// Synchronization outcome.
    pub sync: SyncReport,
    /// Wall-clock duration.
    pub elapsed: Duration,
}

/// Requests cancellation of a running migration from another thread.
///
/// A cancellation requested while no migration runs applies to the next
/// one.
#[derive(Debug, Clone)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    /// Request cancellation.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Check if cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Whether cutover reached the committed state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Commit {
    Pending,
    Committed,
    /// Persisting failed and the stored state could not be read back.
    Unknown,
}

/// Migrates a backend between versions of its changelog.
pub struct Migrator<B: Backend> {
    backend: Arc<B>,
    config: MigrationConfig,
    /// Held for the whole of a migration or a cleanup.
    running: Mutex<()>,
    /// Serializes read-modify-write cycles on the committed state.
    state_lock: Mutex<()>,
    cancel: Arc<AtomicBool>,
    active: Mutex<Option<[u8; 16]>>,
}

impl<B: Backend> Migrator<B> {
    /// Create a migrator over a backend.
    pub fn new(backend: Arc<B>, config: MigrationConfig) -> Self {
        Self {
            backend,
            config,
            running: Mutex::new(()),
            state_lock: Mutex::new(()),
            cancel: Arc::new(AtomicBool::new(false)),
            active: Mutex::new(None),
        }
    }

    /// The backend.
    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }

    /// The configuration.
    pub fn config(&self) -> &MigrationConfig {
        &self.config
    }

    /// Handle to cancel the running migration.
    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle(Arc::clone(&self.cancel))
    }

    /// Register a new table at the current version and create it.
    ///
    /// Refused while a migration runs. Returns the physical identifier.
    pub fn create_table(&self, logical: &str, table: TableDef) -> Result<String, MigrationError> {
        let _running = self.try_start()?;
        let _state = self.state_lock.lock();

        let mut state = (*self.backend.snapshot()).clone();
        let id = state.create_table(logical, table)?;
        let def = state.catalog.table(&id)?;
        let creator = self.backend.table_creator();
        creator
            .create_table(def)
            .map_err(|e| MigrationError::table("creating", &id, e))?;

        if let Err(e) = self.backend.persist_state(&state) {
            if let Err(drop_err) = creator.drop_table(&id) {
                warn!(table = %id, error = %drop_err, "failed to drop table after persist error");
            }
            return Err(MigrationError::backend("creating", e));
        }

        info!(table = %logical, id = %id, version = %state.current, "table created");
        Ok(id)
    }

    /// Append a change-set after the last added version.
    pub fn add_change_set(
        &self,
        author: &str,
        description: &str,
        operations: Vec<SchemaOperation>,
    ) -> Result<VersionId, MigrationError> {
        self.update_state(|state| {
            Ok(state
                .changelog
                .add_change_set(author, description, operations)
                .id
                .clone())
        })
    }

    /// Append a change-set after `parent`.
    pub fn add_change_set_after(
        &self,
        parent: &VersionId,
        author: &str,
        description: &str,
        operations: Vec<SchemaOperation>,
    ) -> Result<VersionId, MigrationError> {
        self.update_state(|state| {
            Ok(state
                .changelog
                .add_change_set_after(parent, author, description, operations)?
                .id
                .clone())
        })
    }

    /// Plan a migration without running it.
    pub fn plan(&self, from: &VersionId, to: &VersionId) -> Result<MigrationPlan, MigrationError> {
        MigrationPlan::build(&self.backend.snapshot(), from, to)
    }

    /// Plan a migration and summarize it.
    pub fn plan_report(&self, from: &VersionId, to: &VersionId) -> Result<PlanReport, MigrationError> {
        Ok(self.plan(from, to)?.report())
    }

    /// Migrate from the current version to the last added one.
    pub fn migrate_to_latest(&self) -> Result<MigrationResult, MigrationError> {
        let snapshot = self.backend.snapshot();
        let to = snapshot.changelog.last_added().id.clone();
        self.migrate(&snapshot.current, &to)
    }

    /// Migrate from `from` to `to`.
    ///
    /// On failure the committed state stays at the source version and, if
    /// configured, every table the migration created is dropped.
    pub fn migrate(&self, from: &VersionId, to: &VersionId) -> Result<MigrationResult, MigrationError> {
        let _running = self.try_start()?;
        if let Some(store) = self.backend.state_store() {
            if let Some(active) = store.get_active()? {
                return Err(MigrationError::MigrationInProgress {
                    migration_id: active.migration_id,
                });
            }
        }

        let started = Instant::now();
        let plan = self.plan(from, to)?;
        let steps = plan
            .tables
            .iter()
            .map(|t| StepProgress::new(&t.table_id, t.source_table.clone()))
            .collect();
        let progress = Mutex::new(MigrationState::new(
            plan.id,
            from.as_str(),
            to.as_str(),
            steps,
        ));
        self.save(&progress.lock())?;

        *self.active.lock() = Some(plan.id);
        let mut commit = Commit::Pending;
        let outcome = self.run(&plan, &progress, &mut commit);
        *self.active.lock() = None;
        self.cancel.store(false, Ordering::SeqCst);

        match outcome {
            Ok((backfill_progress, sync)) => {
                self.finish(&plan, &progress, &sync);
                let result = MigrationResult {
                    migration_id: migration_id_hex(&plan.id),
                    from: from.clone(),
                    to: to.clone(),
                    status: progress.lock().status,
                    versions: plan.versions.clone(),
                    tables_created: plan.tables.iter().map(|t| t.table_id.clone()).collect(),
                    backfill_progress,
                    sync,
                    elapsed: started.elapsed(),
                };
                info!(
                    migration_id = %result.migration_id,
                    from = %from,
                    to = %to,
                    tables = result.tables_created.len(),
                    elapsed_ms = result.elapsed.as_millis() as u64,
                    "migration completed"
                );
                Ok(result)
            }
            Err(e) => {
                self.abort(&plan, &progress, &e, commit);
                Err(e)
            }
        }
    }

    /// Run every phase up to and including cutover.
    fn run(
        &self,
        plan: &MigrationPlan,
        progress: &Mutex<MigrationState>,
        commit: &mut Commit,
    ) -> Result<(Vec<BackfillProgress>, SyncReport), MigrationError> {
        let migrator = self.backend.migrator();

        self.advance(progress, MigrationStatus::Mirroring)?;
        let creator = self.backend.table_creator();
        for table in plan.creation_order()? {
            self.check_cancelled("mirroring")?;
            creator
                .create_table(table)
                .map_err(|e| MigrationError::table("mirroring", &table.id, e))?;
        }

        self.check_cancelled("backfilling")?;
        let sync_start_lsn = migrator
            .current_lsn()
            .map_err(|e| MigrationError::backend("backfilling", e))?;
        let backfill_rules = plan.backfill_rules()?;
        {
            let mut state = progress.lock();
            state.sync_start_lsn = Some(sync_start_lsn);
            for step in &mut state.step_progress {
                if backfill_rules.iter().any(|r| r.target_table == step.table_id) {
                    step.start();
                } else {
                    step.skip();
                }
            }
        }
        self.advance(progress, MigrationStatus::Backfilling)?;

        let executor = BackfillExecutor::new(migrator, self.config.backfill.clone(), &self.cancel);
        let backfill_progress = executor.execute(&backfill_rules, |p| {
            let mut state = progress.lock();
            if let Some(step) = state.step_mut(&p.target_table) {
                step.record(p);
            }
            if let Err(e) = self.save(&state) {
                warn!(table = %p.target_table, error = %e, "failed to save backfill progress");
            }
        })?;

        self.check_cancelled("synchronizing")?;
        self.advance(progress, MigrationStatus::Synchronizing)?;
        let rules = sync_rules(plan)?;
        let sync = Synchronizer::new(migrator, &self.cancel).run(&rules, sync_start_lsn)?;
        progress.lock().activation_lsn = Some(sync.activation_lsn);

        self.check_cancelled("cutting over")?;
        self.advance(progress, MigrationStatus::CuttingOver)?;
        let _state = self.state_lock.lock();
        let merged = plan.merge_into(&self.backend.snapshot())?;
        if let Err(e) = self.backend.persist_state(&merged) {
            // A failed flush can follow a successful write.
            *commit = match self.backend.load_state() {
                Ok(stored) if stored.current == plan.to => Commit::Committed,
                Ok(_) => Commit::Pending,
                Err(load_err) => {
                    error!(error = %load_err, "cannot read back state after failed cutover");
                    Commit::Unknown
                }
            };
            return Err(MigrationError::backend("cutting over", e));
        }
        *commit = Commit::Committed;

        Ok((backfill_progress, sync))
    }

    /// Record completion and trim the change log. Failures here are logged:
    /// the target state is already committed.
    fn finish(&self, plan: &MigrationPlan, progress: &Mutex<MigrationState>, sync: &SyncReport) {
        let mut state = progress.lock();
        if let Err(e) = state.complete() {
            warn!(error = %e, "failed to mark migration complete");
        }
        if let Err(e) = self.save(&state) {
            warn!(
                migration_id = %migration_id_hex(&plan.id),
                error = %e,
                "failed to save completed migration"
            );
        }
        drop(state);

        match self.backend.migrator().truncate_changes(sync.activation_lsn) {
            Ok(removed) => debug!(removed, before = sync.activation_lsn, "change log truncated"),
            Err(e) => warn!(error = %e, "failed to truncate change log"),
        }
    }

    /// Record a failure and tear down what the migration created.
    fn abort(
        &self,
        plan: &MigrationPlan,
        progress: &Mutex<MigrationState>,
        err: &MigrationError,
        commit: Commit,
    ) {
        let message = err.to_string();
        {
            let mut state = progress.lock();
            for step in &mut state.step_progress {
                if step.status == StepStatus::InProgress {
                    step.fail(message.clone());
                }
            }
            state.fail(message.clone());
            if let Err(e) = self.save(&state) {
                warn!(error = %e, "failed to save failed migration");
            }
        }

        if err.is_cancelled() {
            warn!(migration_id = %migration_id_hex(&plan.id), "migration cancelled");
        } else {
            error!(migration_id = %migration_id_hex(&plan.id), error = %message, "migration failed");
        }

        match commit {
            Commit::Committed => warn!("target state was committed, keeping created tables"),
            Commit::Unknown => error!(
                migration_id = %migration_id_hex(&plan.id),
                "commit state unknown, keeping created tables and sync rules"
            ),
            Commit::Pending => {
                self.uninstall_rules(plan);
                if self.config.teardown_on_failure {
                    self.teardown(plan);
                }
            }
        }
    }

    /// Stop forwarding source writes into the tables of an abandoned plan.
    fn uninstall_rules(&self, plan: &MigrationPlan) {
        let migrator = self.backend.migrator();
        let mut removed = 0;
        for table in &plan.tables {
            match migrator.uninstall_sync_rules(&table.table_id) {
                Ok(n) => removed += n,
                Err(e) => warn!(table = %table.table_id, error = %e, "failed to uninstall sync rules"),
            }
        }
        debug!(removed, "sync rules uninstalled");
    }

    /// Drop the tables a plan created, newest first.
    fn teardown(&self, plan: &MigrationPlan) {
        let creator = self.backend.table_creator();
        let mut dropped = 0;
        for table in plan.tables.iter().rev() {
            match creator.table_exists(&table.table_id) {
                Ok(true) => match creator.drop_table(&table.table_id) {
                    Ok(()) => dropped += 1,
                    Err(e) => warn!(table = %table.table_id, error = %e, "failed to drop table"),
                },
                Ok(false) => {}
                Err(e) => warn!(table = %table.table_id, error = %e, "failed to check table"),
            }
        }
        info!(dropped, "migration torn down");
    }

    /// Remove a version and drop the tables no other version uses.
    ///
    /// The changelog entry is kept. Returns the dropped table identifiers.
    pub fn drop_version(&self, version: &VersionId) -> Result<Vec<String>, MigrationError> {
        let _running = self.try_start()?;
        let dropped: Vec<String> = {
            let _state = self.state_lock.lock();
            let mut state = (*self.backend.snapshot()).clone();
            if *version == state.current {
                return Err(MigrationError::VersionInUse(version.to_string()));
            }

            let scope = state.ref_log.remove_scope(version)?;
            let dropped: Vec<String> = scope
                .tables
                .values()
                .filter(|id| !state.ref_log.references(id))
                .cloned()
                .collect::<BTreeSet<_>>()
                .into_iter()
                .collect();
            for id in &dropped {
                state.catalog.remove_table(id)?;
            }
            state.data_mappings.retain(|m| {
                !dropped.contains(&m.target_table) && !dropped.contains(&m.source_table)
            });
            state.catalog.validate()?;
            self.backend
                .persist_state(&state)
                .map_err(|e| MigrationError::backend("dropping version", e))?;
            dropped
        };

        let creator = self.backend.table_creator();
        for id in &dropped {
            creator
                .drop_table(id)
                .map_err(|e| MigrationError::table("dropping version", id, e))?;
        }
        info!(version = %version, tables = dropped.len(), "version dropped");
        Ok(dropped)
    }

    /// Persisted state of a migration.
    pub fn status(&self, migration_id: &[u8; 16]) -> Result<MigrationState, MigrationError> {
        let not_found = || MigrationError::MigrationNotFound {
            migration_id: *migration_id,
        };
        match self.backend.state_store() {
            Some(store) => store.load(migration_id)?.ok_or_else(not_found),
            None => Err(not_found()),
        }
    }

    /// Every persisted migration.
    pub fn list_migrations(&self) -> Result<Vec<MigrationState>, MigrationError> {
        match self.backend.state_store() {
            Some(store) => store.list(),
            None => Ok(Vec::new()),
        }
    }

    /// The migration currently running, if any.
    pub fn active_migration(&self) -> Result<Option<MigrationState>, MigrationError> {
        match self.backend.state_store() {
            Some(store) => store.get_active(),
            None => Ok(None),
        }
    }

    fn try_start(&self) -> Result<parking_lot::MutexGuard<'_, ()>, MigrationError> {
        self.running
            .try_lock()
            .ok_or_else(|| MigrationError::MigrationInProgress {
                migration_id: self.active.lock().unwrap_or_default(),
            })
    }

    fn update_state<T>(
        &self,
        update: impl FnOnce(&mut State) -> Result<T, MigrationError>,
    ) -> Result<T, MigrationError> {
        let _state = self.state_lock.lock();
        let mut state = (*self.backend.snapshot()).clone();
        let value = update(&mut state)?;
        self.backend
            .persist_state(&state)
            .map_err(|e| MigrationError::backend("saving state", e))?;
        Ok(value)
    }

    fn advance(
        &self,
        progress: &Mutex<MigrationState>,
        next: MigrationStatus,
    ) -> Result<(), MigrationError> {
        let mut state = progress.lock();
        state.advance(next)?;
        self.save(&state)?;
        info!(migration_id = %migration_id_hex(&state.migration_id), phase = %next, "migration phase");
        Ok(())
    }

    fn save(&self, state: &MigrationState) -> Result<(), MigrationError> {
        if let Some(store) = self.backend.state_store() {
            store.save(state)?;
        }
        Ok(())
    }

    fn check_cancelled(&self, phase: &str) -> Result<(), MigrationError> {
        if self.cancel.load(Ordering::SeqCst) {
            return Err(MigrationError::Cancelled {
                phase: phase.to_string(),
            });
        }
        Ok(())
    }
}

/// One rule per planned table with a mapping, from its direct source.
///
/// Older generations come first, so a rule's source is always synchronized
/// before the rule itself.
fn sync_rules(plan: &MigrationPlan) -> Result<Vec<SyncRule>, MigrationError> {
    let mut rules = Vec::new();
    for planned in &plan.tables {
        if !plan.data_mappings.contains(&planned.table_id) {
            continue;
        }
        let table = plan.catalog.table(&planned.table_id)?;
        let mapping = plan.data_mappings.resolve(
            &planned.table_id,
            table.columns.iter().map(|c| c.name.as_str()),
            |_| true,
        )?;
        rules.push(SyncRule::new(plan.id, mapping));
    }
    Ok(rules)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::embedded::SledBackend;
    use crate::backend::Connection;
    use crate::catalog::{ColumnDef, ColumnHint, DataType};
    use crate::operation::builder::*;
    use crate::value::Value;

    fn migrator() -> Migrator<SledBackend> {
        let backend = Arc::new(SledBackend::temporary().unwrap());
        Migrator::new(backend, MigrationConfig::default())
    }

    fn users() -> TableDef {
        TableDef::new("")
            .with_column(ColumnDef::primary_key("id", DataType::BigInt))
            .with_column(ColumnDef::new("name", DataType::Text))
    }

    #[test]
    fn test_config_builders() {
        let config = MigrationConfig::default()
            .with_backfill(BackfillConfig::default().with_batch_size(10))
            .keep_failed_tables();
        assert_eq!(config.backfill.batch_size, 10);
        assert!(!config.teardown_on_failure);
        assert!(MigrationConfig::default().teardown_on_failure);
    }

    #[test]
    fn test_cancel_handle() {
        let migrator = migrator();
        let handle = migrator.cancel_handle();
        assert!(!handle.is_cancelled());
        handle.cancel();
        assert!(migrator.cancel.load(Ordering::SeqCst));
    }

    #[test]
    fn test_sync_rules_are_one_hop() {
        let migrator = migrator();
        let users_id = migrator.create_table("users", users()).unwrap();
        migrator
            .add_change_set("dev", "a", vec![add_column("users", "a", DataType::Integer, Value::Null, &[])])
            .unwrap();
        let last = migrator
            .add_change_set("dev", "b", vec![add_column("users", "b", DataType::Integer, Value::Null, &[])])
            .unwrap();

        let snapshot = migrator.backend().snapshot();
        let plan = migrator.plan(&snapshot.current, &last).unwrap();
        let rules = sync_rules(&plan).unwrap();
        assert_eq!(rules.len(), 2);
        assert_eq!(rules[0].source_table(), users_id);
        assert_eq!(rules[1].source_table(), rules[0].target_table());

        let backfill = plan.backfill_rules().unwrap();
        assert!(backfill.iter().all(|r| r.source_table == users_id));
    }

    #[test]
    fn test_migrate_add_column() {
        let migrator = migrator();
        migrator.create_table("users", users()).unwrap();
        let root = migrator.backend().snapshot().current.clone();
        let conn = migrator.backend().connect(&root).unwrap();
        conn.insert("users", crate::backend::Row::new().with("id", 1i64).with("name", "ada"))
            .unwrap();

        let v1 = migrator
            .add_change_set(
                "dev",
                "activation flag",
                vec![add_column(
                    "users",
                    "active",
                    DataType::Bool,
                    Value::Bool(false),
                    &[ColumnHint::NotNull],
                )],
            )
            .unwrap();
        let result = migrator.migrate_to_latest().unwrap();
        assert_eq!(result.status, MigrationStatus::Completed);
        assert_eq!(result.to, v1);
        assert_eq!(migrator.backend().snapshot().current, v1);

        let row = migrator
            .backend()
            .connect(&v1)
            .unwrap()
            .get("users", &[Value::Int(1)])
            .unwrap()
            .unwrap();
        assert_eq!(row.get("active"), Some(&Value::Bool(false)));

        let state = migrator.status(&result_id(&result)).unwrap();
        assert_eq!(state.status, MigrationStatus::Completed);
        assert!(migrator.active_migration().unwrap().is_none());
        assert_eq!(migrator.list_migrations().unwrap().len(), 1);
    }

    #[test]
    fn test_migrate_without_changes() {
        let migrator = migrator();
        assert!(matches!(
            migrator.migrate_to_latest(),
            Err(MigrationError::NoChanges { .. })
        ));
    }

    #[test]
    fn test_drop_current_version_refused() {
        let migrator = migrator();
        let current = migrator.backend().snapshot().current.clone();
        assert!(matches!(
            migrator.drop_version(&current),
            Err(MigrationError::VersionInUse(_))
        ));
    }

    fn result_id(result: &MigrationResult) -> [u8; 16] {
        crate::ids::parse_migration_id(&result.migration_id).unwrap()
    }
}

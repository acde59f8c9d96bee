//! Persisted progress of migrations.
//!
//! Every migration writes its [`MigrationState`] at each phase change and
//! after every backfill batch, so `status` can report on a running migration
//! and a restarted process can tell which migrations were interrupted.

use super::backfill::BackfillProgress;
use super::error::MigrationError;
use crate::ids::current_timestamp;
use rkyv::{Archive, Deserialize, Serialize};
use std::fmt;

/// Phase of a migration.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Archive,
    Serialize,
    Deserialize,
    serde::Serialize,
    serde::Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum MigrationStatus {
    /// Building the plan in memory.
    Planning,
    /// Creating ghost and new tables.
    Mirroring,
    /// Copying existing rows into new tables.
    Backfilling,
    /// Installing sync rules, catching up and verifying.
    Synchronizing,
    /// Persisting the target state.
    CuttingOver,
    /// The target version is current.
    Completed,
    /// Aborted by an error or a cancellation.
    Failed,
}

impl MigrationStatus {
    /// Phases in the order a successful migration goes through them.
    const ORDER: [MigrationStatus; 6] = [
        MigrationStatus::Planning,
        MigrationStatus::Mirroring,
        MigrationStatus::Backfilling,
        MigrationStatus::Synchronizing,
        MigrationStatus::CuttingOver,
        MigrationStatus::Completed,
    ];

    /// Check if this status is final.
    pub fn is_terminal(&self) -> bool {
        matches!(self, MigrationStatus::Completed | MigrationStatus::Failed)
    }

    /// Check if a migration may move from this status to `next`.
    ///
    /// Phases only advance one at a time; any non-terminal phase may fail.
    pub fn can_transition_to(&self, next: MigrationStatus) -> bool {
        if next == MigrationStatus::Failed {
            return !self.is_terminal();
        }
        Self::ORDER
            .windows(2)
            .any(|pair| pair[0] == *self && pair[1] == next)
    }

    /// Lowercase name used in logs and reports.
    pub fn as_str(&self) -> &'static str {
        match self {
            MigrationStatus::Planning => "planning",
            MigrationStatus::Mirroring => "mirroring",
            MigrationStatus::Backfilling => "backfilling",
            MigrationStatus::Synchronizing => "synchronizing",
            MigrationStatus::CuttingOver => "cutting_over",
            MigrationStatus::Completed => "completed",
            MigrationStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for MigrationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Backfill status of one new table.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Archive,
    Serialize,
    Deserialize,
    serde::Serialize,
    serde::Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    /// Waiting for the backfill phase.
    Pending,
    /// Rows are being copied.
    InProgress,
    /// Every source row was copied.
    Complete,
    /// The copy failed or the migration aborted while it ran.
    Failed,
    /// Nothing to copy: the table is new and starts empty.
    Skipped,
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            StepStatus::Pending => "pending",
            StepStatus::InProgress => "in_progress",
            StepStatus::Complete => "complete",
            StepStatus::Failed => "failed",
            StepStatus::Skipped => "skipped",
        })
    }
}

/// Backfill progress of one new table.
#[derive(
    Debug, Clone, PartialEq, Archive, Serialize, Deserialize, serde::Serialize, serde::Deserialize,
)]
pub struct StepProgress {
    /// Physical identifier of the table being filled.
    pub table_id: String,
    /// Physical identifier of the table rows are read from, if any.
    pub source_table: Option<String>,
    pub status: StepStatus,
    /// Microseconds since epoch.
    pub started_at: Option<u64>,
    /// Microseconds since epoch.
    pub completed_at: Option<u64>,
    /// Rows copied so far.
    pub processed_count: u64,
    /// Rows in the source when the copy started.
    pub total_count: Option<u64>,
    /// Encoded primary key of the last copied row.
    pub last_key: Option<Vec<u8>>,
    pub error: Option<String>,
}

impl StepProgress {
    /// A pending step for `table_id`.
    pub fn new(table_id: impl Into<String>, source_table: Option<String>) -> Self {
        Self {
            table_id: table_id.into(),
            source_table,
            status: StepStatus::Pending,
            started_at: None,
            completed_at: None,
            processed_count: 0,
            total_count: None,
            last_key: None,
            error: None,
        }
    }

    /// Mark the step as started.
    pub fn start(&mut self) {
        self.status = StepStatus::InProgress;
        self.started_at = Some(current_timestamp());
    }

    /// Mark the step as having nothing to copy.
    pub fn skip(&mut self) {
        self.finish(StepStatus::Skipped);
    }

    pub fn complete(&mut self) {
        self.finish(StepStatus::Complete);
    }

    pub fn fail(&mut self, error: impl Into<String>) {
        self.error = Some(error.into());
        self.finish(StepStatus::Failed);
    }

    /// Take over the counters of a backfill report, completing the step
    /// once the source has been read to the end.
    pub fn record(&mut self, progress: &BackfillProgress) {
        self.processed_count = progress.processed_count;
        self.total_count = Some(progress.total_count);
        self.last_key = progress.last_key.clone();
        if progress.completed {
            self.complete();
        }
    }

    fn finish(&mut self, status: StepStatus) {
        self.status = status;
        self.completed_at = Some(current_timestamp());
    }
}

/// Persistent migration state.
#[derive(
    Debug, Clone, PartialEq, Archive, Serialize, Deserialize, serde::Serialize, serde::Deserialize,
)]
pub struct MigrationState {
    pub migration_id: [u8; 16],
    /// Source version.
    pub from_version: String,
    /// Target version.
    pub to_version: String,
    pub status: MigrationStatus,
    /// Microseconds since epoch.
    pub started_at: Option<u64>,
    /// Microseconds since epoch; set on reaching a terminal status.
    pub completed_at: Option<u64>,
    /// Why the migration failed.
    pub error: Option<String>,
    /// Change-log position when the backfill began.
    pub sync_start_lsn: Option<u64>,
    /// Change-log position when the last sync rule became active.
    pub activation_lsn: Option<u64>,
    /// One entry per planned table.
    pub step_progress: Vec<StepProgress>,
}

impl MigrationState {
    /// A migration in the planning phase.
    pub fn new(
        migration_id: [u8; 16],
        from_version: impl Into<String>,
        to_version: impl Into<String>,
        step_progress: Vec<StepProgress>,
    ) -> Self {
        Self {
            migration_id,
            from_version: from_version.into(),
            to_version: to_version.into(),
            status: MigrationStatus::Planning,
            started_at: Some(current_timestamp()),
            completed_at: None,
            error: None,
            sync_start_lsn: None,
            activation_lsn: None,
            step_progress,
        }
    }

    /// Move to the next phase.
    pub fn advance(&mut self, next: MigrationStatus) -> Result<(), MigrationError> {
        if !self.status.can_transition_to(next) {
            return Err(MigrationError::StateCorrupted {
                message: format!("illegal transition from {} to {}", self.status, next),
            });
        }
        self.status = next;
        if next.is_terminal() {
            self.completed_at = Some(current_timestamp());
        }
        Ok(())
    }

    pub fn complete(&mut self) -> Result<(), MigrationError> {
        self.advance(MigrationStatus::Completed)
    }

    /// Mark the migration as failed. Terminal states are left alone.
    pub fn fail(&mut self, error: impl Into<String>) {
        if self.is_terminal() {
            return;
        }
        self.status = MigrationStatus::Failed;
        self.completed_at = Some(current_timestamp());
        self.error = Some(error.into());
    }

    /// Progress entry of a table.
    pub fn step(&self, table_id: &str) -> Option<&StepProgress> {
        self.step_progress.iter().find(|s| s.table_id == table_id)
    }

    pub fn step_mut(&mut self, table_id: &str) -> Option<&mut StepProgress> {
        self.step_progress.iter_mut().find(|s| s.table_id == table_id)
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, MigrationError> {
        rkyv::to_bytes::<rkyv::rancor::Error>(self)
            .map(|v| v.to_vec())
            .map_err(|e| MigrationError::Serialization(e.to_string()))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, MigrationError> {
        rkyv::from_bytes::<Self, rkyv::rancor::Error>(&crate::codec::aligned(bytes))
            .map_err(|e| MigrationError::Deserialization(e.to_string()))
    }
}

/// Migration states keyed by migration ID in their own sled tree.
pub struct MigrationStateStore {
    tree: sled::Tree,
}

fn storage(e: sled::Error) -> MigrationError {
    MigrationError::Storage(e.into())
}

impl MigrationStateStore {
    /// Tree holding the states.
    pub const TREE_NAME: &'static str = "migration:state";

    pub fn open(db: &sled::Db) -> Result<Self, MigrationError> {
        let tree = db.open_tree(Self::TREE_NAME).map_err(storage)?;
        Ok(Self { tree })
    }

    /// Insert or replace a state.
    pub fn save(&self, state: &MigrationState) -> Result<(), MigrationError> {
        self.tree
            .insert(state.migration_id, state.to_bytes()?)
            .map_err(storage)?;
        Ok(())
    }

    pub fn load(&self, migration_id: &[u8; 16]) -> Result<Option<MigrationState>, MigrationError> {
        self.tree
            .get(migration_id)
            .map_err(storage)?
            .map(|bytes| MigrationState::from_bytes(&bytes))
            .transpose()
    }

    /// Every recorded migration, oldest first.
    pub fn list(&self) -> Result<Vec<MigrationState>, MigrationError> {
        let mut states = self
            .tree
            .iter()
            .values()
            .map(|value| MigrationState::from_bytes(&value.map_err(storage)?))
            .collect::<Result<Vec<_>, _>>()?;
        states.sort_by_key(|s| (s.started_at, s.migration_id));
        Ok(states)
    }

    /// The migration that has not reached a terminal status, if any.
    pub fn get_active(&self) -> Result<Option<MigrationState>, MigrationError> {
        Ok(self.list()?.into_iter().find(|s| !s.is_terminal()))
    }

    /// Mark every non-terminal migration as failed. Returns how many were.
    ///
    /// A migration that was running when the process stopped cannot be
    /// resumed.
    pub fn fail_interrupted(&self, reason: &str) -> Result<usize, MigrationError> {
        let mut count = 0;
        for mut state in self.list()? {
            if !state.is_terminal() {
                state.fail(reason);
                for step in &mut state.step_progress {
                    if step.status == StepStatus::InProgress {
                        step.fail(reason);
                    }
                }
                self.save(&state)?;
                count += 1;
            }
        }
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ID: [u8; 16] = [1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16];

    fn state() -> MigrationState {
        MigrationState::new(
            ID,
            "v_a",
            "v_b",
            vec![StepProgress::new("table_1", Some("table_0".into()))],
        )
    }

    #[test]
    fn test_phases_advance_in_order() {
        let mut state = state();
        assert_eq!(state.status, MigrationStatus::Planning);
        assert!(state.started_at.is_some());

        for next in [
            MigrationStatus::Mirroring,
            MigrationStatus::Backfilling,
            MigrationStatus::Synchronizing,
            MigrationStatus::CuttingOver,
        ] {
            state.advance(next).unwrap();
            assert!(!state.is_terminal());
        }
        state.complete().unwrap();
        assert!(state.is_terminal());
        assert!(state.completed_at.is_some());
        assert_eq!(state.status.to_string(), "completed");
    }

    #[test]
    fn test_illegal_transitions() {
        let mut state = state();
        assert!(state.advance(MigrationStatus::Backfilling).is_err());
        assert!(state.complete().is_err());
        assert!(!MigrationStatus::Mirroring.can_transition_to(MigrationStatus::Planning));

        state.fail("boom");
        assert!(state.advance(MigrationStatus::Mirroring).is_err());
        assert!(!MigrationStatus::Completed.can_transition_to(MigrationStatus::Failed));
        assert!(MigrationStatus::CuttingOver.can_transition_to(MigrationStatus::Failed));
    }

    #[test]
    fn test_first_failure_wins() {
        let mut state = state();
        state.advance(MigrationStatus::Mirroring).unwrap();
        state.fail("table exists");
        state.fail("second failure");

        assert_eq!(state.status, MigrationStatus::Failed);
        assert_eq!(state.error.as_deref(), Some("table exists"));
    }

    #[test]
    fn test_step_records_backfill_progress() {
        let mut step = StepProgress::new("table_1", Some("table_0".into()));
        step.start();
        assert_eq!(step.status, StepStatus::InProgress);

        let mut progress = BackfillProgress {
            source_table: "table_0".into(),
            target_table: "table_1".into(),
            processed_count: 50,
            total_count: 100,
            batches: 1,
            last_key: Some(vec![1, 2]),
            completed: false,
        };
        step.record(&progress);
        assert_eq!(step.processed_count, 50);
        assert_eq!(step.total_count, Some(100));
        assert_eq!(step.status, StepStatus::InProgress);

        progress.processed_count = 100;
        progress.completed = true;
        step.record(&progress);
        assert_eq!(step.status, StepStatus::Complete);
        assert!(step.completed_at.is_some());

        let mut skipped = StepProgress::new("table_2", None);
        skipped.skip();
        assert_eq!(skipped.status.to_string(), "skipped");
    }

    #[test]
    fn test_bytes_round_trip() {
        let mut state = state();
        state.advance(MigrationStatus::Mirroring).unwrap();
        state.sync_start_lsn = Some(42);
        state.step_progress[0].fail("unique violation");

        let restored = MigrationState::from_bytes(&state.to_bytes().unwrap()).unwrap();
        assert_eq!(restored, state);
    }

    #[test]
    fn test_store() {
        let dir = tempfile::tempdir().unwrap();
        let db = sled::open(dir.path()).unwrap();
        let store = MigrationStateStore::open(&db).unwrap();
        assert!(store.list().unwrap().is_empty());

        let mut running = state();
        running.advance(MigrationStatus::Mirroring).unwrap();
        running.step_progress[0].start();
        store.save(&running).unwrap();

        let mut done = MigrationState::new([9; 16], "v_b", "v_c", vec![]);
        done.fail("cancelled");
        store.save(&done).unwrap();

        assert_eq!(store.load(&ID).unwrap().unwrap(), running);
        assert!(store.load(&[0; 16]).unwrap().is_none());
        assert_eq!(store.list().unwrap().len(), 2);
        assert_eq!(store.get_active().unwrap().unwrap().migration_id, ID);

        // A restart fails whatever was running.
        assert_eq!(store.fail_interrupted("restart").unwrap(), 1);
        assert!(store.get_active().unwrap().is_none());
        let failed = store.load(&ID).unwrap().unwrap();
        assert_eq!(failed.status, MigrationStatus::Failed);
        assert_eq!(failed.step_progress[0].status, StepStatus::Failed);
        assert_eq!(store.fail_interrupted("restart").unwrap(), 0);
    }
}

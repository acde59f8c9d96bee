//! Migration engine for GhostDB.
//!
//! A migration moves a database from one version of its changelog to a
//! later one without blocking writers:
//!
//! - **Planning** applies every change-set on the path to in-memory copies
//!   of the catalog, ref log and data mappings.
//! - **Mirroring** creates the ghost tables the plan needs, together with
//!   every table connected to them by foreign keys.
//! - **Backfilling** copies existing rows into the ghosts through their data
//!   mappings, in batches, in parallel across tables.
//! - **Synchronizing** forwards live writes to the ghosts, replays writes
//!   that landed during the backfill and verifies the result.
//! - **Cutting over** persists the new state in one step.
//!
//! # Example
//!
//! ```ignore
//! use ghostdb_core::backend::embedded::SledBackend;
//! use ghostdb_core::migration::{MigrationConfig, Migrator};
//! use ghostdb_core::operation::builder::add_column;
//!
//! let backend = Arc::new(SledBackend::temporary()?);
//! let migrator = Migrator::new(backend, MigrationConfig::default());
//!
//! migrator.add_change_set("alice", "activation flag", vec![
//!     add_column("users", "active", DataType::Bool, Value::Bool(false), &[ColumnHint::NotNull]),
//! ])?;
//! let result = migrator.migrate_to_latest()?;
//! println!("migrated to {} in {:?}", result.to, result.elapsed);
//! ```

pub mod backfill;
pub mod data_mapping;
pub mod error;
pub mod executor;
pub mod mirror;
pub mod migrators;
pub mod plan;
pub mod state;
pub mod sync;

// Data mapping types
pub use data_mapping::{DataMappings, Derivation, ResolvedMapping, Source, TableMapping};

// Error types
pub use error::MigrationError;

// Plan types
pub use plan::{
    MigrationPlan, OperationStage, PlanReport, PlannedStep, PlannedTable, TableOrigin,
};

// Mirroring
pub use mirror::TransitiveTableMirrorer;

// State types
pub use state::{MigrationState, MigrationStateStore, MigrationStatus, StepProgress, StepStatus};

// Backfill types
pub use backfill::{BackfillConfig, BackfillExecutor, BackfillProgress};

// Synchronization types
pub use sync::{SyncReport, SyncRule, Synchronizer};

// Executor types
pub use executor::{CancelHandle, MigrationConfig, MigrationResult, Migrator};

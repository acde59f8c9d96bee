//! GhostDB Core - versioned catalog and zero-downtime schema migrations.
//!
//! Schema changes are recorded as change-sets in a version graph. Migrating
//! to a new version never alters a live table: affected tables get ghost
//! copies that are filled, kept in sync with ongoing writes, and switched in
//! atomically.

pub mod backend;
pub mod catalog;
mod codec;
pub mod error;
pub mod ids;
pub mod migration;
pub mod operation;
pub mod value;
pub mod versioning;

pub use backend::embedded::{EmbeddedConfig, SledBackend};
pub use backend::{Backend, Connection, DatabaseMigrator, Row, TableCreator};
pub use catalog::{
    Catalog, ColumnDef, ColumnHint, ConstraintDef, DataType, ForeignKeyDef, IndexDef, TableDef,
};
pub use error::Error;
pub use migration::{
    BackfillConfig, MigrationConfig, MigrationError, MigrationPlan, MigrationResult,
    MigrationState, MigrationStatus, Migrator,
};
pub use operation::SchemaOperation;
pub use value::Value;
pub use versioning::{Changelog, RefLog, State, VersionId};

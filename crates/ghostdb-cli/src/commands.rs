//! Subcommand implementations.
//!
//! Each command opens the database, does its work through a [`Migrator`] and
//! returns the text to print. `demo` runs against a temporary database.

use crate::config::{CliConfig, Command};
use crate::error::CliError;
use crate::formatter::{create_formatter, Formatter};
use ghostdb_core::backend::{Backend, Connection, Row};
use ghostdb_core::catalog::{ColumnDef, ColumnHint, DataType, IndexDef, TableDef};
use ghostdb_core::ids::parse_migration_id;
use ghostdb_core::operation::builder::add_column;
use ghostdb_core::{Migrator, SchemaOperation, SledBackend, State, Value, VersionId};
use serde::Deserialize;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

/// A table definition in an `init --tables` file.
#[derive(Debug, Deserialize)]
pub struct TableFile {
    /// Logical table name.
    pub name: String,
    /// Columns; at least one must be a primary key column.
    pub columns: Vec<ColumnDef>,
    /// Secondary indexes.
    #[serde(default)]
    pub indexes: Vec<IndexDef>,
}

impl TableFile {
    fn into_table_def(self) -> (String, TableDef) {
        let mut table = TableDef::new("");
        table.columns = self.columns;
        table.indexes = self.indexes;
        (self.name, table)
    }
}

/// Run a subcommand and return its output.
pub fn run(config: &CliConfig, command: Command) -> Result<String, CliError> {
    let formatter = create_formatter(config.format);
    let backend = SledBackend::open(&config.storage)?;
    let migrator = Migrator::new(Arc::new(backend), config.migration.clone());
    let output = match command {
        Command::Init { tables } => init(&migrator, formatter.as_ref(), tables.as_deref())?,
        Command::Changelog => {
            let snapshot = migrator.backend().snapshot();
            formatter.format_changelog(&snapshot.changelog, &snapshot.current)
        }
        Command::AddChangeset {
            file,
            author,
            description,
            parent,
        } => {
            let operations: Vec<SchemaOperation> = read_json(&file, "operations")?;
            let version = match parent {
                Some(parent) => {
                    let parent = known_version(&migrator.backend().snapshot(), &parent)?;
                    migrator.add_change_set_after(&parent, &author, &description, operations)?
                }
                None => migrator.add_change_set(&author, &description, operations)?,
            };
            formatter.format_message(&format!("added version {}", version))
        }
        Command::Plan { from, to } => {
            let (from, to) = endpoints(&migrator.backend().snapshot(), from, to)?;
            formatter.format_plan(&migrator.plan_report(&from, &to)?)
        }
        Command::Migrate { from, to } => {
            let (from, to) = endpoints(&migrator.backend().snapshot(), from, to)?;
            let result = migrator.migrate(&from, &to)?;
            formatter.format_result(&result)
        }
        Command::Status { id } => match id {
            Some(id) => {
                let id = parse_migration_id(&id).ok_or(CliError::InvalidMigrationId(id))?;
                formatter.format_migrations(&[migrator.status(&id)?])
            }
            None => formatter.format_migrations(&migrator.list_migrations()?),
        },
        Command::DropVersion { version } => {
            let version = known_version(&migrator.backend().snapshot(), &version)?;
            let dropped = migrator.drop_version(&version)?;
            formatter.format_message(&format!(
                "dropped version {} and {} table(s): {}",
                version,
                dropped.len(),
                dropped.join(", ")
            ))
        }
        Command::Demo { rows } => {
            demo(SledBackend::temporary()?, config, formatter.as_ref(), rows)?
        }
    };

    migrator.backend().flush()?;
    Ok(output)
}

fn init(
    migrator: &Migrator<SledBackend>,
    formatter: &dyn Formatter,
    tables: Option<&Path>,
) -> Result<String, CliError> {
    let mut created = Vec::new();
    if let Some(path) = tables {
        let files: Vec<TableFile> = read_json(path, "table definitions")?;
        for file in files {
            let (name, table) = file.into_table_def();
            let id = migrator.create_table(&name, table)?;
            info!(table = %name, table_id = %id, "table created");
            created.push(name);
        }
    }

    let snapshot = migrator.backend().snapshot();
    Ok(formatter.format_message(&format!(
        "database ready at version {} ({} table(s) created{})",
        snapshot.current,
        created.len(),
        if created.is_empty() {
            String::new()
        } else {
            format!(": {}", created.join(", "))
        }
    )))
}

/// Fill a throwaway database, add a NOT NULL column and migrate while a
/// writer keeps inserting and updating at the old version.
fn demo(
    backend: SledBackend,
    config: &CliConfig,
    formatter: &dyn Formatter,
    rows: i64,
) -> Result<String, CliError> {
    let migrator = Migrator::new(Arc::new(backend), config.migration.clone());
    migrator.create_table(
        "users",
        TableDef::new("")
            .with_column(ColumnDef::primary_key("id", DataType::BigInt))
            .with_column(ColumnDef::new("name", DataType::Text))
            .with_column(ColumnDef::new("email", DataType::Text))
            .with_index(IndexDef::new("idx_users_email", ["email"]).unique()),
    )?;

    let root = migrator.backend().snapshot().current.clone();
    let conn = migrator.backend().connect(&root)?;
    for id in 1..=rows {
        conn.insert("users", demo_user(id))?;
    }
    info!(rows, "users filled");

    let target = migrator.add_change_set(
        "demo",
        "activation flag",
        vec![add_column(
            "users",
            "activated_account",
            DataType::Bool,
            Value::Bool(false),
            &[ColumnHint::NotNull],
        )],
    )?;

    let stop = AtomicBool::new(false);
    let writes = AtomicU64::new(0);
    let started = Instant::now();
    let result = std::thread::scope(|s| {
        s.spawn(|| {
            if let Err(e) = write_users(migrator.backend(), &root, rows, &stop, &writes) {
                warn!(error = %e, "demo writer stopped");
            }
        });
        let result = migrator.migrate(&root, &target);
        stop.store(true, Ordering::SeqCst);
        result
    })?;
    let elapsed = started.elapsed();

    let old_count = conn.count("users")?;
    let new_count = migrator.backend().connect(&target)?.count("users")?;
    info!(
        elapsed_ms = elapsed.as_millis() as u64,
        writes = writes.load(Ordering::SeqCst),
        old_count,
        new_count,
        "demo finished"
    );

    Ok(formatter.format_result(&result))
}

fn write_users(
    backend: &SledBackend,
    version: &VersionId,
    rows: i64,
    stop: &AtomicBool,
    writes: &AtomicU64,
) -> Result<(), CliError> {
    let conn = backend.connect(version)?;
    let mut next = rows + 1;
    while !stop.load(Ordering::SeqCst) {
        conn.insert("users", demo_user(next))?;
        let existing = 1 + next % rows.max(1);
        conn.update(
            "users",
            demo_user(existing).with("name", format!("user {} v{}", existing, next)),
        )?;
        next += 1;
        writes.fetch_add(2, Ordering::Relaxed);
    }
    Ok(())
}

fn demo_user(id: i64) -> Row {
    Row::new()
        .with("id", id)
        .with("name", format!("user {}", id))
        .with("email", format!("user{}@example.com", id))
}

fn read_json<T: serde::de::DeserializeOwned>(
    path: &Path,
    what: &'static str,
) -> Result<T, CliError> {
    let text = std::fs::read_to_string(path).map_err(|source| CliError::Io {
        path: path.display().to_string(),
        source,
    })?;
    serde_json::from_str(&text).map_err(|source| CliError::Json {
        what,
        path: path.display().to_string(),
        source,
    })
}

fn known_version(state: &State, id: &str) -> Result<VersionId, CliError> {
    let version = VersionId::from(id);
    if state.changelog.contains(&version) {
        Ok(version)
    } else {
        Err(CliError::UnknownVersion(id.to_string()))
    }
}

/// Resolve `--from` and `--to`, defaulting to the current and the last
/// added version.
fn endpoints(
    state: &State,
    from: Option<String>,
    to: Option<String>,
) -> Result<(VersionId, VersionId), CliError> {
    let from = match from {
        Some(id) => known_version(state, &id)?,
        None => state.current.clone(),
    };
    let to = match to {
        Some(id) => known_version(state, &id)?,
        None => state.changelog.last_added().id.clone(),
    };
    Ok((from, to))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Args;
    use clap::Parser;

    fn config(dir: &Path, extra: &[&str]) -> (CliConfig, Command) {
        let data = dir.join("db");
        let mut argv = vec!["ghostdb", "--data-path", data.to_str().unwrap(), "--format", "json"];
        argv.extend_from_slice(extra);
        Args::parse_from(argv).into_config()
    }

    fn exec(dir: &Path, extra: &[&str]) -> Result<serde_json::Value, CliError> {
        let (config, command) = config(dir, extra);
        let output = run(&config, command)?;
        Ok(serde_json::from_str(&output).unwrap())
    }

    #[test]
    fn test_init_add_changeset_and_migrate() {
        let dir = tempfile::tempdir().unwrap();
        let tables = dir.path().join("tables.json");
        std::fs::write(
            &tables,
            r#"[{"name": "users", "columns": [
                {"name": "id", "data_type": "big_int", "hints": ["PRIMARY_KEY"]},
                {"name": "email", "data_type": "text"}
            ]}]"#,
        )
        .unwrap();
        let ops = dir.path().join("ops.json");
        std::fs::write(
            &ops,
            r#"[{"op": "add_column", "table": "users", "column":
                {"name": "active", "data_type": "bool", "hints": ["NOT_NULL"], "default": {"bool": false}}}]"#,
        )
        .unwrap();

        let init = exec(dir.path(), &["init", "--tables", tables.to_str().unwrap()]).unwrap();
        assert!(init["message"].as_str().unwrap().contains("1 table(s) created"));

        let added = exec(dir.path(), &["add-changeset", "--file", ops.to_str().unwrap()]).unwrap();
        let version = added["message"]
            .as_str()
            .unwrap()
            .trim_start_matches("added version ")
            .to_string();

        let plan = exec(dir.path(), &["plan"]).unwrap();
        assert_eq!(plan["to"], version.as_str());
        assert_eq!(plan["tables"][&version].as_array().unwrap().len(), 1);

        let result = exec(dir.path(), &["migrate"]).unwrap();
        assert_eq!(result["status"], "completed");
        assert_eq!(result["to"], version.as_str());

        let changelog = exec(dir.path(), &["changelog"]).unwrap();
        assert_eq!(changelog["current"], version.as_str());

        let status = exec(dir.path(), &["status"]).unwrap();
        assert_eq!(status.as_array().unwrap().len(), 1);
        let id = status[0]["migration_id"].as_str().unwrap().to_string();
        let one = exec(dir.path(), &["status", &id]).unwrap();
        assert_eq!(one[0]["status"], "completed");
    }

    #[test]
    fn test_bad_inputs() {
        let dir = tempfile::tempdir().unwrap();
        let ops = dir.path().join("ops.json");
        std::fs::write(&ops, r#"[{"op": "explode"}]"#).unwrap();

        assert!(matches!(
            exec(dir.path(), &["add-changeset", "--file", ops.to_str().unwrap()]),
            Err(CliError::Json { .. })
        ));
        assert!(matches!(
            exec(dir.path(), &["add-changeset", "--file", "/nonexistent/ops.json"]),
            Err(CliError::Io { .. })
        ));
        assert!(matches!(
            exec(dir.path(), &["plan", "--to", "nope"]),
            Err(CliError::UnknownVersion(_))
        ));
        assert!(matches!(
            exec(dir.path(), &["status", "xyz"]),
            Err(CliError::InvalidMigrationId(_))
        ));
        assert!(matches!(
            exec(dir.path(), &["migrate"]),
            Err(CliError::Migration(_))
        ));
    }

    #[test]
    fn test_demo() {
        let dir = tempfile::tempdir().unwrap();
        let result = exec(dir.path(), &["--batch-size", "50", "demo", "--rows", "200"]).unwrap();
        assert_eq!(result["status"], "completed");
        assert_eq!(result["tables_created"].as_array().unwrap().len(), 1);
    }
}

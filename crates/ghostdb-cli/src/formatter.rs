//! Output formatters for command results.

use clap::ValueEnum;
use comfy_table::{Cell, Table};
use ghostdb_core::ids::migration_id_hex;
use ghostdb_core::migration::{MigrationResult, MigrationState, PlanReport};
use ghostdb_core::{Changelog, VersionId};

/// Output format for results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// ASCII table format
    Table,
    /// JSON format
    Json,
}

impl std::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OutputFormat::Table => write!(f, "table"),
            OutputFormat::Json => write!(f, "json"),
        }
    }
}

/// Trait for formatting output.
pub trait Formatter {
    /// Format the versions of a changelog.
    fn format_changelog(&self, changelog: &Changelog, current: &VersionId) -> String;

    /// Format a migration plan.
    fn format_plan(&self, plan: &PlanReport) -> String;

    /// Format a completed migration.
    fn format_result(&self, result: &MigrationResult) -> String;

    /// Format recorded migrations.
    fn format_migrations(&self, migrations: &[MigrationState]) -> String;

    /// Format a simple message.
    fn format_message(&self, message: &str) -> String;
}

/// Create a formatter for the given output format.
pub fn create_formatter(format: OutputFormat) -> Box<dyn Formatter> {
    match format {
        OutputFormat::Table => Box::new(TableFormatter),
        OutputFormat::Json => Box::new(JsonFormatter),
    }
}

/// Table formatter using comfy-table.
pub struct TableFormatter;

impl Formatter for TableFormatter {
    fn format_changelog(&self, changelog: &Changelog, current: &VersionId) -> String {
        let mut table = Table::new();
        table.set_header(vec!["", "Version", "Parent", "Author", "Description", "Operations"]);

        for version in changelog.versions() {
            let marker = if &version.id == current { "*" } else { "" };
            let (author, description) = match &version.change_set {
                Some(cs) => (cs.author.as_str(), cs.description.as_str()),
                None => ("", "root"),
            };
            let operations: Vec<String> =
                version.operations().iter().map(ToString::to_string).collect();
            table.add_row(vec![
                Cell::new(marker),
                Cell::new(&version.id),
                Cell::new(version.parent.as_ref().map(ToString::to_string).unwrap_or_default()),
                Cell::new(author),
                Cell::new(description),
                Cell::new(operations.join("\n")),
            ]);
        }

        table.to_string()
    }

    fn format_plan(&self, plan: &PlanReport) -> String {
        let mut output = format!(
            "Migration {} from {} to {}\n",
            plan.migration_id, plan.from, plan.to
        );
        for operation in &plan.operations {
            output.push_str(&format!("  {}\n", operation));
        }

        let mut table = Table::new();
        table.set_header(vec!["Version", "Table", "Physical", "Source", "Origin"]);
        for tables in plan.tables.values() {
            for t in tables {
                table.add_row(vec![
                    Cell::new(&t.version),
                    Cell::new(&t.logical),
                    Cell::new(&t.table_id),
                    Cell::new(t.source_table.as_deref().unwrap_or("-")),
                    Cell::new(format!("{:?}", t.origin)),
                ]);
            }
        }
        output.push_str(&table.to_string());
        output
    }

    fn format_result(&self, result: &MigrationResult) -> String {
        let mut table = Table::new();
        table.set_header(vec!["Source", "Target", "Rows copied", "Total"]);
        for progress in &result.backfill_progress {
            table.add_row(vec![
                Cell::new(&progress.source_table),
                Cell::new(&progress.target_table),
                Cell::new(progress.processed_count),
                Cell::new(progress.total_count),
            ]);
        }

        format!(
            "Migration {} {}: {} -> {} in {:.2?}\n\
             {} table(s) created, {} key(s) replayed, {} row(s) repaired\n{}",
            result.migration_id,
            result.status,
            result.from,
            result.to,
            result.elapsed,
            result.tables_created.len(),
            result.sync.replayed_keys,
            result.sync.repaired,
            table
        )
    }

    fn format_migrations(&self, migrations: &[MigrationState]) -> String {
        if migrations.is_empty() {
            return "No migrations".to_string();
        }

        let mut table = Table::new();
        table.set_header(vec!["ID", "From", "To", "Status", "Steps", "Error"]);
        for state in migrations {
            let steps: Vec<String> = state
                .step_progress
                .iter()
                .map(|s| format!("{} {} ({})", s.table_id, s.status, s.processed_count))
                .collect();
            table.add_row(vec![
                Cell::new(migration_id_hex(&state.migration_id)),
                Cell::new(&state.from_version),
                Cell::new(&state.to_version),
                Cell::new(state.status),
                Cell::new(steps.join("\n")),
                Cell::new(state.error.as_deref().unwrap_or("")),
            ]);
        }
        table.to_string()
    }

    fn format_message(&self, message: &str) -> String {
        message.to_string()
    }
}

/// JSON formatter.
pub struct JsonFormatter;

impl JsonFormatter {
    fn pretty<T: serde::Serialize + ?Sized>(value: &T) -> String {
        serde_json::to_string_pretty(value).unwrap_or_else(|e| {
            serde_json::json!({ "error": e.to_string() }).to_string()
        })
    }
}

impl Formatter for JsonFormatter {
    fn format_changelog(&self, changelog: &Changelog, current: &VersionId) -> String {
        let versions: Vec<_> = changelog.versions().collect();
        Self::pretty(&serde_json::json!({
            "current": current,
            "versions": versions,
        }))
    }

    fn format_plan(&self, plan: &PlanReport) -> String {
        Self::pretty(plan)
    }

    fn format_result(&self, result: &MigrationResult) -> String {
        Self::pretty(result)
    }

    fn format_migrations(&self, migrations: &[MigrationState]) -> String {
        let states: Vec<serde_json::Value> = migrations
            .iter()
            .map(|state| {
                serde_json::json!({
                    "migration_id": migration_id_hex(&state.migration_id),
                    "from": state.from_version,
                    "to": state.to_version,
                    "status": state.status,
                    "error": state.error,
                    "steps": state.step_progress,
                })
            })
            .collect();
        Self::pretty(&states)
    }

    fn format_message(&self, message: &str) -> String {
        serde_json::json!({ "message": message }).to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ghostdb_core::migration::MigrationStatus;
    use ghostdb_core::operation::builder::drop_column;

    fn changelog() -> Changelog {
        let mut changelog = Changelog::new();
        changelog.add_change_set("alice", "no email", vec![drop_column("users", "email")]);
        changelog
    }

    #[test]
    fn test_table_changelog_marks_current() {
        let changelog = changelog();
        let root = changelog.root().id.clone();
        let output = TableFormatter.format_changelog(&changelog, &root);
        assert!(output.contains("alice"));
        assert!(output.contains("no email"));
        assert!(output.contains('*'));
    }

    #[test]
    fn test_json_changelog() {
        let changelog = changelog();
        let last = changelog.last_added().id.clone();
        let output = JsonFormatter.format_changelog(&changelog, &last);
        let parsed: serde_json::Value = serde_json::from_str(&output).unwrap();
        assert_eq!(parsed["current"], serde_json::json!(last));
        assert_eq!(parsed["versions"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn test_migrations() {
        assert_eq!(TableFormatter.format_migrations(&[]), "No migrations");

        let mut state = MigrationState::new([7; 16], "a", "b", vec![]);
        state.fail("boom");
        let output = JsonFormatter.format_migrations(&[state]);
        let parsed: serde_json::Value = serde_json::from_str(&output).unwrap();
        assert_eq!(parsed[0]["migration_id"], "07".repeat(16));
        assert_eq!(parsed[0]["error"], "boom");
        assert_eq!(
            parsed[0]["status"],
            serde_json::to_value(MigrationStatus::Failed).unwrap()
        );
    }

    #[test]
    fn test_message() {
        assert_eq!(TableFormatter.format_message("done"), "done");
        assert_eq!(JsonFormatter.format_message("done"), r#"{"message":"done"}"#);
    }
}

//! Command-line arguments and the configuration derived from them.

use crate::formatter::OutputFormat;
use clap::{Parser, Subcommand};
use ghostdb_core::{BackfillConfig, EmbeddedConfig, MigrationConfig};
use std::path::PathBuf;

/// Default database directory.
pub const DEFAULT_DATA_PATH: &str = "./ghostdb_data";

/// Default page cache size in MB.
pub const DEFAULT_CACHE_MB: u64 = 256;

/// GhostDB zero-downtime schema migrations.
#[derive(Parser, Debug)]
#[command(name = "ghostdb")]
#[command(version, about = "GhostDB zero-downtime schema migrations")]
pub struct Args {
    /// Path to the database directory.
    #[arg(short = 'd', long, default_value = DEFAULT_DATA_PATH, global = true)]
    pub data_path: PathBuf,

    /// Output format.
    #[arg(long, default_value = "table", value_enum, global = true)]
    pub format: OutputFormat,

    /// Page cache size in MB.
    #[arg(long, default_value_t = DEFAULT_CACHE_MB, global = true)]
    pub cache_mb: u64,

    /// Rows copied per backfill batch.
    #[arg(long, default_value_t = 1000, global = true)]
    pub batch_size: usize,

    /// Pause between backfill batches in milliseconds.
    #[arg(long, default_value_t = 10, global = true)]
    pub batch_delay_ms: u64,

    /// Tables backfilled in parallel.
    #[arg(long, default_value_t = 1, global = true)]
    pub jobs: usize,

    /// Keep the tables of a failed migration instead of dropping them.
    #[arg(long, global = true)]
    pub keep_failed_tables: bool,

    #[command(subcommand)]
    pub command: Command,
}

/// Subcommands.
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Create the database, optionally with tables from a JSON file.
    Init {
        /// JSON list of `{"name", "columns", "indexes"}` table definitions.
        #[arg(long)]
        tables: Option<PathBuf>,
    },
    /// List the versions of the changelog.
    Changelog,
    /// Append a change-set read from a JSON list of operations.
    AddChangeset {
        /// File holding the operations.
        #[arg(long)]
        file: PathBuf,
        /// Author recorded on the change-set.
        #[arg(long, default_value = "ghostdb")]
        author: String,
        /// Description recorded on the change-set.
        #[arg(long, default_value = "")]
        description: String,
        /// Parent version; defaults to the last added version.
        #[arg(long)]
        parent: Option<String>,
    },
    /// Show what migrating between two versions would create.
    Plan {
        /// Source version; defaults to the current version.
        #[arg(long)]
        from: Option<String>,
        /// Target version; defaults to the last added version.
        #[arg(long)]
        to: Option<String>,
    },
    /// Migrate between two versions.
    Migrate {
        /// Source version; defaults to the current version.
        #[arg(long)]
        from: Option<String>,
        /// Target version; defaults to the last added version.
        #[arg(long)]
        to: Option<String>,
    },
    /// Show recorded migrations, or one migration by its hex ID.
    Status {
        /// Hex migration ID.
        id: Option<String>,
    },
    /// Remove a version and drop the tables only it uses.
    DropVersion {
        /// Version to drop.
        version: String,
    },
    /// Run an add-column migration against a live writer.
    Demo {
        /// Rows inserted before migrating.
        #[arg(long, default_value_t = 10_000)]
        rows: i64,
    },
}

/// Resolved CLI configuration.
#[derive(Debug, Clone)]
pub struct CliConfig {
    /// Database settings.
    pub storage: EmbeddedConfig,
    /// Migration settings.
    pub migration: MigrationConfig,
    /// Output format.
    pub format: OutputFormat,
}

impl Args {
    /// Convert parsed arguments into a configuration.
    pub fn into_config(self) -> (CliConfig, Command) {
        let storage = EmbeddedConfig::new(self.data_path)
            .with_cache_capacity(self.cache_mb * 1024 * 1024);

        let backfill = BackfillConfig::default()
            .with_batch_size(self.batch_size.max(1))
            .with_batch_delay_ms(self.batch_delay_ms)
            .with_max_concurrent_jobs(self.jobs.max(1));
        let mut migration = MigrationConfig::default().with_backfill(backfill);
        if self.keep_failed_tables {
            migration = migration.keep_failed_tables();
        }

        let config = CliConfig {
            storage,
            migration,
            format: self.format,
        };
        (config, self.command)
    }
}

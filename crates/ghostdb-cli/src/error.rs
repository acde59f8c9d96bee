//! CLI error type.

use ghostdb_core::{Error, MigrationError};
use thiserror::Error;

/// Errors reported by `ghostdb` subcommands.
#[derive(Debug, Error)]
pub enum CliError {
    /// Storage or catalog failure.
    #[error(transparent)]
    Core(#[from] Error),

    /// Migration failure.
    #[error(transparent)]
    Migration(#[from] MigrationError),

    /// Reading an input file failed.
    #[error("cannot read {path}: {source}")]
    Io {
        /// File being read.
        path: String,
        /// Underlying error.
        source: std::io::Error,
    },

    /// An input file is not valid JSON for what it should hold.
    #[error("invalid {what} in {path}: {source}")]
    Json {
        /// What the file should hold.
        what: &'static str,
        /// File being parsed.
        path: String,
        /// Underlying error.
        source: serde_json::Error,
    },

    /// A version argument names no version of the changelog.
    #[error("unknown version: {0}")]
    UnknownVersion(String),

    /// A migration ID argument is not 32 hex digits.
    #[error("invalid migration id: {0}")]
    InvalidMigrationId(String),
}

//! GhostDB command-line tool.

mod commands;
mod config;
mod error;
mod formatter;

use clap::Parser;
use config::Args;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[cfg(feature = "mimalloc")]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ghostdb=info,ghostdb_core=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let args = Args::parse();
    let (config, command) = args.into_config();

    tracing::debug!(
        data_path = %config.storage.path.display(),
        batch_size = config.migration.backfill.batch_size,
        jobs = config.migration.backfill.max_concurrent_jobs,
        "configuration loaded"
    );

    match commands::run(&config, command) {
        Ok(output) => println!("{}", output),
        Err(e) => {
            tracing::error!(error = %e, "command failed");
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    }
}

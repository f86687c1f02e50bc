//! Standalone entry point wiring a [`pool_supervisor::Supervisor`] around a
//! demonstration worker. Embedding applications are expected to call
//! `pool_supervisor::Supervisor` directly from their own binary with their
//! own [`pool_supervisor::worker::WorkerEntryPoint`]; this bin exists so the
//! crate is runnable and testable end to end on its own.

use clap::Parser;
use dusa_collection_utils::core::errors::ErrorArrayItem;
use dusa_collection_utils::core::logger::LogLevel;
use dusa_collection_utils::log;
use pool_supervisor::queue_group::QueueGroup;
use pool_supervisor::supervisor::Supervisor;
use pool_supervisor::worker::WorkerEntryPoint;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "pool-supervisord", about = "Forks, monitors and reaps a fleet of job-worker processes")]
struct Cli {
    /// Path to the resque-pool-style config file. Overrides `RESQUE_POOL_CONFIG`
    /// and the default discovery search if given.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Pool name used in the `[pool: <name>]` process title suffix.
    #[arg(long, default_value = "default")]
    pool_name: String,
}

/// A worker that does nothing but sleep; real embedders supply their own
/// job-polling logic here instead.
struct DemoWorker;

impl WorkerEntryPoint for DemoWorker {
    fn poll_once(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

fn run() -> Result<(), ErrorArrayItem> {
    let cli = Cli::parse();

    if let Some(path) = &cli.config {
        std::env::set_var("RESQUE_POOL_CONFIG", path);
    }

    let make_entry_point: pool_supervisor::supervisor::EntryPointFactory =
        Box::new(|_group: &QueueGroup| -> Box<dyn WorkerEntryPoint> { Box::new(DemoWorker) });

    let mut supervisor = Supervisor::new(cli.pool_name, make_entry_point)?;
    supervisor.start()?;
    log!(LogLevel::Info, "Supervisor started, entering main loop");
    supervisor.join();
    log!(LogLevel::Info, "Supervisor exited");
    Ok(())
}

fn main() {
    if let Err(e) = run() {
        log!(LogLevel::Error, "{}", e);
        std::process::exit(1);
    }
}

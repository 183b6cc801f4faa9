//! `vt run`: the long-running tracker fed by JSON lines on stdin.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::BufReader;

use super::util::acquire_lock;
use crate::Config;
use crate::protocol::load_roster;
use crate::service;

/// How long pending blocking reads may hold up process exit.
const RUNTIME_SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

pub fn run(config: &Config, roster: Option<&Path>) -> Result<()> {
    let _lock = acquire_lock(&config.lock_path())?;
    let roster = roster.map(load_roster).transpose()?.unwrap_or_default();
    tracing::debug!(members = roster.len(), "loaded roster");

    let runtime = tokio::runtime::Runtime::new().context("failed to initialize tokio runtime")?;
    let summary = runtime.block_on(service::serve(
        config,
        &roster,
        BufReader::new(tokio::io::stdin()),
        tokio::io::stdout(),
    ));
    // Stdin is read on a blocking thread that cannot be interrupted.
    runtime.shutdown_timeout(RUNTIME_SHUTDOWN_GRACE);

    let summary = summary?;
    tracing::info!(
        closed = summary.closed,
        close_failures = summary.close_failures,
        snapshot_saved = summary.snapshot_saved,
        "tracker stopped"
    );
    Ok(())
}

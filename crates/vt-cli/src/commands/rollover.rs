//! `vt rollover`: run one rollover pass by hand.

use std::io::Write;

use anyhow::Result;
use chrono::{DateTime, Utc};
use vt_core::{SnapshotStore, run_rollover};

use super::util::{acquire_lock, open_tracker};
use crate::Config;

pub fn run<W: Write>(writer: &mut W, config: &Config, now: DateTime<Utc>) -> Result<()> {
    let _lock = acquire_lock(&config.lock_path())?;
    let mut tracker = open_tracker(config)?;
    let snapshots = config.snapshot_file();
    let report = run_rollover(
        &mut tracker,
        snapshots.as_ref().map(|s| s as &dyn SnapshotStore),
        config.rollover_config(),
        now,
    );

    writeln!(writer, "Rollover complete")?;
    writeln!(
        writer,
        "Closed sessions: {} ({} failed)",
        report.closed, report.close_failures
    )?;
    match report.cutoff {
        Some(cutoff) => writeln!(
            writer,
            "Purged sessions: {} (started before {cutoff})",
            report.purged
        )?,
        None => writeln!(writer, "Purged sessions: {}", report.purged)?,
    }
    writeln!(
        writer,
        "Snapshot: {}",
        if report.snapshot_saved {
            "saved"
        } else {
            "not saved"
        }
    )?;
    for error in &report.errors {
        writeln!(writer, "Error: {error}")?;
    }
    Ok(())
}

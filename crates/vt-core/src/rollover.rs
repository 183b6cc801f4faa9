//! The daily rollover pass.
//!
//! The timer that triggers it lives in the host; this module is the pass
//! itself: force-close everything, sweep old history, persist a snapshot.

use chrono::{DateTime, NaiveDate, Utc};
use thiserror::Error;
use tracing::{info, warn};

use crate::calendar::Calendar;
use crate::store::{SessionStore, Snapshot, SnapshotError, SnapshotStore, StoreError};
use crate::tracker::Tracker;

/// Default number of days of closed sessions to keep.
pub const DEFAULT_RETENTION_DAYS: u32 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RolloverConfig {
    pub retention_days: u32,
}

impl Default for RolloverConfig {
    fn default() -> Self {
        Self {
            retention_days: DEFAULT_RETENTION_DAYS,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RolloverReport {
    pub closed: usize,
    pub close_failures: usize,
    /// Sessions that started before this date were eligible for deletion.
    pub cutoff: Option<NaiveDate>,
    pub purged: usize,
    pub snapshot_saved: bool,
    /// Failure message of the retention sweep or snapshot step, if any.
    pub errors: Vec<String>,
    /// Sessions the host reopened for still-connected members afterwards.
    pub reopened: usize,
}

/// Runs one rollover pass at `now`.
///
/// Every step runs even if an earlier one failed; failures are logged and
/// recorded in the report.
pub fn run_rollover<S: SessionStore>(
    tracker: &mut Tracker<S>,
    snapshots: Option<&dyn SnapshotStore>,
    config: RolloverConfig,
    now: DateTime<Utc>,
) -> RolloverReport {
    info!("starting daily rollover");
    let mut report = RolloverReport::default();

    let summary = tracker.close_everything(now);
    report.closed = summary.closed;
    report.close_failures = summary.failed;
    info!(closed = summary.closed, failed = summary.failed, "closed open sessions");

    let today = tracker.calendar().date_of(now);
    let cutoff = Calendar::retention_cutoff(today, config.retention_days);
    report.cutoff = Some(cutoff);
    match tracker.store_mut().delete_older_than(cutoff) {
        Ok(purged) => {
            report.purged = purged;
            info!(purged, cutoff = %cutoff, "purged old sessions");
        }
        Err(err) => {
            warn!(error = %err, "retention sweep failed");
            report.errors.push(format!("retention sweep: {err}"));
        }
    }

    if let Some(snapshots) = snapshots {
        match save_snapshot(tracker, snapshots, now) {
            Ok(()) => report.snapshot_saved = true,
            Err(err) => {
                warn!(error = %err, "failed to persist snapshot");
                report.errors.push(format!("snapshot: {err}"));
            }
        }
    }

    info!(at = %now, "daily rollover completed");
    report
}

#[derive(Debug, Error)]
pub enum PersistError {
    #[error("failed to export store: {0}")]
    Export(#[from] StoreError),
    #[error("failed to save snapshot: {0}")]
    Save(#[from] SnapshotError),
}

/// Exports the store and saves it as the latest snapshot.
pub fn save_snapshot<S: SessionStore>(
    tracker: &Tracker<S>,
    snapshots: &dyn SnapshotStore,
    now: DateTime<Utc>,
) -> Result<(), PersistError> {
    let contents = tracker.store().export()?;
    let sessions = contents.sessions.len();
    snapshots.save(&Snapshot::new(now, contents))?;
    tracing::debug!(sessions, "snapshot saved");
    Ok(())
}

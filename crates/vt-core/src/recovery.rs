//! Startup reconciliation after a restart or crash.
//!
//! Recovery runs once, before live events are processed:
//!
//! 1. Import the latest snapshot, skipping session ids the store already has.
//!    A snapshot that cannot be read or imported is reported and skipped.
//! 2. Rebuild the open-session table from the store. Duplicate open sessions
//!    for one member are closed at the start of the newest one.
//! 3. Close open sessions of members that are no longer connected, at the
//!    snapshot's export time. Without a usable export time the end is
//!    unknown: the session is closed with zero credit and reported as
//!    unresolved.
//! 4. Feed every connected member through the state machine, which keeps
//!    matching sessions running and opens missing ones.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use tracing::{error, info, warn};

use crate::model::{MemberKey, MemberState, SessionId};
use crate::store::{SessionStore, Snapshot, SnapshotStore, StoreError};
use crate::tracker::{Tracker, Transition};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Export time of the snapshot that was imported.
    pub snapshot_time: Option<DateTime<Utc>>,
    /// Why the snapshot could not be used.
    pub snapshot_error: Option<String>,
    pub imported: usize,
    pub skipped: usize,
    pub duplicates_closed: usize,
    /// Sessions of departed members closed at the snapshot time.
    pub stale_closed: usize,
    /// Sessions of departed members whose end could not be determined.
    pub unresolved: Vec<SessionId>,
    /// Sessions that were open before the restart and keep running.
    pub resumed: usize,
    pub opened: usize,
    pub switched: usize,
    pub failures: usize,
}

/// Runs startup recovery.
///
/// Only a store failure while listing open sessions is an error; a snapshot
/// that cannot be read or imported is recorded in the report and skipped.
pub fn recover<S: SessionStore>(
    tracker: &mut Tracker<S>,
    snapshots: Option<&dyn SnapshotStore>,
    roster: &[MemberState],
    now: DateTime<Utc>,
) -> Result<RecoveryReport, StoreError> {
    let mut report = RecoveryReport::default();

    if let Some(snapshot) = snapshots.and_then(|store| load_snapshot(store, &mut report)) {
        match tracker.store_mut().import(&snapshot.contents) {
            Ok(stats) => {
                report.snapshot_time = Some(snapshot.exported_at);
                report.imported = stats.sessions_imported;
                report.skipped = stats.sessions_skipped;
                info!(
                    exported_at = %snapshot.exported_at,
                    imported = stats.sessions_imported,
                    skipped = stats.sessions_skipped,
                    "imported snapshot"
                );
            }
            Err(err) => {
                error!(
                    exported_at = %snapshot.exported_at,
                    error = %err,
                    "snapshot could not be imported, starting without it"
                );
                report.snapshot_error = Some(err.to_string());
            }
        }
    }

    for duplicate in tracker.reload_open()? {
        let key = duplicate.key();
        let end = tracker
            .open_session(&key)
            .map_or(duplicate.start_time, |newest| newest.start_time);
        match tracker.close_detached(&duplicate, end) {
            Ok(_) => report.duplicates_closed += 1,
            Err(err) => {
                warn!(
                    session_id = %duplicate.id,
                    error = %err,
                    "failed to close duplicate session"
                );
                report.failures += 1;
            }
        }
    }

    let connected: HashSet<MemberKey> = roster
        .iter()
        .filter(|member| member.channel.is_some())
        .map(MemberState::key)
        .collect();
    close_departed(tracker, &connected, &mut report);

    let previously_open: HashSet<MemberKey> =
        tracker.open_sessions().map(|(key, _)| key.clone()).collect();
    for member in roster.iter().filter(|member| member.channel.is_some()) {
        match tracker.observe(member, now) {
            Ok(Transition::Unchanged) if previously_open.contains(&member.key()) => {
                report.resumed += 1;
            }
            Ok(Transition::Unchanged | Transition::Closed(_)) => {}
            Ok(Transition::Opened(_)) => report.opened += 1,
            Ok(Transition::Switched { .. }) => report.switched += 1,
            Err(err) => {
                warn!(
                    key = %member.key(),
                    error = %err,
                    "failed to reconcile connected member"
                );
                report.failures += 1;
            }
        }
    }

    info!(
        resumed = report.resumed,
        opened = report.opened,
        switched = report.switched,
        stale_closed = report.stale_closed,
        unresolved = report.unresolved.len(),
        "recovery finished"
    );
    Ok(report)
}

fn load_snapshot(store: &dyn SnapshotStore, report: &mut RecoveryReport) -> Option<Snapshot> {
    match store.load() {
        Ok(Some(snapshot)) => Some(snapshot),
        Ok(None) => {
            info!("no snapshot to import");
            None
        }
        Err(err) => {
            error!(
                error = %err,
                "snapshot unreadable, starting without it; history before it is lost"
            );
            report.snapshot_error = Some(err.to_string());
            None
        }
    }
}

fn close_departed<S: SessionStore>(
    tracker: &mut Tracker<S>,
    connected: &HashSet<MemberKey>,
    report: &mut RecoveryReport,
) {
    let departed: Vec<(MemberKey, SessionId, DateTime<Utc>)> = tracker
        .open_sessions()
        .filter(|(key, _)| !connected.contains(*key))
        .map(|(key, open)| (key.clone(), open.id, open.start_time))
        .collect();

    for (key, id, start_time) in departed {
        let known_end = report.snapshot_time.filter(|at| *at >= start_time);
        let end = known_end.unwrap_or(start_time);
        if let Err(err) = tracker.end_all(&key, end) {
            warn!(error = %err, "failed to close session of departed member");
            report.failures += 1;
            continue;
        }
        if known_end.is_some() {
            report.stale_closed += 1;
        } else {
            error!(
                user_id = %key.user_id,
                guild_id = %key.guild_id,
                session_id = %id,
                "member left while the tracker was down and no snapshot covers the session; \
                 closed without credit"
            );
            report.unresolved.push(id);
        }
    }
}

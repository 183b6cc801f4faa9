//! Status command for showing what the store holds.

use std::fmt::Write as _;
use std::io::Write;
use std::path::PathBuf;

use anyhow::Result;
use chrono::{DateTime, FixedOffset, NaiveTime, Utc};
use vt_core::SnapshotStore;
use vt_db::DbStats;

use crate::Config;

/// What `vt status` reports.
#[derive(Debug)]
pub struct StatusData {
    pub database: String,
    pub stats: DbStats,
    pub snapshot_path: Option<PathBuf>,
    pub snapshot: SnapshotState,
    pub timezone: String,
    pub offset: FixedOffset,
    pub rollover_at: NaiveTime,
}

#[derive(Debug)]
pub enum SnapshotState {
    Missing,
    Present {
        exported_at: DateTime<Utc>,
        sessions: usize,
    },
    Unreadable(String),
}

pub fn gather(config: &Config) -> Result<StatusData> {
    let db = config.open_database()?;
    let stats = db.stats()?;
    let snapshot_file = config.snapshot_file();
    let snapshot = match snapshot_file.as_ref().map(SnapshotStore::load) {
        None | Some(Ok(None)) => SnapshotState::Missing,
        Some(Ok(Some(snapshot))) => SnapshotState::Present {
            exported_at: snapshot.exported_at,
            sessions: snapshot.contents.sessions.len(),
        },
        Some(Err(err)) => SnapshotState::Unreadable(err.to_string()),
    };
    Ok(StatusData {
        database: config.database_path.display().to_string(),
        stats,
        snapshot_path: snapshot_file.map(|file| file.path().to_path_buf()),
        snapshot,
        timezone: iana_time_zone::get_timezone().unwrap_or_else(|_| "UTC".to_string()),
        offset: config.calendar()?.offset(),
        rollover_at: config.rollover_at()?,
    })
}

pub fn format_status(data: &StatusData) -> String {
    let mut output = String::new();
    let _ = writeln!(output, "Voice tracker status");
    let _ = writeln!(output, "Database: {}", data.database);
    let _ = writeln!(
        output,
        "Members: {} users in {} guilds, {} channels",
        data.stats.users, data.stats.guilds, data.stats.channels
    );
    let _ = writeln!(
        output,
        "Sessions: {} stored, {} open",
        data.stats.sessions, data.stats.open_sessions
    );
    match (&data.snapshot_path, &data.snapshot) {
        (None, _) => {
            let _ = writeln!(output, "Snapshot: disabled");
        }
        (Some(path), SnapshotState::Missing) => {
            let _ = writeln!(output, "Snapshot: none yet ({})", path.display());
        }
        (
            Some(path),
            SnapshotState::Present {
                exported_at,
                sessions,
            },
        ) => {
            let _ = writeln!(
                output,
                "Snapshot: {} ({sessions} sessions, taken {})",
                path.display(),
                exported_at.format("%Y-%m-%d %H:%M:%SZ")
            );
        }
        (Some(path), SnapshotState::Unreadable(err)) => {
            let _ = writeln!(output, "Snapshot: unreadable {} ({err})", path.display());
        }
    }
    let _ = writeln!(output, "Timezone: {} (UTC{})", data.timezone, data.offset);
    let _ = writeln!(
        output,
        "Daily rollover at {}",
        data.rollover_at.format("%H:%M")
    );
    output
}

pub fn run<W: Write>(writer: &mut W, config: &Config) -> Result<()> {
    let data = gather(config)?;
    write!(writer, "{}", format_status(&data))?;
    Ok(())
}

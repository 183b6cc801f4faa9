//! `vt snapshot export|import`.

use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use vt_core::{SessionStore, Snapshot, SnapshotStore};
use vt_db::SnapshotFile;

use super::util::acquire_lock;
use crate::Config;

fn resolve(config: &Config, path: Option<&Path>) -> Result<PathBuf> {
    path.map(Path::to_path_buf)
        .or_else(|| config.snapshot_path.clone())
        .context("no snapshot file given and no snapshot_path configured")
}

/// Writes the whole store to a snapshot file.
pub fn export<W: Write>(
    writer: &mut W,
    config: &Config,
    out: Option<&Path>,
    now: DateTime<Utc>,
) -> Result<()> {
    let path = resolve(config, out)?;
    let db = config.open_database()?;
    let contents = db.export().context("failed to export store")?;
    let sessions = contents.sessions.len();
    SnapshotFile::new(&path)
        .save(&Snapshot::new(now, contents))
        .with_context(|| format!("failed to write {}", path.display()))?;
    writeln!(writer, "Exported {sessions} sessions to {}", path.display())?;
    Ok(())
}

/// Loads a snapshot file into the store, skipping sessions it already has.
pub fn import<W: Write>(writer: &mut W, config: &Config, from: Option<&Path>) -> Result<()> {
    let path = resolve(config, from)?;
    let _lock = acquire_lock(&config.lock_path())?;
    let snapshot = SnapshotFile::new(&path)
        .load()
        .with_context(|| format!("failed to read {}", path.display()))?
        .with_context(|| format!("no snapshot at {}", path.display()))?;
    let mut db = config.open_database()?;
    let stats = db
        .import(&snapshot.contents)
        .context("failed to import snapshot")?;
    writeln!(
        writer,
        "Imported {} sessions, skipped {} already present (snapshot taken {})",
        stats.sessions_imported, stats.sessions_skipped, snapshot.exported_at
    )?;
    Ok(())
}

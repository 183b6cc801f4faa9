//! Shared utilities for CLI commands.

use std::fs::File;
use std::path::Path;
use std::sync::LazyLock;

use anyhow::{Context, Result};
use chrono::{Days, NaiveDate};
use fs2::FileExt;
use regex::Regex;
use vt_core::Tracker;
use vt_db::Database;

use crate::Config;

/// Pre-compiled regex for relative date parsing.
static RELATIVE_DATE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\d+)\s+(day|week)s?\s+ago$").unwrap());

/// Conservative bound for relative dates (~100 years in days).
const MAX_RELATIVE_DAYS: u64 = 100 * 366;

/// Parse a date as `YYYY-MM-DD` or relative to `today`.
///
/// Supports:
/// - ISO date: "2025-03-10"
/// - Keywords: "today", "yesterday"
/// - Relative: "3 days ago", "1 week ago"
pub fn parse_date(s: &str, today: NaiveDate) -> Result<NaiveDate> {
    let s = s.trim().to_lowercase();
    match s.as_str() {
        "today" => return Ok(today),
        "yesterday" => return today.pred_opt().context("date out of range"),
        _ => {}
    }

    if let Ok(date) = NaiveDate::parse_from_str(&s, "%Y-%m-%d") {
        return Ok(date);
    }

    let Some(caps) = RELATIVE_DATE_RE.captures(&s) else {
        anyhow::bail!(
            "Invalid date: {s}. Use YYYY-MM-DD, 'today', 'yesterday' or relative (e.g., '3 days ago')"
        );
    };

    let n: u64 = caps[1]
        .parse()
        .context("failed to parse number in relative date")?;
    let days = match &caps[2] {
        "day" => n,
        "week" => n.saturating_mul(7),
        unit => anyhow::bail!("Unknown date unit: {unit}"),
    };
    if days > MAX_RELATIVE_DAYS {
        anyhow::bail!("Relative date too far back: {s}");
    }
    today
        .checked_sub_days(Days::new(days))
        .context("date out of range")
}

/// Opens the store and loads its open sessions into a tracker.
pub fn open_tracker(config: &Config) -> Result<Tracker<Database>> {
    let db = config.open_database()?;
    Tracker::load(db, config.tracker_config()?).context("failed to load open sessions")
}

/// Takes the exclusive lock that keeps two writers off one store.
///
/// The lock is released when the returned file is dropped.
pub fn acquire_lock(path: &Path) -> Result<File> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).context("failed to create lock directory")?;
    }
    let lock_file = File::create(path).context("failed to create lock file")?;
    lock_file.try_lock_exclusive().with_context(|| {
        format!(
            "another vt process is using this store (lock held on {})",
            path.display()
        )
    })?;
    Ok(lock_file)
}

//! `vt open`: sessions currently open in the store.

use std::io::Write;

use anyhow::Result;
use chrono::{DateTime, Utc};

use super::report::format_open_sessions;
use super::util::open_tracker;
use crate::Config;
use crate::protocol::{OpenSessionView, Output};

pub fn run<W: Write>(
    writer: &mut W,
    config: &Config,
    json: bool,
    now: DateTime<Utc>,
) -> Result<()> {
    let tracker = open_tracker(config)?;
    let sessions: Vec<OpenSessionView> = tracker
        .open_sessions()
        .map(|(key, open)| OpenSessionView::new(key, open, tracker.live_elapsed(open, now)))
        .collect();
    if json {
        writeln!(writer, "{}", Output::OpenSessions { sessions }.to_line())?;
    } else {
        write!(writer, "{}", format_open_sessions(&sessions))?;
    }
    Ok(())
}

//! `vt leaderboard`: members of a guild ranked by time.

use std::io::Write;

use anyhow::Result;
use chrono::{DateTime, Utc};
use vt_core::{GuildId, LeaderboardEntry};

use super::report::format_leaderboard;
use super::util::open_tracker;
use crate::Config;
use crate::protocol::Output;

pub fn run<W: Write>(
    writer: &mut W,
    config: &Config,
    guild_id: &GuildId,
    days: u32,
    json: bool,
    now: DateTime<Utc>,
) -> Result<()> {
    let tracker = open_tracker(config)?;
    let board = tracker.leaderboard(guild_id, days, now)?;
    let days = board.days();
    let entries: Vec<LeaderboardEntry> = board.collect();
    tracing::debug!(guild_id = %guild_id, days, users = entries.len(), "computed leaderboard");

    if json {
        let output = Output::Leaderboard {
            guild_id: guild_id.clone(),
            days,
            entries,
        };
        writeln!(writer, "{}", output.to_line())?;
        return Ok(());
    }

    let guild_name = tracker
        .store()
        .guild_name(guild_id)?
        .unwrap_or_else(|| guild_id.to_string());
    write!(writer, "{}", format_leaderboard(&guild_name, days, &entries))?;
    Ok(())
}

//! `vt time`: one member's time on one day.

use std::io::Write;

use anyhow::Result;
use chrono::{DateTime, Utc};
use vt_core::{GuildId, MemberKey, UserId};

use super::report::format_time_report;
use super::util::{open_tracker, parse_date};
use crate::Config;
use crate::protocol::Output;

pub fn run<W: Write>(
    writer: &mut W,
    config: &Config,
    user_id: &UserId,
    guild_id: &GuildId,
    date: Option<&str>,
    json: bool,
    now: DateTime<Utc>,
) -> Result<()> {
    let tracker = open_tracker(config)?;
    let today = tracker.calendar().date_of(now);
    let date = date.map(|d| parse_date(d, today)).transpose()?.unwrap_or(today);
    let time = tracker.time_for(user_id, guild_id, date, now)?;
    tracing::debug!(user_id = %user_id, guild_id = %guild_id, %date, ?time, "computed time");

    if json {
        let output = Output::time(user_id.clone(), guild_id.clone(), date, time);
        writeln!(writer, "{}", output.to_line())?;
        return Ok(());
    }

    let name = tracker
        .store()
        .user_name(user_id)?
        .unwrap_or_else(|| user_id.to_string());
    let tracking = tracker
        .open_session(&MemberKey::new(user_id.clone(), guild_id.clone()))
        .filter(|open| open.start_date == date)
        .map(|open| open.classification);
    write!(writer, "{}", format_time_report(&name, date, &time, tracking))?;
    Ok(())
}

//! Human-readable rendering of time reports and leaderboards.

use std::fmt::Write;

use chrono::NaiveDate;
use vt_core::{Classification, LeaderboardEntry, TimeBreakdown};

use crate::protocol::OpenSessionView;

/// Number of users shown on a leaderboard.
pub const LEADERBOARD_SIZE: usize = 10;

const MEDALS: [&str; 3] = ["🥇", "🥈", "🥉"];

/// Formats seconds as `Xh Ym Zs`.
pub fn format_hms(seconds: i64) -> String {
    let seconds = seconds.max(0);
    format!(
        "{}h {}m {}s",
        seconds / 3600,
        (seconds % 3600) / 60,
        seconds % 60
    )
}

/// Formats seconds as `Xh Ym`, dropping the seconds.
pub fn format_hm(seconds: i64) -> String {
    let seconds = seconds.max(0);
    format!("{}h {}m", seconds / 3600, (seconds % 3600) / 60)
}

/// Daily time report for one member.
pub fn format_time_report(
    user_name: &str,
    date: NaiveDate,
    time: &TimeBreakdown,
    tracking: Option<Classification>,
) -> String {
    let mut output = String::new();
    let _ = writeln!(output, "Voice activity for {user_name} on {date}");
    let _ = writeln!(output, "  Active:   {}", format_hms(time.active));
    let _ = writeln!(output, "  Inactive: {}", format_hms(time.inactive));
    let _ = writeln!(output, "  Total:    {}", format_hms(time.total()));
    if let Some(classification) = tracking {
        let _ = writeln!(output, "Currently tracking ({classification})");
    }
    output
}

/// Leaderboard with the top [`LEADERBOARD_SIZE`] entries.
pub fn format_leaderboard(guild_name: &str, days: u32, entries: &[LeaderboardEntry]) -> String {
    let mut output = String::new();
    let _ = writeln!(output, "Voice activity leaderboard for {guild_name}");
    let _ = writeln!(
        output,
        "Past {days} {}",
        if days == 1 { "day" } else { "days" }
    );
    if entries.is_empty() {
        let _ = writeln!(output, "No voice activity recorded yet.");
        return output;
    }
    output.push('\n');
    for (i, entry) in entries.iter().take(LEADERBOARD_SIZE).enumerate() {
        let rank = MEDALS
            .get(i)
            .map_or_else(|| format!("{}.", i + 1), |medal| (*medal).to_string());
        let _ = writeln!(
            output,
            "{rank} {}: {}",
            entry.user_name,
            format_hm(entry.total_seconds)
        );
    }
    output
}

pub fn format_open_sessions(sessions: &[OpenSessionView]) -> String {
    let mut output = String::new();
    if sessions.is_empty() {
        let _ = writeln!(output, "No users are currently being tracked.");
        return output;
    }
    let _ = writeln!(output, "Currently tracking {} member(s):", sessions.len());
    for session in sessions {
        let _ = writeln!(
            output,
            "- {} in {}: {} for {} (session {}, since {})",
            session.user_id,
            session.guild_id,
            session.classification,
            format_hms(session.elapsed_seconds),
            session.session_id,
            session.start_time.format("%Y-%m-%d %H:%M:%SZ"),
        );
    }
    output
}

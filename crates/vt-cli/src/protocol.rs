//! Line protocol spoken by `vt run`.
//!
//! Every input line is one JSON object tagged by `type`. Member updates are
//! fire-and-forget; every other line gets exactly one JSON reply line.

use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use vt_core::{
    Classification, GuildId, LeaderboardEntry, MemberKey, MemberState, OpenSession, RolloverReport,
    SessionId, TimeBreakdown, UserId,
};

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Input {
    MemberUpdate(MemberState),
    Time {
        user_id: UserId,
        guild_id: GuildId,
        #[serde(default)]
        date: Option<NaiveDate>,
    },
    Leaderboard {
        guild_id: GuildId,
        #[serde(default)]
        days: Option<u32>,
    },
    OpenSessions,
    Rollover,
    Snapshot,
}

impl Input {
    pub fn parse(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Output {
    Time {
        user_id: UserId,
        guild_id: GuildId,
        date: NaiveDate,
        active_seconds: i64,
        inactive_seconds: i64,
        total_seconds: i64,
    },
    Leaderboard {
        guild_id: GuildId,
        days: u32,
        entries: Vec<LeaderboardEntry>,
    },
    OpenSessions {
        sessions: Vec<OpenSessionView>,
    },
    Rollover {
        closed: usize,
        close_failures: usize,
        purged: usize,
        snapshot_saved: bool,
        reopened: usize,
        errors: Vec<String>,
    },
    Snapshot {
        saved: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    Error {
        message: String,
    },
}

impl Output {
    pub fn time(user_id: UserId, guild_id: GuildId, date: NaiveDate, time: TimeBreakdown) -> Self {
        Self::Time {
            user_id,
            guild_id,
            date,
            active_seconds: time.active,
            inactive_seconds: time.inactive,
            total_seconds: time.total(),
        }
    }

    pub fn rollover(report: RolloverReport) -> Self {
        Self::Rollover {
            closed: report.closed,
            close_failures: report.close_failures,
            purged: report.purged,
            snapshot_saved: report.snapshot_saved,
            reopened: report.reopened,
            errors: report.errors,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }

    pub fn to_line(&self) -> String {
        // Serializing plain data with string keys cannot fail.
        serde_json::to_string(self).unwrap_or_else(|err| {
            format!(r#"{{"type":"error","message":"failed to encode reply: {err}"}}"#)
        })
    }
}

/// An open session as reported to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OpenSessionView {
    pub session_id: SessionId,
    pub user_id: UserId,
    pub guild_id: GuildId,
    pub classification: Classification,
    pub start_time: DateTime<Utc>,
    pub elapsed_seconds: i64,
}

impl OpenSessionView {
    pub fn new(key: &MemberKey, open: &OpenSession, elapsed_seconds: i64) -> Self {
        Self {
            session_id: open.id,
            user_id: key.user_id.clone(),
            guild_id: key.guild_id.clone(),
            classification: open.classification,
            start_time: open.start_time,
            elapsed_seconds,
        }
    }
}

/// Reads the connected-member roster used for startup recovery.
pub fn load_roster(path: &Path) -> Result<Vec<MemberState>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read roster {}", path.display()))?;
    serde_json::from_str(&content)
        .with_context(|| format!("failed to parse roster {}", path.display()))
}

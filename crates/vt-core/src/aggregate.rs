//! Read-side queries: per-day totals and guild leaderboards.
//!
//! Both combine closed-session sums from the store with the live elapsed
//! time of sessions that are still open, so a running session is counted
//! without being closed.

use std::collections::HashMap;

use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;

use crate::calendar::Calendar;
use crate::model::{Classification, GuildId, MemberKey, UserId};
use crate::store::{SessionStore, StoreError};
use crate::tracker::{OpenSession, Tracker};

/// Largest leaderboard window, in days.
pub const MAX_LEADERBOARD_DAYS: u32 = 30;

/// Seconds per classification for one member on one day.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TimeBreakdown {
    pub active: i64,
    pub inactive: i64,
}

impl TimeBreakdown {
    pub const fn total(&self) -> i64 {
        self.active + self.inactive
    }

    pub const fn get(&self, classification: Classification) -> i64 {
        match classification {
            Classification::Active => self.active,
            Classification::Inactive => self.inactive,
        }
    }

    const fn add(&mut self, classification: Classification, seconds: i64) {
        match classification {
            Classification::Active => self.active += seconds,
            Classification::Inactive => self.inactive += seconds,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LeaderboardEntry {
    pub user_id: UserId,
    pub user_name: String,
    pub total_seconds: i64,
}

/// Ranked totals for one leaderboard query.
///
/// Computed once per call; iterating consumes it.
#[derive(Debug)]
pub struct Leaderboard {
    days: u32,
    entries: std::vec::IntoIter<LeaderboardEntry>,
}

impl Leaderboard {
    /// Window length after clamping.
    pub const fn days(&self) -> u32 {
        self.days
    }
}

impl Iterator for Leaderboard {
    type Item = LeaderboardEntry;

    fn next(&mut self) -> Option<Self::Item> {
        self.entries.next()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.entries.size_hint()
    }
}

impl ExactSizeIterator for Leaderboard {}

impl<S: SessionStore> Tracker<S> {
    /// Credited seconds of an open session so far.
    pub fn live_elapsed(&self, open: &OpenSession, now: DateTime<Utc>) -> i64 {
        self.config()
            .durations
            .credited_seconds(open.start_time, now.max(open.start_time), open.is_live)
    }

    /// Time a member spent on `date`, per classification.
    pub fn time_for(
        &self,
        user_id: &UserId,
        guild_id: &GuildId,
        date: NaiveDate,
        now: DateTime<Utc>,
    ) -> Result<TimeBreakdown, StoreError> {
        let mut breakdown = TimeBreakdown::default();
        for classification in Classification::ALL {
            let stored =
                self.store()
                    .sum_duration(user_id, guild_id, date, Some(classification))?;
            breakdown.add(classification, stored);
        }

        let key = MemberKey {
            user_id: user_id.clone(),
            guild_id: guild_id.clone(),
        };
        if let Some(open) = self.open_session(&key) {
            if open.start_date == date {
                let live = self.live_elapsed(open, now);
                tracing::debug!(session_id = %open.id, live, "adding live session time");
                breakdown.add(open.classification, live);
            }
        }
        Ok(breakdown)
    }

    /// Time a member spent today, per classification.
    pub fn time_today(
        &self,
        user_id: &UserId,
        guild_id: &GuildId,
        now: DateTime<Utc>,
    ) -> Result<TimeBreakdown, StoreError> {
        self.time_for(user_id, guild_id, self.calendar().date_of(now), now)
    }

    /// Members of a guild ranked by total time over the trailing `days` days,
    /// today included. `days` is clamped to `1..=30`.
    pub fn leaderboard(
        &self,
        guild_id: &GuildId,
        days: u32,
        now: DateTime<Utc>,
    ) -> Result<Leaderboard, StoreError> {
        let days = days.clamp(1, MAX_LEADERBOARD_DAYS);
        let today = self.calendar().date_of(now);
        let since = Calendar::window_start(today, days);

        let rows = self.store().leaderboard_rows(guild_id, since)?;
        let mut entries: Vec<LeaderboardEntry> = rows
            .into_iter()
            .map(|row| LeaderboardEntry {
                user_id: row.user_id,
                user_name: row.user_name,
                total_seconds: row.total_seconds,
            })
            .collect();
        let positions: HashMap<UserId, usize> = entries
            .iter()
            .enumerate()
            .map(|(i, entry)| (entry.user_id.clone(), i))
            .collect();

        for (key, open) in self.open_sessions() {
            if &key.guild_id != guild_id || open.start_date < since {
                continue;
            }
            let live = self.live_elapsed(open, now);
            if let Some(&i) = positions.get(&key.user_id) {
                entries[i].total_seconds += live;
            } else {
                // The store lists every user with a session in the window,
                // an open one included; this only happens if rows were purged
                // underneath us.
                entries.push(LeaderboardEntry {
                    user_id: key.user_id.clone(),
                    user_name: key.user_id.to_string(),
                    total_seconds: live,
                });
            }
        }

        // Stable: ties keep first-seen order.
        entries.sort_by(|a, b| b.total_seconds.cmp(&a.total_seconds));
        tracing::debug!(guild_id = %guild_id, days, users = entries.len(), "computed leaderboard");
        Ok(Leaderboard {
            days,
            entries: entries.into_iter(),
        })
    }
}

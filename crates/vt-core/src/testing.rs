//! In-memory fixtures for unit tests.

use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, Utc};

use crate::model::{
    ChannelRef, Classification, GuildId, GuildRef, MemberState, NewSession, Session, SessionId,
    Status, UserId, UserRef,
};
use crate::store::{
    ChannelRecord, CloseOutcome, ImportStats, LeaderboardRow, SessionStore, Snapshot,
    SnapshotError, SnapshotStore, StoreContents, StoreError,
};

/// Base instant for tests: 2025-03-10T12:00:00Z.
pub const BASE: i64 = 1_741_608_000;

pub fn at(seconds: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(BASE + seconds, 0).unwrap()
}

pub fn ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
}

pub fn date(s: &str) -> NaiveDate {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
}

/// A connected, unmuted, online member.
pub fn member(user: &str, guild: &str, channel: &str) -> MemberState {
    MemberState {
        user: UserRef {
            id: UserId::new(user),
            name: format!("user-{user}"),
        },
        guild: GuildRef {
            id: GuildId::new(guild),
            name: format!("guild-{guild}"),
        },
        channel: Some(ChannelRef {
            id: channel.into(),
            name: format!("channel-{channel}"),
        }),
        self_mute: false,
        server_mute: false,
        status: Status::Online,
        is_live: false,
    }
}

pub fn muted(mut member: MemberState) -> MemberState {
    member.self_mute = true;
    member
}

pub fn disconnected(mut member: MemberState) -> MemberState {
    member.channel = None;
    member
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    pub users: BTreeMap<UserId, String>,
    pub guilds: BTreeMap<GuildId, String>,
    pub channels: BTreeMap<String, ChannelRecord>,
    pub sessions: BTreeMap<SessionId, Session>,
    next_id: i64,
    /// Number of upcoming `close` calls that fail transiently.
    pub failing_closes: Cell<usize>,
    /// Number of upcoming `create` calls that fail transiently.
    pub failing_creates: Cell<usize>,
    /// Makes `import` fail the way a constraint violation would.
    pub reject_imports: bool,
}

impl MemoryStore {
    fn take_failure(counter: &Cell<usize>) -> Result<(), StoreError> {
        let remaining = counter.get();
        if remaining > 0 {
            counter.set(remaining - 1);
            return Err(StoreError::Transient("database is locked".to_string()));
        }
        Ok(())
    }

    pub fn open_count(&self) -> usize {
        self.sessions.values().filter(|s| s.is_open()).count()
    }

    pub fn closed(&self) -> Vec<&Session> {
        self.sessions.values().filter(|s| !s.is_open()).collect()
    }
}

impl SessionStore for MemoryStore {
    fn upsert_user(&mut self, user: &UserRef) -> Result<(), StoreError> {
        self.users.insert(user.id.clone(), user.name.clone());
        Ok(())
    }

    fn upsert_guild(&mut self, guild: &GuildRef) -> Result<(), StoreError> {
        self.guilds.insert(guild.id.clone(), guild.name.clone());
        Ok(())
    }

    fn upsert_channel(
        &mut self,
        channel: &ChannelRef,
        guild_id: &GuildId,
    ) -> Result<(), StoreError> {
        self.channels.insert(
            channel.id.to_string(),
            ChannelRecord {
                id: channel.id.clone(),
                name: channel.name.clone(),
                guild_id: guild_id.clone(),
            },
        );
        Ok(())
    }

    fn create(&mut self, session: &NewSession) -> Result<SessionId, StoreError> {
        Self::take_failure(&self.failing_creates)?;
        self.next_id += 1;
        let id = SessionId(self.next_id);
        self.sessions.insert(
            id,
            Session {
                id,
                user_id: session.user_id.clone(),
                guild_id: session.guild_id.clone(),
                channel_id: session.channel_id.clone(),
                classification: session.classification,
                is_live: session.is_live,
                start_time: session.start_time,
                start_date: session.start_date,
                end_time: None,
                duration_seconds: None,
            },
        );
        Ok(id)
    }

    fn close(
        &mut self,
        id: SessionId,
        end_time: DateTime<Utc>,
        duration_seconds: i64,
    ) -> Result<CloseOutcome, StoreError> {
        Self::take_failure(&self.failing_closes)?;
        let Some(session) = self.sessions.get_mut(&id) else {
            return Ok(CloseOutcome::Unknown);
        };
        if !session.is_open() {
            return Ok(CloseOutcome::AlreadyClosed);
        }
        session.end_time = Some(end_time);
        session.duration_seconds = Some(duration_seconds);
        Ok(CloseOutcome::Closed)
    }

    fn get(&self, id: SessionId) -> Result<Option<Session>, StoreError> {
        Ok(self.sessions.get(&id).cloned())
    }

    fn sum_duration(
        &self,
        user_id: &UserId,
        guild_id: &GuildId,
        date: NaiveDate,
        classification: Option<Classification>,
    ) -> Result<i64, StoreError> {
        Ok(self
            .sessions
            .values()
            .filter(|s| &s.user_id == user_id && &s.guild_id == guild_id)
            .filter(|s| s.start_date == date)
            .filter(|s| classification.is_none_or(|c| s.classification == c))
            .filter_map(|s| s.duration_seconds)
            .sum())
    }

    fn leaderboard_rows(
        &self,
        guild_id: &GuildId,
        since: NaiveDate,
    ) -> Result<Vec<LeaderboardRow>, StoreError> {
        let mut rows: Vec<LeaderboardRow> = Vec::new();
        for session in self
            .sessions
            .values()
            .filter(|s| &s.guild_id == guild_id && s.start_date >= since)
        {
            let duration = session.duration_seconds.unwrap_or(0);
            if let Some(row) = rows.iter_mut().find(|r| r.user_id == session.user_id) {
                row.total_seconds += duration;
            } else {
                rows.push(LeaderboardRow {
                    user_id: session.user_id.clone(),
                    user_name: self
                        .users
                        .get(&session.user_id)
                        .cloned()
                        .unwrap_or_default(),
                    total_seconds: duration,
                });
            }
        }
        Ok(rows)
    }

    fn delete_older_than(&mut self, date: NaiveDate) -> Result<usize, StoreError> {
        let before = self.sessions.len();
        self.sessions
            .retain(|_, s| s.is_open() || s.start_date >= date);
        Ok(before - self.sessions.len())
    }

    fn list_open(&self) -> Result<Vec<Session>, StoreError> {
        Ok(self
            .sessions
            .values()
            .filter(|s| s.is_open())
            .cloned()
            .collect())
    }

    fn export(&self) -> Result<StoreContents, StoreError> {
        Ok(StoreContents {
            users: self
                .users
                .iter()
                .map(|(id, name)| UserRef {
                    id: id.clone(),
                    name: name.clone(),
                })
                .collect(),
            guilds: self
                .guilds
                .iter()
                .map(|(id, name)| GuildRef {
                    id: id.clone(),
                    name: name.clone(),
                })
                .collect(),
            channels: self.channels.values().cloned().collect(),
            sessions: self.sessions.values().cloned().collect(),
        })
    }

    fn import(&mut self, contents: &StoreContents) -> Result<ImportStats, StoreError> {
        if self.reject_imports {
            return Err(StoreError::Backend(
                "FOREIGN KEY constraint failed".to_string(),
            ));
        }
        for user in &contents.users {
            self.users
                .entry(user.id.clone())
                .or_insert_with(|| user.name.clone());
        }
        for guild in &contents.guilds {
            self.guilds
                .entry(guild.id.clone())
                .or_insert_with(|| guild.name.clone());
        }
        for channel in &contents.channels {
            self.channels
                .entry(channel.id.to_string())
                .or_insert_with(|| channel.clone());
        }
        let mut stats = ImportStats::default();
        for session in &contents.sessions {
            if self.sessions.contains_key(&session.id) {
                stats.sessions_skipped += 1;
            } else {
                self.sessions.insert(session.id, session.clone());
                self.next_id = self.next_id.max(session.id.0);
                stats.sessions_imported += 1;
            }
        }
        Ok(stats)
    }
}

/// Snapshot store kept in memory; `corrupt` makes every load fail.
#[derive(Debug, Default)]
pub struct MemorySnapshots {
    pub latest: RefCell<Option<Snapshot>>,
    pub corrupt: bool,
}

impl SnapshotStore for MemorySnapshots {
    fn save(&self, snapshot: &Snapshot) -> Result<(), SnapshotError> {
        *self.latest.borrow_mut() = Some(snapshot.clone());
        Ok(())
    }

    fn load(&self) -> Result<Option<Snapshot>, SnapshotError> {
        if self.corrupt {
            let err = serde_json::from_str::<Snapshot>("{not json").unwrap_err();
            return Err(SnapshotError::Json(err));
        }
        Ok(self.latest.borrow().clone())
    }
}

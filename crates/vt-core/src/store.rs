//! Storage capabilities the tracker depends on.
//!
//! The tracker never talks to a database directly. It needs a [`SessionStore`]
//! for durable session rows and, optionally, a [`SnapshotStore`] that can
//! persist a point-in-time copy of everything for crash recovery.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::{
    ChannelId, ChannelRef, Classification, GuildId, GuildRef, NewSession, Session, SessionId,
    UserId, UserRef,
};

/// Current snapshot format version.
pub const SNAPSHOT_VERSION: u32 = 1;

/// Session store failures.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The store was busy, locked or timed out; the operation may succeed later.
    #[error("transient store failure: {0}")]
    Transient(String),
    /// The store rejected the operation.
    #[error("store failure: {0}")]
    Backend(String),
    /// A stored row could not be decoded.
    #[error("corrupt row {row}: {message}")]
    Corrupt { row: String, message: String },
}

impl StoreError {
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// Snapshot store failures.
#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("snapshot io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("snapshot is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unsupported snapshot version {0}")]
    UnsupportedVersion(u32),
}

/// Result of closing a session by id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseOutcome {
    Closed,
    AlreadyClosed,
    Unknown,
}

/// Closed-session total for one user in a leaderboard window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaderboardRow {
    pub user_id: UserId,
    pub user_name: String,
    pub total_seconds: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelRecord {
    pub id: ChannelId,
    pub name: String,
    pub guild_id: GuildId,
}

/// The logical contents of a session store: the four relations.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreContents {
    pub users: Vec<UserRef>,
    pub guilds: Vec<GuildRef>,
    pub channels: Vec<ChannelRecord>,
    pub sessions: Vec<Session>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImportStats {
    pub sessions_imported: usize,
    pub sessions_skipped: usize,
}

/// Point-in-time copy of a store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub version: u32,
    /// When the snapshot was taken; the last instant the tracker is known
    /// to have been running.
    pub exported_at: DateTime<Utc>,
    #[serde(flatten)]
    pub contents: StoreContents,
}

impl Snapshot {
    pub const fn new(exported_at: DateTime<Utc>, contents: StoreContents) -> Self {
        Self {
            version: SNAPSHOT_VERSION,
            exported_at,
            contents,
        }
    }
}

/// Durable record of sessions.
///
/// Implementations must assign ids on [`create`](Self::create) and treat a
/// close of an unknown or already closed id as a no-op.
pub trait SessionStore {
    fn upsert_user(&mut self, user: &UserRef) -> Result<(), StoreError>;

    fn upsert_guild(&mut self, guild: &GuildRef) -> Result<(), StoreError>;

    fn upsert_channel(&mut self, channel: &ChannelRef, guild_id: &GuildId)
    -> Result<(), StoreError>;

    fn create(&mut self, session: &NewSession) -> Result<SessionId, StoreError>;

    fn close(
        &mut self,
        id: SessionId,
        end_time: DateTime<Utc>,
        duration_seconds: i64,
    ) -> Result<CloseOutcome, StoreError>;

    fn get(&self, id: SessionId) -> Result<Option<Session>, StoreError>;

    /// Sum of closed-session durations attributed to `date`.
    ///
    /// `None` sums both classifications.
    fn sum_duration(
        &self,
        user_id: &UserId,
        guild_id: &GuildId,
        date: NaiveDate,
        classification: Option<Classification>,
    ) -> Result<i64, StoreError>;

    /// Closed-session totals per user for sessions starting on or after
    /// `since`, listing every user with any session in the window in
    /// first-seen order.
    fn leaderboard_rows(
        &self,
        guild_id: &GuildId,
        since: NaiveDate,
    ) -> Result<Vec<LeaderboardRow>, StoreError>;

    /// Deletes closed sessions that started before `date`. Returns the count.
    fn delete_older_than(&mut self, date: NaiveDate) -> Result<usize, StoreError>;

    /// Open sessions ordered by id.
    fn list_open(&self) -> Result<Vec<Session>, StoreError>;

    fn export(&self) -> Result<StoreContents, StoreError>;

    /// Imports rows, skipping sessions whose id already exists.
    fn import(&mut self, contents: &StoreContents) -> Result<ImportStats, StoreError>;
}

/// Durable home for the latest snapshot.
pub trait SnapshotStore {
    fn save(&self, snapshot: &Snapshot) -> Result<(), SnapshotError>;

    /// Loads the latest snapshot, `None` if none was ever saved.
    fn load(&self) -> Result<Option<Snapshot>, SnapshotError>;
}

impl<T: SnapshotStore + ?Sized> SnapshotStore for &T {
    fn save(&self, snapshot: &Snapshot) -> Result<(), SnapshotError> {
        (**self).save(snapshot)
    }

    fn load(&self) -> Result<Option<Snapshot>, SnapshotError> {
        (**self).load()
    }
}

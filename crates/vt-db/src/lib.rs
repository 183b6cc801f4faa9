//! Storage layer for the voice tracker.
//!
//! [`Database`] implements [`SessionStore`] on top of `rusqlite`, and
//! [`SnapshotFile`] implements [`vt_core::SnapshotStore`] as a JSON file.
//!
//! # Thread Safety
//!
//! The [`Database`] type wraps a `rusqlite::Connection`, which is `Send` but not `Sync`.
//! A `Database` can be moved to a worker thread but not shared; the CLI hands it
//! to a single dispatcher that owns it for the life of the process.
//!
//! # Schema
//!
//! Four tables: `users`, `guilds`, `channels` and `sessions`. A session row with
//! a NULL `end_time` is open.
//!
//! Timestamps are stored as TEXT in RFC 3339 format with millisecond precision
//! (e.g. `2025-03-10T12:00:00.000Z`), so lexicographic order matches
//! chronological order. `start_date` is the calendar day (`YYYY-MM-DD`) the
//! session is attributed to, fixed when the session is created.

mod snapshot;

use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use rusqlite::{Connection, ErrorCode, OptionalExtension, Row, params};
use thiserror::Error;
use vt_core::{
    ChannelId, ChannelRecord, ChannelRef, Classification, CloseOutcome, GuildId, GuildRef,
    ImportStats, LeaderboardRow, NewSession, Session, SessionId, SessionStore, StoreContents,
    StoreError, UserId, UserRef,
};

pub use snapshot::SnapshotFile;

/// Default time a statement waits on a locked database before failing.
pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Database errors.
#[derive(Debug, Error)]
pub enum DbError {
    /// An error from the underlying database.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    /// A stored timestamp could not be parsed.
    #[error("invalid timestamp for session {session_id}: {timestamp}")]
    TimestampParse {
        session_id: i64,
        timestamp: String,
        #[source]
        source: chrono::ParseError,
    },
    /// A stored value is outside its domain.
    #[error("invalid {field} for session {session_id}: {value}")]
    InvalidValue {
        session_id: i64,
        field: &'static str,
        value: String,
    },
}

impl DbError {
    /// True when SQLite reported the database busy or locked.
    pub fn is_busy(&self) -> bool {
        matches!(
            self,
            Self::Sqlite(err) if matches!(
                err.sqlite_error_code(),
                Some(ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked)
            )
        )
    }
}

impl From<DbError> for StoreError {
    fn from(err: DbError) -> Self {
        match err {
            err if err.is_busy() => Self::Transient(err.to_string()),
            DbError::Sqlite(err) => Self::Backend(err.to_string()),
            DbError::TimestampParse { session_id, .. }
            | DbError::InvalidValue { session_id, .. } => Self::Corrupt {
                row: format!("sessions/{session_id}"),
                message: err.to_string(),
            },
        }
    }
}

/// Row counts reported by `vt status`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DbStats {
    pub users: usize,
    pub guilds: usize,
    pub channels: usize,
    pub sessions: usize,
    pub open_sessions: usize,
}

/// Database connection wrapper.
///
/// See the [module documentation](self) for thread safety considerations.
pub struct Database {
    conn: Connection,
}

const SESSION_COLUMNS: &str = "id, user_id, guild_id, channel_id, classification, is_live, \
                               start_time, start_date, end_time, duration_seconds";

/// A session row as stored, before its text columns are decoded.
struct SessionRow {
    id: i64,
    user_id: String,
    guild_id: String,
    channel_id: Option<String>,
    classification: String,
    is_live: bool,
    start_time: String,
    start_date: String,
    end_time: Option<String>,
    duration_seconds: Option<i64>,
}

impl SessionRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            user_id: row.get(1)?,
            guild_id: row.get(2)?,
            channel_id: row.get(3)?,
            classification: row.get(4)?,
            is_live: row.get(5)?,
            start_time: row.get(6)?,
            start_date: row.get(7)?,
            end_time: row.get(8)?,
            duration_seconds: row.get(9)?,
        })
    }

    fn decode(self) -> Result<Session, DbError> {
        let classification: Classification =
            self.classification
                .parse()
                .map_err(|_| DbError::InvalidValue {
                    session_id: self.id,
                    field: "classification",
                    value: self.classification.clone(),
                })?;
        let start_date = NaiveDate::parse_from_str(&self.start_date, "%Y-%m-%d").map_err(|_| {
            DbError::InvalidValue {
                session_id: self.id,
                field: "start_date",
                value: self.start_date.clone(),
            }
        })?;
        let end_time = self
            .end_time
            .as_deref()
            .map(|end| parse_timestamp(end, self.id))
            .transpose()?;
        Ok(Session {
            id: SessionId(self.id),
            user_id: UserId::new(self.user_id),
            guild_id: GuildId::new(self.guild_id),
            channel_id: self.channel_id.map(ChannelId::new),
            classification,
            is_live: self.is_live,
            start_time: parse_timestamp(&self.start_time, self.id)?,
            start_date,
            end_time,
            duration_seconds: self.duration_seconds,
        })
    }
}

impl Database {
    /// Opens a database at the given path, creating it if necessary.
    ///
    /// The database schema is automatically initialized on first open.
    pub fn open(path: &Path) -> Result<Self, DbError> {
        let conn = Connection::open(path)?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Opens an in-memory database.
    ///
    /// The database is destroyed when the connection closes.
    pub fn open_in_memory() -> Result<Self, DbError> {
        let conn = Connection::open_in_memory()?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Sets how long a statement waits on a locked database before it fails
    /// with a busy error.
    pub fn set_busy_timeout(&self, timeout: Duration) -> Result<(), DbError> {
        self.conn.busy_timeout(timeout)?;
        Ok(())
    }

    /// Initializes the database schema.
    ///
    /// This is idempotent - safe to call on an already-initialized database.
    fn init(&self) -> Result<(), DbError> {
        self.conn.busy_timeout(DEFAULT_BUSY_TIMEOUT)?;
        self.conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        self.conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS users (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS guilds (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS channels (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                guild_id TEXT NOT NULL,
                FOREIGN KEY (guild_id) REFERENCES guilds(id) ON DELETE CASCADE
            );

            -- Sessions: one row per continuous Active or Inactive stretch
            -- end_time/duration_seconds: NULL while the session is open
            -- start_date: attribution day, 'YYYY-MM-DD'
            CREATE TABLE IF NOT EXISTS sessions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id TEXT NOT NULL,
                guild_id TEXT NOT NULL,
                channel_id TEXT,
                classification TEXT NOT NULL CHECK (classification IN ('active', 'inactive')),
                is_live INTEGER NOT NULL DEFAULT 0,
                start_time TEXT NOT NULL,
                start_date TEXT NOT NULL,
                end_time TEXT,
                duration_seconds INTEGER,
                FOREIGN KEY (user_id) REFERENCES users(id),
                FOREIGN KEY (guild_id) REFERENCES guilds(id),
                FOREIGN KEY (channel_id) REFERENCES channels(id) ON DELETE SET NULL
            );

            CREATE INDEX IF NOT EXISTS idx_sessions_member_date
                ON sessions(user_id, guild_id, start_date);
            CREATE INDEX IF NOT EXISTS idx_sessions_guild_date ON sessions(guild_id, start_date);
            CREATE INDEX IF NOT EXISTS idx_sessions_end ON sessions(end_time);
            ",
        )?;
        Ok(())
    }

    /// Returns the stored display name of a user.
    pub fn user_name(&self, user_id: &UserId) -> Result<Option<String>, DbError> {
        Ok(self
            .conn
            .query_row(
                "SELECT name FROM users WHERE id = ?1",
                [user_id.as_str()],
                |row| row.get(0),
            )
            .optional()?)
    }

    /// Returns the stored display name of a guild.
    pub fn guild_name(&self, guild_id: &GuildId) -> Result<Option<String>, DbError> {
        Ok(self
            .conn
            .query_row(
                "SELECT name FROM guilds WHERE id = ?1",
                [guild_id.as_str()],
                |row| row.get(0),
            )
            .optional()?)
    }

    pub fn stats(&self) -> Result<DbStats, DbError> {
        let count = |sql: &str| -> Result<usize, DbError> {
            let n: i64 = self.conn.query_row(sql, [], |row| row.get(0))?;
            Ok(usize::try_from(n).unwrap_or_default())
        };
        Ok(DbStats {
            users: count("SELECT COUNT(*) FROM users")?,
            guilds: count("SELECT COUNT(*) FROM guilds")?,
            channels: count("SELECT COUNT(*) FROM channels")?,
            sessions: count("SELECT COUNT(*) FROM sessions")?,
            open_sessions: count("SELECT COUNT(*) FROM sessions WHERE end_time IS NULL")?,
        })
    }

    fn query_sessions(
        &self,
        filter: &str,
        params: impl rusqlite::Params,
    ) -> Result<Vec<Session>, DbError> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {SESSION_COLUMNS} FROM sessions {filter} ORDER BY id ASC"
        ))?;
        let rows = stmt.query_map(params, SessionRow::from_row)?;
        let mut sessions = Vec::new();
        for row in rows {
            sessions.push(row?.decode()?);
        }
        Ok(sessions)
    }

    fn list_users(&self) -> Result<Vec<UserRef>, DbError> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, name FROM users ORDER BY id ASC")?;
        let rows = stmt.query_map([], |row| {
            Ok(UserRef {
                id: UserId::new(row.get::<_, String>(0)?),
                name: row.get(1)?,
            })
        })?;
        let mut users = Vec::new();
        for row in rows {
            users.push(row?);
        }
        Ok(users)
    }

    fn list_guilds(&self) -> Result<Vec<GuildRef>, DbError> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, name FROM guilds ORDER BY id ASC")?;
        let rows = stmt.query_map([], |row| {
            Ok(GuildRef {
                id: GuildId::new(row.get::<_, String>(0)?),
                name: row.get(1)?,
            })
        })?;
        let mut guilds = Vec::new();
        for row in rows {
            guilds.push(row?);
        }
        Ok(guilds)
    }

    fn list_channels(&self) -> Result<Vec<ChannelRecord>, DbError> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, name, guild_id FROM channels ORDER BY id ASC")?;
        let rows = stmt.query_map([], |row| {
            Ok(ChannelRecord {
                id: ChannelId::new(row.get::<_, String>(0)?),
                name: row.get(1)?,
                guild_id: GuildId::new(row.get::<_, String>(2)?),
            })
        })?;
        let mut channels = Vec::new();
        for row in rows {
            channels.push(row?);
        }
        Ok(channels)
    }

    fn import_contents(&mut self, contents: &StoreContents) -> Result<ImportStats, DbError> {
        let tx = self.conn.transaction()?;
        let mut stats = ImportStats::default();
        {
            let mut users = tx.prepare("INSERT OR IGNORE INTO users (id, name) VALUES (?1, ?2)")?;
            for user in &contents.users {
                users.execute(params![user.id.as_str(), user.name])?;
            }
            let mut guilds =
                tx.prepare("INSERT OR IGNORE INTO guilds (id, name) VALUES (?1, ?2)")?;
            for guild in &contents.guilds {
                guilds.execute(params![guild.id.as_str(), guild.name])?;
            }
            let mut channels = tx.prepare(
                "INSERT OR IGNORE INTO channels (id, name, guild_id) VALUES (?1, ?2, ?3)",
            )?;
            for channel in &contents.channels {
                channels.execute(params![
                    channel.id.as_str(),
                    channel.name,
                    channel.guild_id.as_str()
                ])?;
            }
            let mut sessions = tx.prepare(&format!(
                "INSERT OR IGNORE INTO sessions ({SESSION_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)"
            ))?;
            for session in &contents.sessions {
                let inserted = sessions.execute(params![
                    session.id.0,
                    session.user_id.as_str(),
                    session.guild_id.as_str(),
                    session.channel_id.as_ref().map(|id| id.as_str()),
                    session.classification.as_str(),
                    session.is_live,
                    format_timestamp(session.start_time),
                    format_date(session.start_date),
                    session.end_time.map(format_timestamp),
                    session.duration_seconds,
                ])?;
                if inserted == 0 {
                    stats.sessions_skipped += 1;
                } else {
                    stats.sessions_imported += 1;
                }
            }
        }
        tx.commit()?;
        Ok(stats)
    }
}

impl SessionStore for Database {
    fn upsert_user(&mut self, user: &UserRef) -> Result<(), StoreError> {
        self.conn
            .execute(
                "INSERT INTO users (id, name) VALUES (?1, ?2)
                 ON CONFLICT(id) DO UPDATE SET name = excluded.name",
                params![user.id.as_str(), user.name],
            )
            .map_err(DbError::from)?;
        Ok(())
    }

    fn upsert_guild(&mut self, guild: &GuildRef) -> Result<(), StoreError> {
        self.conn
            .execute(
                "INSERT INTO guilds (id, name) VALUES (?1, ?2)
                 ON CONFLICT(id) DO UPDATE SET name = excluded.name",
                params![guild.id.as_str(), guild.name],
            )
            .map_err(DbError::from)?;
        Ok(())
    }

    fn upsert_channel(
        &mut self,
        channel: &ChannelRef,
        guild_id: &GuildId,
    ) -> Result<(), StoreError> {
        self.conn
            .execute(
                "INSERT INTO channels (id, name, guild_id) VALUES (?1, ?2, ?3)
                 ON CONFLICT(id) DO UPDATE SET name = excluded.name, guild_id = excluded.guild_id",
                params![channel.id.as_str(), channel.name, guild_id.as_str()],
            )
            .map_err(DbError::from)?;
        Ok(())
    }

    fn create(&mut self, session: &NewSession) -> Result<SessionId, StoreError> {
        self.conn
            .execute(
                "INSERT INTO sessions
                 (user_id, guild_id, channel_id, classification, is_live, start_time, start_date)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    session.user_id.as_str(),
                    session.guild_id.as_str(),
                    session.channel_id.as_ref().map(|id| id.as_str()),
                    session.classification.as_str(),
                    session.is_live,
                    format_timestamp(session.start_time),
                    format_date(session.start_date),
                ],
            )
            .map_err(DbError::from)?;
        Ok(SessionId(self.conn.last_insert_rowid()))
    }

    fn close(
        &mut self,
        id: SessionId,
        end_time: DateTime<Utc>,
        duration_seconds: i64,
    ) -> Result<CloseOutcome, StoreError> {
        let updated = self
            .conn
            .execute(
                "UPDATE sessions SET end_time = ?1, duration_seconds = ?2
                 WHERE id = ?3 AND end_time IS NULL",
                params![format_timestamp(end_time), duration_seconds, id.0],
            )
            .map_err(DbError::from)?;
        if updated > 0 {
            return Ok(CloseOutcome::Closed);
        }
        let exists: bool = self
            .conn
            .query_row(
                "SELECT EXISTS(SELECT 1 FROM sessions WHERE id = ?1)",
                [id.0],
                |row| row.get(0),
            )
            .map_err(DbError::from)?;
        Ok(if exists {
            CloseOutcome::AlreadyClosed
        } else {
            CloseOutcome::Unknown
        })
    }

    fn get(&self, id: SessionId) -> Result<Option<Session>, StoreError> {
        Ok(self
            .query_sessions("WHERE id = ?1", [id.0])?
            .into_iter()
            .next())
    }

    fn sum_duration(
        &self,
        user_id: &UserId,
        guild_id: &GuildId,
        date: NaiveDate,
        classification: Option<Classification>,
    ) -> Result<i64, StoreError> {
        let total: i64 = self
            .conn
            .query_row(
                "SELECT COALESCE(SUM(duration_seconds), 0) FROM sessions
                 WHERE user_id = ?1 AND guild_id = ?2 AND start_date = ?3
                   AND end_time IS NOT NULL
                   AND (?4 IS NULL OR classification = ?4)",
                params![
                    user_id.as_str(),
                    guild_id.as_str(),
                    format_date(date),
                    classification.map(|c| c.as_str()),
                ],
                |row| row.get(0),
            )
            .map_err(DbError::from)?;
        Ok(total)
    }

    fn leaderboard_rows(
        &self,
        guild_id: &GuildId,
        since: NaiveDate,
    ) -> Result<Vec<LeaderboardRow>, StoreError> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT s.user_id, COALESCE(u.name, s.user_id),
                        COALESCE(SUM(s.duration_seconds), 0)
                 FROM sessions s
                 LEFT JOIN users u ON u.id = s.user_id
                 WHERE s.guild_id = ?1 AND s.start_date >= ?2
                 GROUP BY s.user_id
                 ORDER BY MIN(s.id) ASC",
            )
            .map_err(DbError::from)?;
        let rows = stmt
            .query_map(params![guild_id.as_str(), format_date(since)], |row| {
                Ok(LeaderboardRow {
                    user_id: UserId::new(row.get::<_, String>(0)?),
                    user_name: row.get(1)?,
                    total_seconds: row.get(2)?,
                })
            })
            .map_err(DbError::from)?;
        let mut leaderboard = Vec::new();
        for row in rows {
            leaderboard.push(row.map_err(DbError::from)?);
        }
        Ok(leaderboard)
    }

    fn delete_older_than(&mut self, date: NaiveDate) -> Result<usize, StoreError> {
        let deleted = self
            .conn
            .execute(
                "DELETE FROM sessions WHERE end_time IS NOT NULL AND start_date < ?1",
                [format_date(date)],
            )
            .map_err(DbError::from)?;
        Ok(deleted)
    }

    fn list_open(&self) -> Result<Vec<Session>, StoreError> {
        Ok(self.query_sessions("WHERE end_time IS NULL", [])?)
    }

    fn export(&self) -> Result<StoreContents, StoreError> {
        Ok(StoreContents {
            users: self.list_users()?,
            guilds: self.list_guilds()?,
            channels: self.list_channels()?,
            sessions: self.query_sessions("", [])?,
        })
    }

    fn import(&mut self, contents: &StoreContents) -> Result<ImportStats, StoreError> {
        Ok(self.import_contents(contents)?)
    }
}

fn parse_timestamp(timestamp: &str, session_id: i64) -> Result<DateTime<Utc>, DbError> {
    DateTime::parse_from_rfc3339(timestamp)
        .map(|parsed| parsed.with_timezone(&Utc))
        .map_err(|source| DbError::TimestampParse {
            session_id,
            timestamp: timestamp.to_string(),
            source,
        })
}

fn format_timestamp(timestamp: DateTime<Utc>) -> String {
    timestamp.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn format_date(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::collections::HashSet;
    use vt_core::{Snapshot, SnapshotStore, Tracker, TrackerConfig, recover};

    fn ts(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 10, h, m, s).unwrap()
    }

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 3, d).unwrap()
    }

    fn user(id: &str, name: &str) -> UserRef {
        UserRef {
            id: id.into(),
            name: name.to_string(),
        }
    }

    fn seeded() -> Database {
        let mut db = Database::open_in_memory().expect("open in-memory db");
        db.upsert_user(&user("1", "ada")).unwrap();
        db.upsert_user(&user("2", "bob")).unwrap();
        db.upsert_guild(&GuildRef {
            id: "g".into(),
            name: "guild".to_string(),
        })
        .unwrap();
        db.upsert_channel(
            &ChannelRef {
                id: "c".into(),
                name: "general".to_string(),
            },
            &"g".into(),
        )
        .unwrap();
        db
    }

    fn new_session(user: &str, classification: Classification, start: DateTime<Utc>) -> NewSession {
        NewSession {
            user_id: user.into(),
            guild_id: "g".into(),
            channel_id: Some("c".into()),
            classification,
            is_live: false,
            start_time: start,
            start_date: start.date_naive(),
        }
    }

    fn closed(
        db: &mut Database,
        user: &str,
        classification: Classification,
        start: DateTime<Utc>,
        seconds: i64,
    ) -> SessionId {
        let id = db.create(&new_session(user, classification, start)).unwrap();
        db.close(id, start + chrono::Duration::seconds(seconds), seconds)
            .unwrap();
        id
    }

    fn table_columns(conn: &Connection, table: &str) -> Vec<String> {
        let mut stmt = conn
            .prepare(&format!("PRAGMA table_info({table})"))
            .expect("prepare table_info");
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(1))
            .expect("query table_info");
        rows.map(|row| row.expect("table_info row")).collect()
    }

    fn index_names(conn: &Connection, table: &str) -> HashSet<String> {
        let mut stmt = conn
            .prepare(&format!("PRAGMA index_list({table})"))
            .expect("prepare index_list");
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(1))
            .expect("query index_list");
        rows.map(|row| row.expect("index_list row")).collect()
    }

    #[test]
    fn open_in_memory_database() {
        let db = Database::open_in_memory();
        assert!(db.is_ok());
    }

    #[test]
    fn schema_matches_data_model() {
        let db = Database::open_in_memory().expect("open in-memory db");

        assert_eq!(table_columns(&db.conn, "users"), vec!["id", "name"]);
        assert_eq!(table_columns(&db.conn, "guilds"), vec!["id", "name"]);
        assert_eq!(
            table_columns(&db.conn, "channels"),
            vec!["id", "name", "guild_id"]
        );
        assert_eq!(
            table_columns(&db.conn, "sessions"),
            vec![
                "id",
                "user_id",
                "guild_id",
                "channel_id",
                "classification",
                "is_live",
                "start_time",
                "start_date",
                "end_time",
                "duration_seconds",
            ]
        );

        let indexes = index_names(&db.conn, "sessions");
        for expected in [
            "idx_sessions_member_date",
            "idx_sessions_guild_date",
            "idx_sessions_end",
        ] {
            assert!(indexes.contains(expected), "missing {expected}");
        }
    }

    #[test]
    fn reopening_a_file_database_keeps_rows() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("vt.db");
        {
            let mut db = Database::open(&path).unwrap();
            db.upsert_user(&user("1", "ada")).unwrap();
        }
        let db = Database::open(&path).unwrap();
        assert_eq!(db.user_name(&"1".into()).unwrap().as_deref(), Some("ada"));
    }

    #[test]
    fn upsert_refreshes_names() {
        let mut db = seeded();
        db.upsert_user(&user("1", "ada lovelace")).unwrap();
        assert_eq!(
            db.user_name(&"1".into()).unwrap().as_deref(),
            Some("ada lovelace")
        );
        assert_eq!(db.stats().unwrap().users, 2);
    }

    #[test]
    fn create_assigns_increasing_ids_and_round_trips() {
        let mut db = seeded();
        let first = db
            .create(&new_session("1", Classification::Active, ts(12, 0, 0)))
            .unwrap();
        let second = db
            .create(&new_session("2", Classification::Inactive, ts(12, 0, 1)))
            .unwrap();
        assert!(second > first);

        let session = db.get(first).unwrap().unwrap();
        assert_eq!(session.user_id.as_str(), "1");
        assert_eq!(session.classification, Classification::Active);
        assert_eq!(session.start_time, ts(12, 0, 0));
        assert_eq!(session.start_date, day(10));
        assert!(session.is_open());
        assert!(db.get(SessionId(999)).unwrap().is_none());
    }

    #[test]
    fn close_is_idempotent() {
        let mut db = seeded();
        let id = db
            .create(&new_session("1", Classification::Active, ts(12, 0, 0)))
            .unwrap();

        assert_eq!(
            db.close(id, ts(12, 2, 0), 120).unwrap(),
            CloseOutcome::Closed
        );
        assert_eq!(
            db.close(id, ts(12, 5, 0), 300).unwrap(),
            CloseOutcome::AlreadyClosed
        );
        assert_eq!(
            db.close(SessionId(42), ts(12, 5, 0), 300).unwrap(),
            CloseOutcome::Unknown
        );

        let session = db.get(id).unwrap().unwrap();
        assert_eq!(session.end_time, Some(ts(12, 2, 0)));
        assert_eq!(session.duration_seconds, Some(120));
    }

    #[test]
    fn sum_duration_filters_by_date_and_classification() {
        let mut db = seeded();
        closed(&mut db, "1", Classification::Active, ts(10, 0, 0), 120);
        closed(&mut db, "1", Classification::Inactive, ts(11, 0, 0), 180);
        closed(&mut db, "2", Classification::Active, ts(11, 0, 0), 999);
        let yesterday = Utc.with_ymd_and_hms(2025, 3, 9, 23, 0, 0).unwrap();
        closed(&mut db, "1", Classification::Active, yesterday, 50);
        db.create(&new_session("1", Classification::Active, ts(12, 0, 0)))
            .unwrap();

        let sum = |c| db.sum_duration(&"1".into(), &"g".into(), day(10), c).unwrap();
        assert_eq!(sum(Some(Classification::Active)), 120);
        assert_eq!(sum(Some(Classification::Inactive)), 180);
        assert_eq!(sum(None), 300);
        assert_eq!(
            db.sum_duration(&"3".into(), &"g".into(), day(10), None)
                .unwrap(),
            0
        );
    }

    #[test]
    fn leaderboard_rows_include_open_only_users_in_first_seen_order() {
        let mut db = seeded();
        db.create(&new_session("2", Classification::Active, ts(9, 0, 0)))
            .unwrap();
        closed(&mut db, "1", Classification::Active, ts(10, 0, 0), 200);
        closed(&mut db, "1", Classification::Inactive, ts(11, 0, 0), 300);

        let rows = db.leaderboard_rows(&"g".into(), day(4)).unwrap();
        assert_eq!(
            rows,
            vec![
                LeaderboardRow {
                    user_id: "2".into(),
                    user_name: "bob".to_string(),
                    total_seconds: 0,
                },
                LeaderboardRow {
                    user_id: "1".into(),
                    user_name: "ada".to_string(),
                    total_seconds: 500,
                },
            ]
        );
        assert!(db.leaderboard_rows(&"g".into(), day(11)).unwrap().is_empty());
    }

    #[test]
    fn delete_older_than_keeps_open_sessions() {
        let mut db = seeded();
        let old = Utc.with_ymd_and_hms(2025, 2, 1, 10, 0, 0).unwrap();
        closed(&mut db, "1", Classification::Active, old, 60);
        let open = db
            .create(&new_session("2", Classification::Active, old))
            .unwrap();
        closed(&mut db, "1", Classification::Active, ts(10, 0, 0), 60);

        assert_eq!(db.delete_older_than(day(1)).unwrap(), 1);
        assert!(db.get(open).unwrap().is_some());
        assert_eq!(db.stats().unwrap().sessions, 2);
    }

    #[test]
    fn list_open_orders_by_id() {
        let mut db = seeded();
        let a = db
            .create(&new_session("1", Classification::Active, ts(12, 0, 0)))
            .unwrap();
        closed(&mut db, "2", Classification::Active, ts(10, 0, 0), 60);
        let b = db
            .create(&new_session("2", Classification::Inactive, ts(11, 0, 0)))
            .unwrap();

        let open: Vec<SessionId> = db.list_open().unwrap().iter().map(|s| s.id).collect();
        assert_eq!(open, vec![a, b]);
        assert_eq!(db.stats().unwrap().open_sessions, 2);
    }

    #[test]
    fn import_is_idempotent_and_keeps_ids() {
        let mut source = seeded();
        closed(&mut source, "1", Classification::Active, ts(10, 0, 0), 120);
        let open = source
            .create(&new_session("2", Classification::Inactive, ts(11, 0, 0)))
            .unwrap();
        let contents = source.export().unwrap();

        let mut target = Database::open_in_memory().unwrap();
        let first = target.import(&contents).unwrap();
        assert_eq!(first.sessions_imported, 2);
        let second = target.import(&contents).unwrap();
        assert_eq!(second.sessions_imported, 0);
        assert_eq!(second.sessions_skipped, 2);

        assert_eq!(target.export().unwrap(), contents);
        assert!(target.get(open).unwrap().unwrap().is_open());

        let next = target
            .create(&new_session("1", Classification::Active, ts(13, 0, 0)))
            .unwrap();
        assert!(next > open, "ids must not be reused after import");
    }

    #[test]
    fn export_survives_snapshot_file() {
        let mut db = seeded();
        closed(&mut db, "1", Classification::Active, ts(10, 0, 0), 120);
        let temp = tempfile::tempdir().unwrap();
        let file = SnapshotFile::new(temp.path().join("snapshot.json"));
        file.save(&Snapshot::new(ts(12, 0, 0), db.export().unwrap()))
            .unwrap();

        let mut restored = Database::open_in_memory().unwrap();
        let snapshot = file.load().unwrap().unwrap();
        restored.import(&snapshot.contents).unwrap();
        assert_eq!(restored.export().unwrap(), db.export().unwrap());
    }

    #[test]
    fn corrupt_rows_are_reported() {
        let db = seeded();
        db.conn
            .execute(
                "INSERT INTO sessions (user_id, guild_id, classification, start_time, start_date)
                 VALUES ('1', 'g', 'active', 'not a time', '2025-03-10')",
                [],
            )
            .unwrap();
        let err = db.list_open().unwrap_err();
        assert!(matches!(err, StoreError::Corrupt { .. }), "{err:?}");
    }

    #[test]
    fn busy_errors_are_transient() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("vt.db");
        let mut writer = Database::open(&path).unwrap();
        writer.set_busy_timeout(Duration::from_millis(10)).unwrap();
        let blocker = Connection::open(&path).unwrap();
        blocker.execute_batch("BEGIN EXCLUSIVE;").unwrap();

        let err = writer.upsert_user(&user("1", "ada")).unwrap_err();
        assert!(err.is_transient(), "{err:?}");

        blocker.execute_batch("ROLLBACK;").unwrap();
        writer.upsert_user(&user("1", "ada")).unwrap();
    }

    fn dangling_snapshot() -> StoreContents {
        let start = ts(10, 0, 0);
        StoreContents {
            sessions: vec![Session {
                id: SessionId(7),
                user_id: "ghost".into(),
                guild_id: "g".into(),
                channel_id: None,
                classification: Classification::Active,
                is_live: false,
                start_time: start,
                start_date: start.date_naive(),
                end_time: Some(start + chrono::Duration::seconds(60)),
                duration_seconds: Some(60),
            }],
            ..StoreContents::default()
        }
    }

    #[test]
    fn import_with_dangling_user_rolls_back() {
        let mut db = seeded();
        let mut contents = dangling_snapshot();
        contents.users.push(user("3", "cy"));

        let err = db.import(&contents).unwrap_err();
        assert!(matches!(err, StoreError::Backend(_)), "{err:?}");
        assert_eq!(db.stats().unwrap().users, 2);
        assert_eq!(db.stats().unwrap().sessions, 0);
    }

    #[test]
    fn recovery_skips_snapshot_that_breaks_foreign_keys() {
        let temp = tempfile::tempdir().unwrap();
        let file = SnapshotFile::new(temp.path().join("snapshot.json"));
        file.save(&Snapshot::new(ts(12, 0, 0), dangling_snapshot()))
            .unwrap();

        let mut tracker = Tracker::new(seeded(), TrackerConfig::default());
        let report = recover(&mut tracker, Some(&file), &[], ts(13, 0, 0)).unwrap();
        assert!(report.snapshot_error.is_some());
        assert_eq!(report.snapshot_time, None);
        assert_eq!(tracker.store().stats().unwrap().sessions, 0);
    }
}

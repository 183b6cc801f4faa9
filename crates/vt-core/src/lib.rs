//! Core domain logic for the voice tracker.
//!
//! This crate contains:
//! - Classification of a member's voice presence into Active or Inactive
//! - The per-member session state machine ([`Tracker`])
//! - Per-day and leaderboard aggregation over closed and live sessions
//! - The daily rollover pass and startup recovery
//! - The storage interfaces the tracker is written against

mod aggregate;
pub mod calendar;
pub mod classify;
mod duration;
pub mod model;
pub mod recovery;
pub mod retry;
pub mod rollover;
pub mod store;
mod tracker;

#[cfg(test)]
mod testing;

pub use aggregate::{Leaderboard, LeaderboardEntry, MAX_LEADERBOARD_DAYS, TimeBreakdown};
pub use calendar::Calendar;
pub use classify::{classify, classify_parts};
pub use duration::DurationPolicy;
pub use model::{
    Activity, ChannelId, ChannelRef, Classification, GuildId, GuildRef, MemberKey, MemberState,
    NewSession, Session, SessionId, Status, UserId, UserRef,
};
pub use recovery::{RecoveryReport, recover};
pub use retry::RetryPolicy;
pub use rollover::{
    DEFAULT_RETENTION_DAYS, PersistError, RolloverConfig, RolloverReport, run_rollover,
    save_snapshot,
};
pub use store::{
    ChannelRecord, CloseOutcome, ImportStats, LeaderboardRow, SNAPSHOT_VERSION, SessionStore,
    Snapshot, SnapshotError, SnapshotStore, StoreContents, StoreError,
};
pub use tracker::{
    CloseSummary, KeyState, OpenSession, Tracker, TrackerConfig, TrackerError, Transition,
};

//! The per-member session state machine.
//!
//! A [`Tracker`] owns the table of open sessions, one entry per
//! `(user, guild)` key, and the last observed state of every connected
//! member. Every open or close is written to the [`SessionStore`] before the
//! table changes, so the table and the store agree after each call.
//!
//! The tracker closes before it opens: a key never has an Active and an
//! Inactive session open at the same time.
//!
//! Time is always passed in by the caller. The tracker never reads the clock.

use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, Utc};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::calendar::Calendar;
use crate::classify::classify;
use crate::duration::DurationPolicy;
use crate::model::{
    ChannelId, ChannelRef, Classification, GuildRef, MemberKey, MemberState, NewSession, Session,
    SessionId, UserRef,
};
use crate::retry::RetryPolicy;
use crate::store::{CloseOutcome, SessionStore, StoreError};

/// Tracker failures. None of these leave the table and the store disagreeing.
#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("failed to open session for {key}: {source}")]
    Open {
        key: MemberKey,
        #[source]
        source: StoreError,
    },
    #[error("failed to close session {id} for {key}: {source}")]
    Close {
        key: MemberKey,
        id: SessionId,
        #[source]
        source: StoreError,
    },
}

/// Settings fixed for the lifetime of a tracker.
#[derive(Debug, Clone, Default)]
pub struct TrackerConfig {
    pub calendar: Calendar,
    pub durations: DurationPolicy,
    pub retry: RetryPolicy,
}

/// What the tracker knows about an open session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenSession {
    pub id: SessionId,
    pub classification: Classification,
    pub channel_id: Option<ChannelId>,
    pub start_time: DateTime<Utc>,
    pub start_date: NaiveDate,
    pub is_live: bool,
}

impl From<&Session> for OpenSession {
    fn from(session: &Session) -> Self {
        Self {
            id: session.id,
            classification: session.classification,
            channel_id: session.channel_id.clone(),
            start_time: session.start_time,
            start_date: session.start_date,
            is_live: session.is_live,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyState {
    NoSession,
    ActiveOpen,
    InactiveOpen,
}

/// Effect of a member update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Nothing to do: same classification and channel, or still disconnected.
    Unchanged,
    Opened(SessionId),
    Closed(SessionId),
    /// The open session was closed and replaced (reclassified or moved).
    Switched { closed: SessionId, opened: SessionId },
}

/// Outcome of a force-close pass over every key.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CloseSummary {
    pub closed: usize,
    pub failed: usize,
}

pub struct Tracker<S> {
    store: S,
    config: TrackerConfig,
    open: BTreeMap<MemberKey, OpenSession>,
    observed: BTreeMap<MemberKey, MemberState>,
}

impl<S: SessionStore> Tracker<S> {
    /// Creates a tracker with an empty table. Use [`Tracker::load`] to pick
    /// up sessions already open in the store.
    pub const fn new(store: S, config: TrackerConfig) -> Self {
        Self {
            store,
            config,
            open: BTreeMap::new(),
            observed: BTreeMap::new(),
        }
    }

    /// Creates a tracker whose table mirrors the store's open sessions.
    pub fn load(store: S, config: TrackerConfig) -> Result<Self, StoreError> {
        let mut tracker = Self::new(store, config);
        let surplus = tracker.reload_open()?;
        if !surplus.is_empty() {
            warn!(
                count = surplus.len(),
                "store holds more than one open session for some members; keeping the newest"
            );
        }
        Ok(tracker)
    }

    pub const fn store(&self) -> &S {
        &self.store
    }

    pub const fn store_mut(&mut self) -> &mut S {
        &mut self.store
    }

    pub fn into_store(self) -> S {
        self.store
    }

    pub const fn config(&self) -> &TrackerConfig {
        &self.config
    }

    pub const fn calendar(&self) -> &Calendar {
        &self.config.calendar
    }

    pub fn state(&self, key: &MemberKey) -> KeyState {
        match self.open.get(key).map(|open| open.classification) {
            None => KeyState::NoSession,
            Some(Classification::Active) => KeyState::ActiveOpen,
            Some(Classification::Inactive) => KeyState::InactiveOpen,
        }
    }

    pub fn open_session(&self, key: &MemberKey) -> Option<&OpenSession> {
        self.open.get(key)
    }

    /// Open sessions in key order.
    pub fn open_sessions(&self) -> impl Iterator<Item = (&MemberKey, &OpenSession)> {
        self.open.iter()
    }

    pub fn open_count(&self) -> usize {
        self.open.len()
    }

    /// Rebuilds the table from the store's open sessions.
    ///
    /// When a key has several open sessions the newest wins. The others are
    /// returned so the caller can close them.
    pub fn reload_open(&mut self) -> Result<Vec<Session>, StoreError> {
        let mut newest: BTreeMap<MemberKey, Session> = BTreeMap::new();
        let mut surplus = Vec::new();
        for session in self.store.list_open()? {
            let key = session.key();
            match newest.remove(&key) {
                Some(existing)
                    if (existing.start_time, existing.id) > (session.start_time, session.id) =>
                {
                    surplus.push(session);
                    newest.insert(key, existing);
                }
                Some(existing) => {
                    surplus.push(existing);
                    newest.insert(key, session);
                }
                None => {
                    newest.insert(key, session);
                }
            }
        }
        self.open = newest
            .iter()
            .map(|(key, session)| (key.clone(), OpenSession::from(session)))
            .collect();
        debug!(open = self.open.len(), surplus = surplus.len(), "reloaded open sessions");
        Ok(surplus)
    }

    /// Applies a member update.
    pub fn observe(
        &mut self,
        member: &MemberState,
        now: DateTime<Utc>,
    ) -> Result<Transition, TrackerError> {
        let key = member.key();
        let activity = classify(member);
        if member.channel.is_some() {
            self.observed.insert(key.clone(), member.clone());
        } else {
            self.observed.remove(&key);
        }

        let Some(classification) = activity.classification() else {
            return Ok(self
                .end_all(&key, now)?
                .map_or(Transition::Unchanged, Transition::Closed));
        };

        let Some(current) = self.open.get(&key) else {
            let opened = self.begin(
                &member.user,
                &member.guild,
                member.channel.as_ref(),
                classification,
                member.is_live,
                now,
            )?;
            return Ok(Transition::Opened(opened));
        };

        let moved = current.channel_id.as_ref() != member.channel_id();
        if current.classification == classification && !moved {
            debug!(key = %key, classification = %classification, "member update changes nothing");
            return Ok(Transition::Unchanged);
        }

        if moved {
            debug!(key = %key, "member moved channel");
        }
        let closed = self.end_all(&key, now)?;
        let opened = self.begin(
            &member.user,
            &member.guild,
            member.channel.as_ref(),
            classification,
            member.is_live,
            now,
        )?;
        Ok(closed.map_or(Transition::Opened(opened), |closed| {
            Transition::Switched { closed, opened }
        }))
    }

    /// Starts tracking a member under `classification`.
    ///
    /// Returns the already open session when one of the same classification
    /// exists. An open session of the other classification is closed first.
    pub fn begin(
        &mut self,
        user: &UserRef,
        guild: &GuildRef,
        channel: Option<&ChannelRef>,
        classification: Classification,
        is_live: bool,
        now: DateTime<Utc>,
    ) -> Result<SessionId, TrackerError> {
        let key = MemberKey {
            user_id: user.id.clone(),
            guild_id: guild.id.clone(),
        };
        if let Some(open) = self.open.get(&key) {
            if open.classification == classification {
                debug!(
                    key = %key,
                    session_id = %open.id,
                    "session already open, ignoring duplicate begin"
                );
                return Ok(open.id);
            }
            let opposing = open.classification;
            self.end(&key, opposing, now)?;
        }

        let new = NewSession {
            user_id: user.id.clone(),
            guild_id: guild.id.clone(),
            channel_id: channel.map(|c| c.id.clone()),
            classification,
            is_live,
            start_time: now,
            start_date: self.config.calendar.date_of(now),
        };
        let store = &mut self.store;
        let id = self
            .config
            .retry
            .run_open("create session", || {
                store.upsert_user(user)?;
                store.upsert_guild(guild)?;
                if let Some(channel) = channel {
                    store.upsert_channel(channel, &guild.id)?;
                }
                store.create(&new)
            })
            .map_err(|source| TrackerError::Open {
                key: key.clone(),
                source,
            })?;

        info!(
            user_id = %key.user_id,
            guild_id = %key.guild_id,
            session_id = %id,
            classification = %classification,
            user = %user.name,
            "started tracking"
        );
        self.open.insert(
            key,
            OpenSession {
                id,
                classification,
                channel_id: new.channel_id,
                start_time: new.start_time,
                start_date: new.start_date,
                is_live,
            },
        );
        debug!(open = self.open.len(), "open sessions");
        Ok(id)
    }

    /// Stops tracking `classification` for a key. No-op if nothing matching
    /// is open. Returns the closed session id.
    pub fn end(
        &mut self,
        key: &MemberKey,
        classification: Classification,
        now: DateTime<Utc>,
    ) -> Result<Option<SessionId>, TrackerError> {
        match self.open.get(key) {
            Some(open) if open.classification == classification => self.close_open(key, now),
            _ => {
                debug!(key = %key, classification = %classification, "no open session to end");
                Ok(None)
            }
        }
    }

    /// Stops tracking a key regardless of classification.
    pub fn end_all(
        &mut self,
        key: &MemberKey,
        now: DateTime<Utc>,
    ) -> Result<Option<SessionId>, TrackerError> {
        if self.open.contains_key(key) {
            self.close_open(key, now)
        } else {
            debug!(key = %key, "no open session to end");
            Ok(None)
        }
    }

    /// Closes every open session. Failures are logged and counted; the
    /// failed entries stay in the table.
    pub fn close_everything(&mut self, now: DateTime<Utc>) -> CloseSummary {
        let keys: Vec<MemberKey> = self.open.keys().cloned().collect();
        let mut summary = CloseSummary::default();
        for key in keys {
            match self.end_all(&key, now) {
                Ok(Some(_)) => summary.closed += 1,
                Ok(None) => {}
                Err(err) => {
                    warn!(error = %err, "failed to force-close session");
                    summary.failed += 1;
                }
            }
        }
        summary
    }

    /// Opens sessions for every remembered connected member that has none.
    pub fn resume_observed(&mut self, now: DateTime<Utc>) -> usize {
        let waiting: Vec<MemberState> = self
            .observed
            .iter()
            .filter(|(key, _)| !self.open.contains_key(*key))
            .map(|(_, member)| member.clone())
            .collect();
        let mut opened = 0;
        for member in waiting {
            match self.observe(&member, now) {
                Ok(Transition::Opened(_)) => opened += 1,
                Ok(_) => {}
                Err(err) => warn!(error = %err, "failed to resume session"),
            }
        }
        opened
    }

    /// Closes a session that is not in the table, e.g. a duplicate left
    /// behind by a crash.
    pub fn close_detached(
        &mut self,
        session: &Session,
        end_time: DateTime<Utc>,
    ) -> Result<CloseOutcome, StoreError> {
        let end_time = end_time.max(session.start_time);
        let duration =
            self.config
                .durations
                .credited_seconds(session.start_time, end_time, session.is_live);
        let store = &mut self.store;
        self.config
            .retry
            .run_close("close detached session", || {
                store.close(session.id, end_time, duration)
            })
    }

    fn close_open(
        &mut self,
        key: &MemberKey,
        now: DateTime<Utc>,
    ) -> Result<Option<SessionId>, TrackerError> {
        let Some(open) = self.open.get(key) else {
            return Ok(None);
        };
        let id = open.id;
        let duration = self
            .config
            .durations
            .credited_seconds(open.start_time, now, open.is_live);
        let end_time = now.max(open.start_time);

        let store = &mut self.store;
        let outcome = self
            .config
            .retry
            .run_close("close session", || store.close(id, end_time, duration))
            .map_err(|source| TrackerError::Close {
                key: key.clone(),
                id,
                source,
            })?;

        match outcome {
            CloseOutcome::Closed => info!(
                user_id = %key.user_id,
                guild_id = %key.guild_id,
                session_id = %id,
                duration_seconds = duration,
                "ended tracking"
            ),
            CloseOutcome::AlreadyClosed | CloseOutcome::Unknown => debug!(
                session_id = %id,
                ?outcome,
                "session was already closed or unknown"
            ),
        }
        self.open.remove(key);
        debug!(open = self.open.len(), "open sessions");
        Ok(Some(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Status;
    use crate::testing::{MemoryStore, at, date, disconnected, member, muted, ts};

    fn tracker() -> Tracker<MemoryStore> {
        Tracker::new(
            MemoryStore::default(),
            TrackerConfig {
                calendar: Calendar::utc(),
                durations: DurationPolicy::new(2.0),
                retry: RetryPolicy::immediate(5, 2),
            },
        )
    }

    fn begin_for(
        tracker: &mut Tracker<MemoryStore>,
        m: &MemberState,
        classification: Classification,
        now: DateTime<Utc>,
    ) -> SessionId {
        tracker
            .begin(&m.user, &m.guild, m.channel.as_ref(), classification, m.is_live, now)
            .unwrap()
    }

    #[test]
    fn scenario_unmute_mute_disconnect() {
        let mut tracker = tracker();
        let ada = member("1", "g", "c");
        let key = ada.key();

        let opened = tracker.observe(&ada, at(0)).unwrap();
        assert!(matches!(opened, Transition::Opened(_)));
        assert_eq!(tracker.state(&key), KeyState::ActiveOpen);

        let switched = tracker.observe(&muted(ada.clone()), at(120)).unwrap();
        assert!(matches!(switched, Transition::Switched { .. }));
        assert_eq!(tracker.state(&key), KeyState::InactiveOpen);

        let closed = tracker.observe(&disconnected(ada), at(300)).unwrap();
        assert!(matches!(closed, Transition::Closed(_)));
        assert_eq!(tracker.state(&key), KeyState::NoSession);

        let sessions = tracker.store().closed();
        assert_eq!(sessions.len(), 2);
        assert_eq!(sessions[0].classification, Classification::Active);
        assert_eq!(sessions[0].duration_seconds, Some(120));
        assert_eq!(sessions[1].classification, Classification::Inactive);
        assert_eq!(sessions[1].duration_seconds, Some(180));
    }

    #[test]
    fn repeated_begin_opens_exactly_one_session() {
        let mut tracker = tracker();
        let ada = member("1", "g", "c");
        let first = begin_for(&mut tracker, &ada, Classification::Active, at(0));
        for offset in 1..10 {
            let again = begin_for(&mut tracker, &ada, Classification::Active, at(offset));
            assert_eq!(again, first);
        }
        assert_eq!(tracker.store().open_count(), 1);
        assert_eq!(tracker.store().sessions.len(), 1);
    }

    #[test]
    fn duplicate_updates_are_no_ops() {
        let mut tracker = tracker();
        let ada = member("1", "g", "c");
        tracker.observe(&ada, at(0)).unwrap();
        assert_eq!(tracker.observe(&ada, at(5)).unwrap(), Transition::Unchanged);
        assert_eq!(tracker.store().sessions.len(), 1);
    }

    #[test]
    fn begin_closes_opposing_classification_first() {
        let mut tracker = tracker();
        let ada = member("1", "g", "c");
        let active = begin_for(&mut tracker, &ada, Classification::Active, at(0));
        let inactive = begin_for(&mut tracker, &ada, Classification::Inactive, at(30));
        assert_ne!(active, inactive);
        assert_eq!(tracker.store().open_count(), 1);
        let closed = tracker.store().get(active).unwrap().unwrap();
        assert_eq!(closed.end_time, Some(at(30)));
        assert_eq!(closed.duration_seconds, Some(30));
    }

    #[test]
    fn end_is_idempotent() {
        let mut tracker = tracker();
        let ada = member("1", "g", "c");
        let key = ada.key();
        begin_for(&mut tracker, &ada, Classification::Active, at(0));

        let first = tracker.end(&key, Classification::Active, at(60)).unwrap();
        assert!(first.is_some());
        let snapshot = tracker.store().export().unwrap();

        let second = tracker.end(&key, Classification::Active, at(90)).unwrap();
        assert!(second.is_none());
        assert_eq!(tracker.store().export().unwrap(), snapshot);
    }

    #[test]
    fn end_with_other_classification_is_a_no_op() {
        let mut tracker = tracker();
        let ada = member("1", "g", "c");
        begin_for(&mut tracker, &ada, Classification::Active, at(0));
        let ended = tracker
            .end(&ada.key(), Classification::Inactive, at(10))
            .unwrap();
        assert!(ended.is_none());
        assert_eq!(tracker.state(&ada.key()), KeyState::ActiveOpen);
    }

    #[test]
    fn end_without_open_session_is_not_an_error() {
        let mut tracker = tracker();
        let key = MemberKey::new("nobody", "g");
        assert!(tracker.end_all(&key, at(0)).unwrap().is_none());
        let gone = disconnected(member("nobody", "g", "c"));
        assert_eq!(tracker.observe(&gone, at(0)).unwrap(), Transition::Unchanged);
    }

    #[test]
    fn moving_channel_restarts_the_session() {
        let mut tracker = tracker();
        let ada = member("1", "g", "lobby");
        tracker.observe(&ada, at(0)).unwrap();

        let moved = member("1", "g", "games");
        let transition = tracker.observe(&moved, at(45)).unwrap();
        let Transition::Switched { closed, opened } = transition else {
            panic!("expected switch, got {transition:?}");
        };
        let closed = tracker.store().get(closed).unwrap().unwrap();
        assert_eq!(closed.duration_seconds, Some(45));
        let opened = tracker.store().get(opened).unwrap().unwrap();
        assert_eq!(opened.channel_id.unwrap().as_str(), "games");
        assert_eq!(opened.classification, Classification::Active);
    }

    #[test]
    fn away_status_flips_to_inactive() {
        let mut tracker = tracker();
        let mut ada = member("1", "g", "c");
        tracker.observe(&ada, at(0)).unwrap();
        ada.status = Status::Idle;
        tracker.observe(&ada, at(10)).unwrap();
        assert_eq!(tracker.state(&ada.key()), KeyState::InactiveOpen);
        ada.status = Status::Online;
        tracker.observe(&ada, at(20)).unwrap();
        assert_eq!(tracker.state(&ada.key()), KeyState::ActiveOpen);
    }

    #[test]
    fn never_two_open_sessions_for_a_key() {
        let mut tracker = tracker();
        let base = member("1", "g", "c");
        let steps = [
            base.clone(),
            muted(base.clone()),
            base.clone(),
            member("1", "g", "other"),
            muted(member("1", "g", "other")),
            disconnected(base.clone()),
            base.clone(),
        ];
        for (i, step) in steps.iter().enumerate() {
            tracker.observe(step, at(i64::try_from(i).unwrap() * 10)).unwrap();
            assert!(tracker.store().open_count() <= 1, "step {i}");
        }
    }

    #[test]
    fn live_sessions_use_the_multiplier_on_close() {
        let mut tracker = tracker();
        let mut ada = member("1", "g", "c");
        ada.is_live = true;
        tracker.observe(&ada, at(0)).unwrap();
        // Dropping the stream flag alone keeps the session.
        ada.is_live = false;
        assert_eq!(tracker.observe(&ada, at(30)).unwrap(), Transition::Unchanged);
        tracker.end_all(&ada.key(), at(100)).unwrap();
        assert_eq!(tracker.store().closed()[0].duration_seconds, Some(200));
    }

    #[test]
    fn clock_skew_clamps_to_zero() {
        let mut tracker = tracker();
        let ada = member("1", "g", "c");
        let id = begin_for(&mut tracker, &ada, Classification::Active, at(100));
        tracker.end_all(&ada.key(), at(40)).unwrap();
        let session = tracker.store().get(id).unwrap().unwrap();
        assert_eq!(session.duration_seconds, Some(0));
        assert_eq!(session.end_time, Some(at(100)));
    }

    #[test]
    fn session_spanning_midnight_belongs_to_start_day() {
        let mut tracker = tracker();
        let ada = member("1", "g", "c");
        let id = begin_for(
            &mut tracker,
            &ada,
            Classification::Active,
            ts("2025-03-10T23:59:50Z"),
        );
        tracker
            .end_all(&ada.key(), ts("2025-03-11T00:00:10Z"))
            .unwrap();
        let session = tracker.store().get(id).unwrap().unwrap();
        assert_eq!(session.start_date, date("2025-03-10"));
        assert_eq!(session.duration_seconds, Some(20));
    }

    #[test]
    fn transient_close_failures_are_retried() {
        let mut tracker = tracker();
        let ada = member("1", "g", "c");
        begin_for(&mut tracker, &ada, Classification::Active, at(0));
        tracker.store().failing_closes.set(3);
        assert!(tracker.end_all(&ada.key(), at(10)).unwrap().is_some());
        assert_eq!(tracker.store().open_count(), 0);
    }

    #[test]
    fn exhausted_close_keeps_session_open_for_later() {
        let mut tracker = tracker();
        let ada = member("1", "g", "c");
        let key = ada.key();
        begin_for(&mut tracker, &ada, Classification::Active, at(0));
        tracker.store().failing_closes.set(5);

        let err = tracker.end_all(&key, at(10)).unwrap_err();
        assert!(matches!(err, TrackerError::Close { .. }));
        assert_eq!(tracker.state(&key), KeyState::ActiveOpen);
        assert_eq!(tracker.store().open_count(), 1);

        tracker.end_all(&key, at(20)).unwrap();
        assert_eq!(tracker.store().closed()[0].duration_seconds, Some(20));
    }

    #[test]
    fn failed_open_leaves_table_untouched() {
        let mut tracker = tracker();
        let ada = member("1", "g", "c");
        tracker.store().failing_creates.set(2);
        let err = tracker.observe(&ada, at(0)).unwrap_err();
        assert!(matches!(err, TrackerError::Open { .. }));
        assert_eq!(tracker.state(&ada.key()), KeyState::NoSession);
        assert_eq!(tracker.store().sessions.len(), 0);
    }

    #[test]
    fn close_everything_then_resume_observed() {
        let mut tracker = tracker();
        tracker.observe(&member("1", "g", "c"), at(0)).unwrap();
        tracker.observe(&muted(member("2", "g", "c")), at(0)).unwrap();
        tracker.observe(&member("3", "h", "d"), at(0)).unwrap();
        tracker
            .observe(&disconnected(member("3", "h", "d")), at(5))
            .unwrap();

        let summary = tracker.close_everything(at(60));
        assert_eq!(summary, CloseSummary { closed: 2, failed: 0 });
        assert_eq!(tracker.store().open_count(), 0);

        let resumed = tracker.resume_observed(at(61));
        assert_eq!(resumed, 2);
        assert_eq!(
            tracker.state(&MemberKey::new("2", "g")),
            KeyState::InactiveOpen
        );
        assert_eq!(tracker.state(&MemberKey::new("3", "h")), KeyState::NoSession);
    }

    #[test]
    fn names_are_refreshed_on_session_start() {
        let mut tracker = tracker();
        let mut ada = member("1", "g", "c");
        tracker.observe(&ada, at(0)).unwrap();
        tracker.observe(&disconnected(ada.clone()), at(1)).unwrap();
        ada.user.name = "ada lovelace".to_string();
        tracker.observe(&ada, at(2)).unwrap();
        assert_eq!(tracker.store().users[&ada.user.id], "ada lovelace");
    }

    #[test]
    fn load_keeps_newest_of_duplicate_open_sessions() {
        let mut store = MemoryStore::default();
        let ada = member("1", "g", "c");
        for (offset, classification) in [
            (0, Classification::Active),
            (50, Classification::Inactive),
        ] {
            store
                .create(&NewSession {
                    user_id: ada.user.id.clone(),
                    guild_id: ada.guild.id.clone(),
                    channel_id: None,
                    classification,
                    is_live: false,
                    start_time: at(offset),
                    start_date: date("2025-03-10"),
                })
                .unwrap();
        }
        let tracker = Tracker::load(store, TrackerConfig::default()).unwrap();
        assert_eq!(tracker.state(&ada.key()), KeyState::InactiveOpen);
        assert_eq!(tracker.open_count(), 1);
    }
}

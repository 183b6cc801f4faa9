//! Day attribution and day-boundary arithmetic.
//!
//! Sessions are attributed to the calendar day of their start time in the
//! tracker's timezone. The zone is a fixed UTC offset read once at startup so
//! every component agrees on where midnight falls.

use chrono::{DateTime, Days, FixedOffset, Local, NaiveDate, NaiveTime, Offset, TimeZone, Utc};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Calendar {
    offset: FixedOffset,
}

impl Default for Calendar {
    fn default() -> Self {
        Self::local()
    }
}

impl Calendar {
    pub const fn new(offset: FixedOffset) -> Self {
        Self { offset }
    }

    /// Calendar in UTC.
    pub fn utc() -> Self {
        Self::new(Utc.fix())
    }

    /// Calendar using the machine's current UTC offset.
    pub fn local() -> Self {
        Self::new(Local::now().offset().fix())
    }

    /// Calendar with an offset given in minutes east of UTC.
    ///
    /// Returns `None` when the offset is out of range (more than a day).
    pub fn from_offset_minutes(minutes: i32) -> Option<Self> {
        FixedOffset::east_opt(minutes.checked_mul(60)?).map(Self::new)
    }

    pub const fn offset(&self) -> FixedOffset {
        self.offset
    }

    /// The calendar day `timestamp` falls on.
    pub fn date_of(&self, timestamp: DateTime<Utc>) -> NaiveDate {
        timestamp.with_timezone(&self.offset).date_naive()
    }

    /// First day of a trailing window of `days` days ending on `today`.
    pub fn window_start(today: NaiveDate, days: u32) -> NaiveDate {
        today
            .checked_sub_days(Days::new(u64::from(days.saturating_sub(1))))
            .unwrap_or(NaiveDate::MIN)
    }

    /// Oldest start date that survives a retention sweep run on `today`.
    pub fn retention_cutoff(today: NaiveDate, retention_days: u32) -> NaiveDate {
        today
            .checked_sub_days(Days::new(u64::from(retention_days)))
            .unwrap_or(NaiveDate::MIN)
    }

    /// Next instant strictly after `now` at which the wall clock reads `at`.
    pub fn next_occurrence(&self, at: NaiveTime, now: DateTime<Utc>) -> DateTime<Utc> {
        let local_now = now.with_timezone(&self.offset);
        let today = local_now.date_naive();
        let candidate = self.instant(today, at);
        if candidate > now {
            return candidate;
        }
        let tomorrow = today.succ_opt().unwrap_or(today);
        self.instant(tomorrow, at)
    }

    fn instant(&self, date: NaiveDate, at: NaiveTime) -> DateTime<Utc> {
        // A fixed offset maps every local time to exactly one instant.
        self.offset
            .from_local_datetime(&date.and_time(at))
            .single()
            .map_or_else(|| date.and_time(at).and_utc(), |dt| dt.with_timezone(&Utc))
    }
}

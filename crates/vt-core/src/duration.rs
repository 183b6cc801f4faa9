//! Converting elapsed wall-clock time into credited seconds.

use chrono::{DateTime, Utc};

/// How elapsed time is credited to a session.
///
/// The live multiplier is configuration, read once at startup and handed to
/// every component that turns time into seconds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DurationPolicy {
    pub live_multiplier: f64,
}

impl Default for DurationPolicy {
    fn default() -> Self {
        Self {
            live_multiplier: 1.0,
        }
    }
}

impl DurationPolicy {
    pub const fn new(live_multiplier: f64) -> Self {
        Self { live_multiplier }
    }

    /// Seconds credited for a session running from `start` to `end`.
    ///
    /// An end before the start (clock skew) credits zero.
    pub fn credited_seconds(&self, start: DateTime<Utc>, end: DateTime<Utc>, is_live: bool) -> i64 {
        let raw = end.signed_duration_since(start).num_seconds();
        if raw < 0 {
            tracing::warn!(
                start = %start,
                end = %end,
                "session end precedes start, clamping duration to zero"
            );
            return 0;
        }
        if is_live {
            self.scale(raw)
        } else {
            raw
        }
    }

    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        reason = "durations are far below 2^52 seconds"
    )]
    fn scale(&self, seconds: i64) -> i64 {
        let scaled = (seconds as f64 * self.live_multiplier).round();
        if scaled.is_finite() && scaled > 0.0 {
            scaled as i64
        } else {
            0
        }
    }
}

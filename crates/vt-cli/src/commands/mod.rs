//! CLI command implementations.

pub mod leaderboard;
pub mod open;
pub mod report;
pub mod rollover;
pub mod run;
pub mod snapshot;
pub mod status;
pub mod time;
pub mod util;

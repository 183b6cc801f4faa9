//! Command-line argument definitions.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use vt_core::{GuildId, UserId};

use crate::service::DEFAULT_LEADERBOARD_DAYS;

/// Voice presence time tracker.
///
/// Turns a stream of voice-state updates into per-member sessions and
/// reports daily time and leaderboards from them.
#[derive(Debug, Parser)]
#[command(name = "vt", version, about, long_about = None)]
pub struct Cli {
    /// Enable verbose output.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Path to config file.
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Available subcommands.
#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Run the tracker, reading JSON lines from stdin.
    Run {
        /// JSON file listing members connected at startup.
        #[arg(long)]
        roster: Option<PathBuf>,
    },

    /// Show one member's voice time for a day.
    Time {
        /// User ID.
        #[arg(long)]
        user: UserId,

        /// Guild ID.
        #[arg(long)]
        guild: GuildId,

        /// Day to report (YYYY-MM-DD, "yesterday", "3 days ago"). Defaults to today.
        #[arg(long)]
        date: Option<String>,

        /// Output as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Show the guild leaderboard.
    Leaderboard {
        /// Guild ID.
        #[arg(long)]
        guild: GuildId,

        /// Number of days to include, capped at 30.
        #[arg(long, default_value_t = DEFAULT_LEADERBOARD_DAYS)]
        days: u32,

        /// Output as JSON.
        #[arg(long)]
        json: bool,
    },

    /// List sessions that are still open.
    Open {
        /// Output as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Close every open session and purge old history now.
    Rollover,

    /// Save or restore snapshots.
    #[command(subcommand)]
    Snapshot(SnapshotAction),

    /// Show store and schedule status.
    Status,
}

/// Snapshot subcommands.
#[derive(Debug, Subcommand)]
pub enum SnapshotAction {
    /// Write the store to a snapshot file.
    Export {
        /// Destination, defaults to the configured snapshot path.
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Load a snapshot file into the store.
    Import {
        /// Source, defaults to the configured snapshot path.
        #[arg(long)]
        from: Option<PathBuf>,
    },
}

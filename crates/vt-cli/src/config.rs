//! Configuration loading and management.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use chrono::NaiveTime;
use figment::Figment;
use figment::providers::{Env, Format, Serialized, Toml};
use serde::{Deserialize, Serialize};
use vt_core::{
    Calendar, DEFAULT_RETENTION_DAYS, DurationPolicy, RetryPolicy, RolloverConfig, TrackerConfig,
};
use vt_db::{Database, SnapshotFile};

/// Value of `database_path` that selects a process-local in-memory store.
pub const IN_MEMORY: &str = ":memory:";

/// Application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Path to the database file, or `:memory:`.
    pub database_path: PathBuf,
    /// Where the latest snapshot is kept.
    pub snapshot_path: Option<PathBuf>,
    /// Days of closed sessions kept by the rollover sweep.
    pub retention_days: u32,
    /// Multiplier applied to time spent streaming.
    pub live_multiplier: f64,
    /// Local wall-clock time of the daily rollover, `HH:MM`.
    pub rollover_time: String,
    /// Offset of the tracking timezone in minutes east of UTC. Defaults to
    /// the machine's offset at startup.
    pub utc_offset_minutes: Option<i32>,
    /// Seconds between periodic snapshots; 0 disables them.
    pub snapshot_interval_secs: u64,
    pub busy_timeout_ms: u64,
    /// Capacity of the dispatcher queue.
    pub queue_capacity: usize,
    /// Reopen sessions for still-connected members after a rollover.
    pub reopen_after_rollover: bool,
    pub close_attempts: u32,
    pub open_attempts: u32,
    pub retry_initial_delay_ms: u64,
    pub retry_max_delay_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = dirs_data_path().unwrap_or_else(|| PathBuf::from("."));
        let retry = RetryPolicy::default();
        Self {
            database_path: data_dir.join("vt.db"),
            snapshot_path: Some(data_dir.join("snapshot.json")),
            retention_days: DEFAULT_RETENTION_DAYS,
            live_multiplier: 1.0,
            rollover_time: "00:00".to_string(),
            utc_offset_minutes: None,
            snapshot_interval_secs: 300,
            busy_timeout_ms: 5_000,
            queue_capacity: 1_024,
            reopen_after_rollover: true,
            close_attempts: retry.close_attempts,
            open_attempts: retry.open_attempts,
            retry_initial_delay_ms: u64::try_from(retry.initial_delay.as_millis())
                .unwrap_or(u64::MAX),
            retry_max_delay_ms: u64::try_from(retry.max_delay.as_millis()).unwrap_or(u64::MAX),
        }
    }
}

impl Config {
    /// Loads configuration from default locations.
    #[expect(
        clippy::result_large_err,
        reason = "figment::Error is large but only returned at startup"
    )]
    pub fn load() -> Result<Self, figment::Error> {
        Self::load_from(None)
    }

    /// Loads configuration, optionally from a specific file.
    #[expect(
        clippy::result_large_err,
        reason = "figment::Error is large but only returned at startup"
    )]
    pub fn load_from(config_path: Option<&Path>) -> Result<Self, figment::Error> {
        let mut figment = Figment::from(Serialized::defaults(Self::default()));

        // Load from default config location
        if let Some(config_dir) = dirs_config_path() {
            figment = figment.merge(Toml::file(config_dir.join("config.toml")));
        }

        // Load from specified config file
        if let Some(path) = config_path {
            figment = figment.merge(Toml::file(path));
        }

        // Load from environment variables (VT_*)
        figment = figment.merge(Env::prefixed("VT_"));

        figment.extract()
    }

    pub fn is_in_memory(&self) -> bool {
        self.database_path.as_os_str() == IN_MEMORY
    }

    /// Opens the configured session store, creating its directory if needed.
    pub fn open_database(&self) -> Result<Database> {
        let db = if self.is_in_memory() {
            Database::open_in_memory().context("failed to open in-memory database")?
        } else {
            if let Some(parent) = self.database_path.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)
                        .context("failed to create database directory")?;
                }
            }
            Database::open(&self.database_path).with_context(|| {
                format!("failed to open {}", self.database_path.display())
            })?
        };
        db.set_busy_timeout(self.busy_timeout())
            .context("failed to set busy timeout")?;
        Ok(db)
    }

    pub fn snapshot_file(&self) -> Option<SnapshotFile> {
        self.snapshot_path.as_ref().map(SnapshotFile::new)
    }

    /// Lock file guarding the store against concurrent writers.
    pub fn lock_path(&self) -> PathBuf {
        let dir = if self.is_in_memory() {
            self.snapshot_path
                .as_ref()
                .and_then(|p| p.parent())
                .map(Path::to_path_buf)
        } else {
            self.database_path.parent().map(Path::to_path_buf)
        };
        dir.filter(|d| !d.as_os_str().is_empty())
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".vt.lock")
    }

    pub fn calendar(&self) -> Result<Calendar> {
        match self.utc_offset_minutes {
            Some(minutes) => Calendar::from_offset_minutes(minutes)
                .with_context(|| format!("utc_offset_minutes out of range: {minutes}")),
            None => Ok(Calendar::local()),
        }
    }

    pub fn rollover_at(&self) -> Result<NaiveTime> {
        let raw = self.rollover_time.trim();
        NaiveTime::parse_from_str(raw, "%H:%M")
            .or_else(|_| NaiveTime::parse_from_str(raw, "%H:%M:%S"))
            .with_context(|| format!("invalid rollover_time {raw:?}, expected HH:MM"))
    }

    pub fn tracker_config(&self) -> Result<TrackerConfig> {
        if !self.live_multiplier.is_finite() || self.live_multiplier < 0.0 {
            bail!(
                "live_multiplier must be a non-negative number, got {}",
                self.live_multiplier
            );
        }
        if self.close_attempts == 0 || self.open_attempts == 0 {
            bail!("close_attempts and open_attempts must be at least 1");
        }
        Ok(TrackerConfig {
            calendar: self.calendar()?,
            durations: DurationPolicy::new(self.live_multiplier),
            retry: RetryPolicy {
                close_attempts: self.close_attempts,
                open_attempts: self.open_attempts,
                initial_delay: Duration::from_millis(self.retry_initial_delay_ms),
                max_delay: Duration::from_millis(self.retry_max_delay_ms),
            },
        })
    }

    pub const fn rollover_config(&self) -> RolloverConfig {
        RolloverConfig {
            retention_days: self.retention_days,
        }
    }

    pub const fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }

    pub const fn snapshot_interval(&self) -> Option<Duration> {
        if self.snapshot_interval_secs == 0 {
            None
        } else {
            Some(Duration::from_secs(self.snapshot_interval_secs))
        }
    }
}

/// Returns the platform-specific config directory for vt.
fn dirs_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("vt"))
}

/// Returns the platform-specific data directory for vt.
///
/// On Linux: `~/.local/share/vt`
pub fn dirs_data_path() -> Option<PathBuf> {
    dirs::data_dir().map(|p| p.join("vt"))
}

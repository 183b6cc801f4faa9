//! The tracker service behind `vt run`.
//!
//! One [`Dispatcher`] owns the tracker and its store on a blocking thread and
//! consumes [`Command`]s from a bounded queue. The input reader, the rollover
//! timer and the snapshot timer only ever send commands, so updates for a
//! member are applied in arrival order and a rollover never interleaves with
//! a member update.

use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use vt_core::{
    Calendar, GuildId, MemberState, RolloverConfig, SessionStore, SnapshotStore, Tracker, UserId,
    recover, run_rollover, save_snapshot,
};
use vt_db::SnapshotFile;

use crate::Config;
use crate::protocol::{Input, OpenSessionView, Output};

/// Leaderboard window used when a query does not name one.
pub const DEFAULT_LEADERBOARD_DAYS: u32 = 7;

pub type Clock = Box<dyn Fn() -> DateTime<Utc> + Send>;

/// Wall clock shared with timer tasks.
pub type SharedClock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

#[derive(Debug)]
pub enum Command {
    Observe(MemberState),
    TimeFor {
        user_id: UserId,
        guild_id: GuildId,
        date: Option<NaiveDate>,
        reply: oneshot::Sender<Output>,
    },
    Leaderboard {
        guild_id: GuildId,
        days: Option<u32>,
        reply: oneshot::Sender<Output>,
    },
    OpenSessions {
        reply: oneshot::Sender<Output>,
    },
    Rollover {
        reply: Option<oneshot::Sender<Output>>,
    },
    Snapshot {
        reply: Option<oneshot::Sender<Output>>,
    },
    Shutdown,
}

impl Command {
    /// Turns a protocol line into a command plus the receiver of its reply,
    /// if it has one.
    pub fn from_input(input: Input) -> (Self, Option<oneshot::Receiver<Output>>) {
        let (reply, rx) = oneshot::channel();
        let command = match input {
            Input::MemberUpdate(member) => return (Self::Observe(member), None),
            Input::Time {
                user_id,
                guild_id,
                date,
            } => Self::TimeFor {
                user_id,
                guild_id,
                date,
                reply,
            },
            Input::Leaderboard { guild_id, days } => Self::Leaderboard {
                guild_id,
                days,
                reply,
            },
            Input::OpenSessions => Self::OpenSessions { reply },
            Input::Rollover => Self::Rollover { reply: Some(reply) },
            Input::Snapshot => Self::Snapshot { reply: Some(reply) },
        };
        (command, Some(rx))
    }
}

/// What the final shutdown pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShutdownSummary {
    pub closed: usize,
    pub close_failures: usize,
    pub snapshot_saved: bool,
}

pub struct Dispatcher<S> {
    tracker: Tracker<S>,
    snapshots: Option<SnapshotFile>,
    rollover: RolloverConfig,
    reopen_after_rollover: bool,
    clock: Clock,
}

impl<S: SessionStore> Dispatcher<S> {
    pub fn new(
        tracker: Tracker<S>,
        snapshots: Option<SnapshotFile>,
        rollover: RolloverConfig,
        reopen_after_rollover: bool,
    ) -> Self {
        Self {
            tracker,
            snapshots,
            rollover,
            reopen_after_rollover,
            clock: Box::new(Utc::now),
        }
    }

    #[must_use]
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub const fn tracker(&self) -> &Tracker<S> {
        &self.tracker
    }

    fn snapshot_store(&self) -> Option<&dyn SnapshotStore> {
        self.snapshots.as_ref().map(|s| s as &dyn SnapshotStore)
    }

    /// Applies one command. Breaks on [`Command::Shutdown`].
    pub fn handle(&mut self, command: Command) -> ControlFlow<()> {
        let now = (self.clock)();
        match command {
            Command::Observe(member) => {
                if let Err(err) = self.tracker.observe(&member, now) {
                    warn!(error = %err, "failed to apply member update");
                }
            }
            Command::TimeFor {
                user_id,
                guild_id,
                date,
                reply,
            } => {
                let date = date.unwrap_or_else(|| self.tracker.calendar().date_of(now));
                let output = match self.tracker.time_for(&user_id, &guild_id, date, now) {
                    Ok(time) => Output::time(user_id, guild_id, date, time),
                    Err(err) => Output::error(format!("time query failed: {err}")),
                };
                let _ = reply.send(output);
            }
            Command::Leaderboard {
                guild_id,
                days,
                reply,
            } => {
                let days = days.unwrap_or(DEFAULT_LEADERBOARD_DAYS);
                let output = match self.tracker.leaderboard(&guild_id, days, now) {
                    Ok(board) => Output::Leaderboard {
                        guild_id,
                        days: board.days(),
                        entries: board.collect(),
                    },
                    Err(err) => Output::error(format!("leaderboard query failed: {err}")),
                };
                let _ = reply.send(output);
            }
            Command::OpenSessions { reply } => {
                let sessions = self
                    .tracker
                    .open_sessions()
                    .map(|(key, open)| {
                        OpenSessionView::new(key, open, self.tracker.live_elapsed(open, now))
                    })
                    .collect();
                let _ = reply.send(Output::OpenSessions { sessions });
            }
            Command::Rollover { reply } => {
                let output = self.rollover(now);
                if let Some(reply) = reply {
                    let _ = reply.send(output);
                }
            }
            Command::Snapshot { reply } => {
                let output = self.snapshot(now);
                if let Some(reply) = reply {
                    let _ = reply.send(output);
                }
            }
            Command::Shutdown => return ControlFlow::Break(()),
        }
        ControlFlow::Continue(())
    }

    fn rollover(&mut self, now: DateTime<Utc>) -> Output {
        let mut report = run_rollover(
            &mut self.tracker,
            self.snapshots.as_ref().map(|s| s as &dyn SnapshotStore),
            self.rollover,
            now,
        );
        if self.reopen_after_rollover {
            report.reopened = self.tracker.resume_observed(now);
            info!(reopened = report.reopened, "reopened sessions for connected members");
        }
        Output::rollover(report)
    }

    fn snapshot(&self, now: DateTime<Utc>) -> Output {
        let Some(snapshots) = self.snapshot_store() else {
            return Output::Snapshot {
                saved: false,
                error: Some("no snapshot path configured".to_string()),
            };
        };
        match save_snapshot(&self.tracker, snapshots, now) {
            Ok(()) => Output::Snapshot {
                saved: true,
                error: None,
            },
            Err(err) => {
                warn!(error = %err, "periodic snapshot failed");
                Output::Snapshot {
                    saved: false,
                    error: Some(err.to_string()),
                }
            }
        }
    }

    /// Consumes commands until shutdown or until every sender is gone, then
    /// closes all open sessions and writes a final snapshot.
    pub fn run(mut self, mut commands: mpsc::Receiver<Command>) -> ShutdownSummary {
        while let Some(command) = commands.blocking_recv() {
            if self.handle(command).is_break() {
                break;
            }
        }
        self.shutdown()
    }

    pub fn shutdown(mut self) -> ShutdownSummary {
        let now = (self.clock)();
        let closed = self.tracker.close_everything(now);
        let mut summary = ShutdownSummary {
            closed: closed.closed,
            close_failures: closed.failed,
            snapshot_saved: false,
        };
        if let Some(snapshots) = self.snapshot_store() {
            match save_snapshot(&self.tracker, snapshots, now) {
                Ok(()) => summary.snapshot_saved = true,
                Err(err) => warn!(error = %err, "failed to write final snapshot"),
            }
        }
        info!(
            closed = summary.closed,
            failed = summary.close_failures,
            snapshot_saved = summary.snapshot_saved,
            "tracker stopped"
        );
        summary
    }
}

/// Background timers feeding the dispatcher.
pub struct Timers {
    clock: SharedClock,
    rollover_stop: Option<oneshot::Sender<()>>,
    snapshot_stop: Option<oneshot::Sender<()>>,
    tasks: Vec<JoinHandle<()>>,
}

impl Default for Timers {
    fn default() -> Self {
        Self::with_clock(Arc::new(Utc::now))
    }
}

impl Timers {
    /// Timers that read the wall clock from `clock` when scheduling.
    pub fn with_clock(clock: SharedClock) -> Self {
        Self {
            clock,
            rollover_stop: None,
            snapshot_stop: None,
            tasks: Vec::new(),
        }
    }

    /// Fires a rollover every day at `at` on `calendar`. The next firing is
    /// scheduled only after the previous pass has finished.
    pub fn start_rollover(
        &mut self,
        tx: mpsc::Sender<Command>,
        calendar: Calendar,
        at: NaiveTime,
    ) {
        if self.rollover_stop.is_some() {
            return;
        }
        let (stop_tx, mut stop_rx) = oneshot::channel();
        self.rollover_stop = Some(stop_tx);
        let clock = Arc::clone(&self.clock);
        self.tasks.push(tokio::spawn(async move {
            let mut last_fired: Option<DateTime<Utc>> = None;
            loop {
                let now = clock();
                let after = last_fired.map_or(now, |last| last.max(now));
                let next = calendar.next_occurrence(at, after);
                let wait = (next - now).to_std().unwrap_or(Duration::ZERO);
                debug!(next = %next, "next rollover scheduled");
                tokio::select! {
                    () = tokio::time::sleep(wait) => {}
                    _ = &mut stop_rx => break,
                }
                last_fired = Some(next);
                let (reply_tx, reply_rx) = oneshot::channel();
                if tx
                    .send(Command::Rollover {
                        reply: Some(reply_tx),
                    })
                    .await
                    .is_err()
                {
                    break;
                }
                let _ = reply_rx.await;
            }
        }));
    }

    pub fn start_snapshots(&mut self, tx: mpsc::Sender<Command>, interval: Duration) {
        if self.snapshot_stop.is_some() {
            return;
        }
        let (stop_tx, mut stop_rx) = oneshot::channel();
        self.snapshot_stop = Some(stop_tx);
        self.tasks.push(tokio::spawn(async move {
            let start = tokio::time::Instant::now() + interval;
            let mut ticker = tokio::time::interval_at(start, interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if tx.send(Command::Snapshot { reply: None }).await.is_err() {
                            break;
                        }
                    }
                    _ = &mut stop_rx => break,
                }
            }
        }));
    }

    /// Stops every timer and waits for its task to finish.
    pub async fn stop_all(&mut self) {
        for stop in [self.rollover_stop.take(), self.snapshot_stop.take()]
            .into_iter()
            .flatten()
        {
            let _ = stop.send(());
        }
        for task in self.tasks.drain(..) {
            if let Err(err) = task.await {
                warn!(error = %err, "timer task failed");
            }
        }
    }
}

/// Runs the service until `input` ends or Ctrl-C is received.
///
/// Startup recovery runs against `roster` before the first input line is
/// read. Replies to queries are written to `output`, one JSON object per line.
pub async fn serve<R, W>(
    config: &Config,
    roster: &[MemberState],
    input: R,
    mut output: W,
) -> Result<ShutdownSummary>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let tracker_config = config.tracker_config()?;
    let rollover_at = config.rollover_at()?;
    let db = config.open_database()?;
    let snapshots = config.snapshot_file();

    let mut tracker = Tracker::new(db, tracker_config);
    let report = recover(
        &mut tracker,
        snapshots.as_ref().map(|s| s as &dyn SnapshotStore),
        roster,
        Utc::now(),
    )
    .context("startup recovery failed")?;
    debug!(?report, "recovery report");

    let calendar = *tracker.calendar();
    let dispatcher = Dispatcher::new(
        tracker,
        snapshots,
        config.rollover_config(),
        config.reopen_after_rollover,
    );
    let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
    let worker = tokio::task::spawn_blocking(move || dispatcher.run(rx));

    let mut timers = Timers::default();
    timers.start_rollover(tx.clone(), calendar, rollover_at);
    if let Some(interval) = config.snapshot_interval() {
        timers.start_snapshots(tx.clone(), interval);
    }
    info!(rollover_at = %rollover_at, "tracker running");

    let mut lines = input.lines();
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);
    let mut listen_for_signal = true;
    loop {
        tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    if let Some(reply) = forward(&tx, &line).await {
                        write_line(&mut output, &reply).await;
                    }
                }
                Ok(None) => {
                    info!("input closed, shutting down");
                    break;
                }
                Err(err) => {
                    warn!(error = %err, "failed to read input, shutting down");
                    break;
                }
            },
            result = &mut shutdown, if listen_for_signal => match result {
                Ok(()) => {
                    info!("received shutdown signal");
                    break;
                }
                Err(err) => {
                    warn!(error = %err, "failed to listen for shutdown signal");
                    listen_for_signal = false;
                }
            },
        }
    }

    timers.stop_all().await;
    let _ = tx.send(Command::Shutdown).await;
    drop(tx);
    worker.await.context("dispatcher task panicked")
}

async fn forward(tx: &mpsc::Sender<Command>, line: &str) -> Option<Output> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    let input = match Input::parse(line) {
        Ok(input) => input,
        Err(err) => {
            warn!(error = %err, "ignoring malformed input line");
            return Some(Output::error(format!("invalid input: {err}")));
        }
    };
    let (command, reply) = Command::from_input(input);
    if tx.send(command).await.is_err() {
        return Some(Output::error("tracker is shutting down"));
    }
    let reply = reply?;
    Some(
        reply
            .await
            .unwrap_or_else(|_| Output::error("tracker stopped before replying")),
    )
}

async fn write_line<W: AsyncWrite + Unpin>(output: &mut W, reply: &Output) {
    let mut line = reply.to_line();
    line.push('\n');
    let result = async {
        output.write_all(line.as_bytes()).await?;
        output.flush().await
    }
    .await;
    if let Err(err) = result {
        warn!(error = %err, "failed to write reply");
    }
}

use std::io;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use vt_cli::commands::{leaderboard, open, rollover, run, snapshot, status, time};
use vt_cli::{Cli, Commands, Config, SnapshotAction};

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize tracing with verbose flag support
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::from_default_env()
    };
    // Logs go to stderr so stdout stays a clean reply stream for `vt run`
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init();

    let Some(command) = &cli.command else {
        // No subcommand, show help
        use clap::CommandFactory;
        Cli::command().print_help()?;
        println!();
        return Ok(());
    };

    let config = Config::load_from(cli.config.as_deref()).context("failed to load configuration")?;
    tracing::debug!(?config, "loaded configuration");
    let mut stdout = io::stdout();
    let now = Utc::now();

    match command {
        Commands::Run { roster } => run::run(&config, roster.as_deref())?,
        Commands::Time {
            user,
            guild,
            date,
            json,
        } => time::run(&mut stdout, &config, user, guild, date.as_deref(), *json, now)?,
        Commands::Leaderboard { guild, days, json } => {
            leaderboard::run(&mut stdout, &config, guild, *days, *json, now)?;
        }
        Commands::Open { json } => open::run(&mut stdout, &config, *json, now)?,
        Commands::Rollover => rollover::run(&mut stdout, &config, now)?,
        Commands::Snapshot(action) => match action {
            SnapshotAction::Export { out } => {
                snapshot::export(&mut stdout, &config, out.as_deref(), now)?;
            }
            SnapshotAction::Import { from } => {
                snapshot::import(&mut stdout, &config, from.as_deref())?;
            }
        },
        Commands::Status => status::run(&mut stdout, &config)?,
    }

    Ok(())
}

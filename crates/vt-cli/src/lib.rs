//! Voice tracker CLI library.
//!
//! This crate provides the CLI interface and the long-running service for
//! the voice tracker.

mod cli;
pub mod commands;
mod config;
pub mod protocol;
pub mod service;

pub use cli::{Cli, Commands, SnapshotAction};
pub use config::Config;

//! Activity statistics CLI library.
//!
//! This crate provides the `selfstats` command-line interface over the
//! activity store.

mod cli;
pub mod commands;
mod config;

pub use cli::{Cli, Commands, FilterArgs, ReportArgs};
pub use config::Config;

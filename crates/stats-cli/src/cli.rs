//! Command-line argument definitions.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use stats_core::QueryArgs;

/// Statistics over recorded keyboard and mouse activity.
///
/// Reads the activity store, narrows it with the filter options and prints
/// the result as JSON.
#[derive(Debug, Parser)]
#[command(name = "selfstats", version, about, long_about = None)]
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
    /// List matching keystroke batches, one JSON object per line.
    Rows {
        #[command(flatten)]
        filter: FilterArgs,

        /// Include the decrypted text of each batch.
        #[arg(long)]
        show_text: bool,
    },

    /// Aggregate matching activity into one JSON document.
    Summary {
        #[command(flatten)]
        filter: FilterArgs,

        #[command(flatten)]
        reports: ReportArgs,
    },
}

/// Options selecting which rows are read.
///
/// Only one start is used: date/clock wins over `--id`, which wins over
/// `--back`.
#[derive(Debug, Clone, Default, Args)]
pub struct FilterArgs {
    /// Start date: `DD`, `MM DD` or `YYYY MM DD`, the closest match in the past.
    #[arg(short = 'D', long, num_args = 1..=3, value_name = "DATE")]
    pub date: Vec<String>,

    /// Start time `HH:MM`; without a date, today or yesterday.
    #[arg(short = 'C', long, value_name = "HH:MM")]
    pub clock: Option<String>,

    /// Start at this row id.
    #[arg(short, long)]
    pub id: Option<i64>,

    /// Start this long ago, e.g. `2h`, `30m` or `3 d` (hours when unitless).
    #[arg(short, long, value_name = "PERIOD", num_args = 1..=2)]
    pub back: Vec<String>,

    /// Stop after this period from the start, or after this many rows with `--id`.
    #[arg(short, long, value_name = "PERIOD", num_args = 1..=2)]
    pub limit: Vec<String>,

    /// Only keystroke batches with at least this many keys.
    #[arg(short, long, value_name = "KEYS")]
    pub min_keys: Option<u32>,

    /// Regex on process names (case-insensitive).
    #[arg(short = 'P', long, value_name = "REGEX")]
    pub process: Option<String>,

    /// Regex on window titles (case-insensitive).
    #[arg(short = 'T', long, value_name = "REGEX")]
    pub title: Option<String>,

    /// Regex on typed text (case-insensitive, requires decryption).
    #[arg(short = 'B', long, value_name = "REGEX")]
    pub body: Option<String>,
}

impl FilterArgs {
    pub fn query_args(&self) -> QueryArgs {
        QueryArgs {
            date: self.date.clone(),
            clock: self.clock.clone(),
            id: self.id,
            back: join_words(&self.back),
            limit: join_words(&self.limit),
            process: self.process.clone(),
            title: self.title.clone(),
            body: self.body.clone(),
            min_keys: self.min_keys,
        }
    }
}

fn join_words(words: &[String]) -> Option<String> {
    (!words.is_empty()).then(|| words.join(" "))
}

/// Sections to include in a summary.
///
/// Activity sections take an optional idle cutoff in seconds; all given
/// cutoffs must agree.
#[derive(Debug, Clone, Default, Args)]
pub struct ReportArgs {
    /// Total active time.
    #[arg(long, value_name = "SECONDS", num_args = 0..=1)]
    pub active: Option<Option<i64>>,

    /// Active periods, ascending.
    #[arg(long, value_name = "SECONDS", num_args = 0..=1)]
    pub periods: Option<Option<i64>>,

    /// Active time per process.
    #[arg(long, value_name = "SECONDS", num_args = 0..=1)]
    pub pactive: Option<Option<i64>>,

    /// Active time per window title.
    #[arg(long, value_name = "SECONDS", num_args = 0..=1)]
    pub tactive: Option<Option<i64>>,

    /// Keystroke, click and mouse movement ratios.
    #[arg(long, value_name = "SECONDS", num_args = 0..=1)]
    pub ratios: Option<Option<i64>>,

    /// Click counts per button and mouse movements.
    #[arg(long)]
    pub clicks: bool,

    /// How often each key was pressed (requires decryption).
    #[arg(long)]
    pub key_freqs: bool,

    /// Keystrokes per process.
    #[arg(long)]
    pub pkeys: bool,

    /// Keystrokes per window title.
    #[arg(long)]
    pub tkeys: bool,
}

impl ReportArgs {
    /// Idle cutoffs of the requested activity sections, `default` filling in
    /// those given without a value.
    pub fn cutoffs(&self, default: i64) -> Vec<i64> {
        [
            self.active,
            self.periods,
            self.pactive,
            self.tactive,
            self.ratios,
        ]
        .into_iter()
        .flatten()
        .map(|seconds| seconds.unwrap_or(default))
        .collect()
    }
}

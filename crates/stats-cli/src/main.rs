use std::path::Path;

use anyhow::{Context, Result};
use chrono::Local;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use stats_cli::commands::{rows, summary};
use stats_cli::{Cli, Commands, Config};
use stats_core::Plaintext;

/// Load config and open the activity database.
fn open_database(config_path: Option<&Path>) -> Result<(stats_db::Database, Config)> {
    let config = Config::load_from(config_path).context("failed to load configuration")?;
    tracing::debug!(?config, "loaded configuration");

    anyhow::ensure!(
        config.database_path.exists(),
        "no activity database at {}",
        config.database_path.display()
    );

    let db = stats_db::Database::open_read_only(&config.database_path)
        .with_context(|| format!("failed to open {}", config.database_path.display()))?;
    Ok((db, config))
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize tracing with verbose flag support
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::from_default_env()
    };
    // Use try_init to avoid panic if tracing is already initialized (e.g., in tests)
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();

    let now = Local::now();
    let mut stdout = std::io::stdout().lock();

    match &cli.command {
        Some(Commands::Rows { filter, show_text }) => {
            let (db, _config) = open_database(cli.config.as_deref())?;
            rows::run(
                &mut stdout,
                &db,
                &filter.query_args(),
                *show_text,
                &Plaintext,
                &now,
            )?;
        }
        Some(Commands::Summary { filter, reports }) => {
            let (db, config) = open_database(cli.config.as_deref())?;
            summary::run(
                &mut stdout,
                &db,
                &config,
                &filter.query_args(),
                reports,
                &Plaintext,
                &now,
            )?;
        }
        None => {
            // No subcommand, show help
            use clap::CommandFactory;
            Cli::command().print_help()?;
            println!();
        }
    }

    Ok(())
}

use std::path::Path;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use tl_cli::commands::{live, messages, sessions, status, sync, watch};
use tl_cli::{Cli, Commands, Config};

/// Load config and open database, ensuring the parent directory exists.
fn open_database(config_path: Option<&Path>) -> Result<(tl_db::Database, Config)> {
    let config = Config::load_from(config_path).context("failed to load configuration")?;
    tracing::debug!(?config, "loaded configuration");

    if let Some(parent) = config.database_path.parent() {
        std::fs::create_dir_all(parent).context("failed to create database directory")?;
    }

    let db = tl_db::Database::open(&config.database_path).context("failed to open database")?;
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
    // Logs go to stderr so `--json` output stays machine-readable
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();

    let mut stdout = std::io::stdout();
    match &cli.command {
        Some(Commands::Sync { path }) => {
            let (db, config) = open_database(cli.config.as_deref())?;
            sync::run(&mut stdout, db, &config, path.as_deref())?;
        }
        Some(Commands::Watch) => {
            let (db, config) = open_database(cli.config.as_deref())?;
            watch::run(db, &config)?;
        }
        Some(Commands::Sessions { json }) => {
            let (db, _config) = open_database(cli.config.as_deref())?;
            sessions::run(&mut stdout, &db, *json)?;
        }
        Some(Commands::Messages { session_id, json }) => {
            let (db, _config) = open_database(cli.config.as_deref())?;
            messages::run(&mut stdout, &db, session_id, *json)?;
        }
        Some(Commands::Live {
            prompt,
            resume,
            model,
            cwd,
        }) => {
            let (db, config) = open_database(cli.config.as_deref())?;
            let mut request = config.live_request(prompt.clone());
            request.resume.clone_from(resume);
            request.model.clone_from(model);
            request.cwd.clone_from(cwd);
            live::run(&mut stdout, db, &config, &request)?;
        }
        Some(Commands::Status) => {
            let (db, config) = open_database(cli.config.as_deref())?;
            status::run(&mut stdout, &db, &config)?;
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

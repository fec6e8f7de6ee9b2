//! Keel - composes the bundled workspaces and keeps them mirrored in SQLite.

mod app;
mod demo;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use serde_json::Value;
use workspace_config_and_utils::{init_logging, Config, Paths};

use crate::app::{AppResult, Host};

/// Keel command-line interface.
#[derive(Parser)]
#[command(name = "keel")]
#[command(about = "Workspace composition with SQLite mirrors")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Log level (trace, debug, info, warn, error). Defaults to the configured level
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    /// Base directory for config, logs and mirrors. Defaults to ~/.keel
    #[arg(long, global = true)]
    base_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Restore the workspaces and print their tables and sync status
    Status,
    /// Insert a row and mirror it
    Add {
        /// Table name
        table: String,
        /// Row as a JSON object; an id is generated when missing
        row: String,
    },
    /// Run a workspace action
    Action {
        workspace: String,
        name: String,
        /// Input as JSON
        #[arg(default_value = "null")]
        input: String,
    },
    /// Make every mirror equal its document
    Push,
    /// Make every document equal its mirror
    Pull,
}

fn print_json(value: &impl serde::Serialize) -> AppResult<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> AppResult<()> {
    let cli = Cli::parse();

    let paths = match cli.base_dir {
        Some(base) => Paths::with_base_dir(base),
        None => Paths::new()?,
    };
    paths.ensure_dirs()?;
    let config = Config::load(&paths)?;

    // Initialize logging
    let level = cli.log_level.as_deref().unwrap_or(&config.log_level);
    init_logging(&paths, level);

    let host = Host::open(&config, &paths).await?;
    let outcome = run(&host, cli.command.unwrap_or(Commands::Status)).await;
    host.close().await;
    outcome
}

async fn run(host: &Host, command: Commands) -> AppResult<()> {
    match command {
        Commands::Status => print_json(&host.status()),
        Commands::Add { table, row } => {
            let row: Value = serde_json::from_str(&row)?;
            print_json(&host.add(&table, row).await?)
        }
        Commands::Action {
            workspace,
            name,
            input,
        } => {
            let input: Value = serde_json::from_str(&input)?;
            print_json(&host.action(&workspace, &name, input).await?)
        }
        Commands::Push => print_json(&host.push().await?),
        Commands::Pull => print_json(&host.pull().await?),
    }
}

mod args;
mod commands;

use clap::{Parser, Subcommand};
use std::process::ExitCode;
use tracing::error;
use tracing_subscriber::EnvFilter;

use args::{DownSteps, TargetArgs, UpSteps};
use commands::*;

#[derive(Parser)]
#[command(name = "elif-migrate")]
#[command(about = "Apply and roll back PostgreSQL migrations")]
#[command(version)]
struct Cli {
    #[command(flatten)]
    target: TargetArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Apply pending migrations
    #[command(visible_alias = "up")]
    Migrate {
        /// Number of migrations to apply, or "all"
        #[arg(default_value = "all")]
        steps: UpSteps,
    },

    /// Roll back applied migrations
    #[command(visible_alias = "down")]
    Rollback {
        /// Number of migrations to roll back, "all", or "group" for the last batch
        #[arg(default_value = "1", allow_hyphen_values = true)]
        steps: DownSteps,
    },

    /// Create a new migration file
    #[command(visible_alias = "create")]
    New {
        /// Migration name
        #[arg(required = true, num_args = 1..)]
        name: Vec<String>,
    },

    /// Show applied and pending migrations
    Status {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

fn init_tracing(silent: bool) {
    let default_level = if silent { "error" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .without_time()
        .init();
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let dry = cli.target.dry_run;

    match cli.command {
        Commands::Migrate { steps } => {
            migrate::up(cli.target.config()?, steps, dry).await?;
        }
        Commands::Rollback { steps } => {
            migrate::down(cli.target.config()?, steps, dry).await?;
        }
        Commands::New { name } => {
            migrate::create(&name.join(" "), &cli.target.dir)?;
        }
        Commands::Status { json } => {
            status::show(cli.target.config()?, json).await?;
        }
    }

    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.target.silent);

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

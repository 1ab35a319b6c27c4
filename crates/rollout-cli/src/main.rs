//! rollout CLI tool.

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

mod commands;
mod output;

#[derive(Parser)]
#[command(name = "rollout")]
#[command(about = "Gate, build, publish, provision, deploy and verify a service", long_about = None)]
struct Cli {
    /// PostgreSQL URL for run records and deployment state. Without it,
    /// state lives in memory for the duration of the command.
    #[arg(long, env = "DATABASE_URL", global = true)]
    database_url: Option<String>,

    /// Log output format
    #[arg(long, value_enum, default_value = "text", global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the pipeline for a revision
    Run {
        /// Source revision to release
        revision: String,
        /// Pipeline configuration
        #[arg(long, env = "ROLLOUT_CONFIG", default_value = "rollout.kdl")]
        config: PathBuf,
        /// What triggered the run (push, pull_request, manual)
        #[arg(long, default_value = "manual")]
        trigger: String,
    },
    /// Validate a pipeline configuration
    Validate {
        /// Path to the configuration file
        #[arg(env = "ROLLOUT_CONFIG", default_value = "rollout.kdl")]
        path: PathBuf,
    },
    /// Inspect recorded runs
    Runs {
        #[command(subcommand)]
        command: RunCommands,
    },
    /// Show the last known-good artifact of a service
    State {
        /// Service name
        service: String,
    },
    /// Roll a service back to its last known-good artifact
    Rollback {
        /// Service name
        service: String,
        /// Pipeline configuration
        #[arg(long, env = "ROLLOUT_CONFIG", default_value = "rollout.kdl")]
        config: PathBuf,
    },
}

#[derive(Subcommand)]
enum RunCommands {
    /// List recent runs of a service
    List {
        /// Service name
        service: String,
        /// Maximum number of runs to show
        #[arg(long, default_value = "10")]
        limit: usize,
    },
    /// Show run details
    Show {
        /// Run ID
        id: String,
        /// Print the run record as JSON
        #[arg(long)]
        json: bool,
    },
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);
    let database_url = cli.database_url.as_deref();

    match cli.command {
        Commands::Run {
            revision,
            config,
            trigger,
        } => {
            let status = commands::run::run(&config, &revision, &trigger, database_url).await?;
            return Ok(ExitCode::from(output::exit_code(status)));
        }
        Commands::Validate { path } => {
            commands::validate(&path)?;
        }
        Commands::Runs { command } => match command {
            RunCommands::List { service, limit } => {
                commands::runs::list(database_url, &service, limit).await?;
            }
            RunCommands::Show { id, json } => {
                commands::runs::show(database_url, &id, json).await?;
            }
        },
        Commands::State { service } => {
            commands::state(database_url, &service).await?;
        }
        Commands::Rollback { service, config } => {
            commands::rollback(&config, &service, database_url).await?;
        }
    }

    Ok(ExitCode::SUCCESS)
}

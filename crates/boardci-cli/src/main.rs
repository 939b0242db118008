//! boardci CLI tool.

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod commands;

#[derive(Parser)]
#[command(name = "boardci")]
#[command(about = "Board CI command line", long_about = None)]
struct Cli {
    /// API server URL
    #[arg(long, env = "BOARDCI_API_URL", default_value = "http://localhost:5000")]
    api_url: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate stage definitions (a file or a directory of `*.kdl` files)
    Validate {
        #[arg(default_value = "jobdefs")]
        path: PathBuf,
    },
    /// Run one job locally against this machine's shell
    Run(RunArgs),
    /// Inspect and control jobs on a running server
    Jobs {
        #[command(subcommand)]
        command: JobCommands,
    },
}

#[derive(Args)]
pub struct RunArgs {
    /// Stage definitions (a file or a directory)
    #[arg(long, default_value = "jobdefs")]
    definitions: PathBuf,
    /// System configuration; only the shell and power settings are used
    #[arg(long, env = "BOARDCI_CONFIG")]
    config: Option<PathBuf>,
    /// Directory for per-stage log files
    #[arg(long, default_value = "logs")]
    log_dir: PathBuf,
    /// Project, as "owner/name"
    #[arg(long, default_value = "local/project")]
    project: String,
    #[arg(long, default_value = "0")]
    change: u64,
    #[arg(long, default_value = "0")]
    unique_id: u64,
    /// Commit to build
    #[arg(long, default_value = "HEAD")]
    sha: String,
    #[arg(long, default_value = "")]
    clone_url: String,
    #[arg(long, default_value = "")]
    branch: String,
}

#[derive(Subcommand)]
enum JobCommands {
    /// Show the queue and recent jobs
    List {
        /// Maximum number of recent jobs to show
        #[arg(long, default_value = "20")]
        limit: usize,
    },
    /// Cancel a queued or running job
    Cancel { unique_id: u64, sha: String },
    /// Queue a job again
    Restart { unique_id: u64, sha: String },
    /// Print the stage logs of a job
    Logs { unique_id: u64, sha: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Validate { path } => {
            commands::validate(&path)?;
        }
        Commands::Run(args) => {
            commands::run::run_local(args).await?;
        }
        Commands::Jobs { command } => match command {
            JobCommands::List { limit } => {
                commands::jobs::list(&cli.api_url, limit).await?;
            }
            JobCommands::Cancel { unique_id, sha } => {
                commands::jobs::cancel(&cli.api_url, unique_id, &sha).await?;
            }
            JobCommands::Restart { unique_id, sha } => {
                commands::jobs::restart(&cli.api_url, unique_id, &sha).await?;
            }
            JobCommands::Logs { unique_id, sha } => {
                commands::jobs::logs(&cli.api_url, unique_id, &sha).await?;
            }
        },
    }

    Ok(())
}

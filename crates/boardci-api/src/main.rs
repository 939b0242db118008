//! boardci API server

use anyhow::Context;
use boardci_api::services::{GitHubStatusSink, LogStatusSink};
use boardci_api::{AppState, routes};
use boardci_config::load_system_config;
use boardci_core::status::StatusSink;
use boardci_core::store::JobStore;
use boardci_db::{MemoryStore, PgJobStore, create_pool, run_migrations};
use boardci_executor::{BoardPower, PtySessionFactory};
use boardci_scheduler::{Definitions, PersistPolicy, PipelineRunner, Reporter, Scheduler};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "boardci-server")]
#[command(about = "Runs pull request jobs on a development board", long_about = None)]
struct Args {
    /// System configuration file
    #[arg(long, env = "BOARDCI_CONFIG", default_value = "boardci.kdl")]
    config: PathBuf,

    /// Override the listen address from the configuration
    #[arg(long)]
    listen: Option<String>,

    /// Emit logs as JSON lines
    #[arg(long)]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if args.json_logs {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    let config = load_system_config(&args.config)
        .with_context(|| format!("Failed to load {}", args.config.display()))?;
    let shutdown = CancellationToken::new();

    let store: Arc<dyn JobStore> = match &config.database_url {
        Some(url) => {
            info!("Connecting to database...");
            let pool = create_pool(url).await.context("Failed to connect to database")?;
            run_migrations(&pool).await.context("Failed to run migrations")?;
            info!("Database connected");
            Arc::new(PgJobStore::new(pool))
        }
        None => {
            warn!("No database configured, job records are kept in memory");
            Arc::new(MemoryStore::new())
        }
    };

    let sink: Arc<dyn StatusSink> = match &config.github.token {
        Some(token) => Arc::new(GitHubStatusSink::new(
            &config.github.api_url,
            token.clone(),
            config.github.context.clone(),
        )),
        None => {
            warn!("No GitHub token configured, statuses are only logged");
            Arc::new(LogStatusSink)
        }
    };

    let reporter = Arc::new(
        Reporter::new(
            store,
            sink,
            PersistPolicy {
                attempts: config.persist_attempts,
                ..PersistPolicy::default()
            },
            shutdown.clone(),
        )
        .with_public_url(config.server.public_url.clone()),
    );

    let sessions = Arc::new(PtySessionFactory::new(config.shell.clone()));
    let mut runner = PipelineRunner::new(
        Definitions::Directory(config.definitions.clone()),
        sessions,
        &config.log_dir,
    );
    if let Some(relay) = &config.relay {
        info!(command = %relay.command.display(), "Board power is relay controlled");
        runner = runner.with_device(Arc::new(BoardPower::from_config(relay)), config.power);
    }

    let scheduler = Scheduler::new(runner, reporter);
    let state = AppState::new(scheduler.handle(), config.github.webhook_secret.clone());
    let scheduler_task = tokio::spawn(scheduler.run());

    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupted, shutting down");
            signal_token.cancel();
        }
    });

    let app = routes::router(state).layer(TraceLayer::new_for_http());

    let addr = args.listen.unwrap_or(config.server.listen);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    info!("Starting server on {}", addr);

    let server_token = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { server_token.cancelled().await })
        .await?;

    // A running job stops at its next check point before the scheduler exits.
    scheduler_task.await.context("Scheduler task failed")?;
    info!("Stopped");
    Ok(())
}

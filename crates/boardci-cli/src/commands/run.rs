//! Local job execution command.

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use boardci_config::{ShellConfig, load_system_config};
use boardci_core::status::{NotifyState, StatusSink, StatusUpdate};
use boardci_core::store::JobStore;
use boardci_core::{Job, JobDescriptor, JobStatus};
use boardci_db::MemoryStore;
use boardci_executor::{BoardPower, PtySessionFactory};
use boardci_scheduler::{Definitions, PersistPolicy, PipelineRunner, Reporter};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::RunArgs;

/// Prints notifications to the terminal.
struct ConsoleSink;

#[async_trait]
impl StatusSink for ConsoleSink {
    async fn notify(&self, update: StatusUpdate) -> boardci_core::Result<()> {
        let marker = match update.state {
            NotifyState::Pending => "○",
            NotifyState::Running => "▶",
            NotifyState::Success => "✓",
            NotifyState::Failure => "✗",
        };
        println!("{} {}", marker, update.message);
        Ok(())
    }
}

/// Run every stage of one job against a local shell.
pub async fn run_local(args: RunArgs) -> Result<()> {
    let pipelines = super::load(&args.definitions)?;

    let system = args
        .config
        .as_deref()
        .map(load_system_config)
        .transpose()
        .context("Failed to load system configuration")?;
    let shell = system
        .as_ref()
        .map(|c| c.shell.clone())
        .unwrap_or_else(ShellConfig::default);

    let descriptor = JobDescriptor {
        unique_id: args.unique_id,
        change_number: args.change,
        project_name: args
            .project
            .rsplit('/')
            .next()
            .unwrap_or(&args.project)
            .to_string(),
        project_full_name: args.project.clone(),
        commit_ref: args.sha.clone(),
        clone_url: args.clone_url.clone(),
        branch: args.branch.clone(),
    };

    let store = Arc::new(MemoryStore::new());
    let reporter = Reporter::new(
        store.clone(),
        Arc::new(ConsoleSink),
        PersistPolicy::default(),
        CancellationToken::new(),
    );

    let mut runner = PipelineRunner::new(
        Definitions::Fixed(pipelines),
        Arc::new(PtySessionFactory::new(shell)),
        &args.log_dir,
    );
    if let Some(config) = &system {
        if let Some(relay) = &config.relay {
            runner = runner.with_device(Arc::new(BoardPower::from_config(relay)), config.power);
        }
    }

    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            println!("Interrupted, stopping after the current command");
            interrupt.cancel();
        }
    });

    // Started by hand, so nothing supersedes it.
    let job = Job::new(descriptor, true);
    println!("Running {} ({})", job.identity, args.definitions.display());
    let status = runner.run(&job, &cancel, &reporter).await?;

    println!("\n--- Stage Summary ---");
    for log in store.logs(&job.identity).await? {
        println!("  {} - {} lines", log.stage_name, log.transcript.lines().count());
    }
    println!("Logs written to {}", args.log_dir.display());

    match status {
        JobStatus::Success => {
            println!("\n✓ Job succeeded!");
            Ok(())
        }
        other => bail!("Job {}", other),
    }
}

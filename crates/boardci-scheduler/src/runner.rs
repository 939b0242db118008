//! Pipeline runner - drives every stage of one job against fresh shell sessions.

use boardci_config::{JobVariables, PowerPolicy, load_definitions};
use boardci_core::device::{Device, PowerAction};
use boardci_core::pipeline::{Pipeline, StageOutcome, StageResult};
use boardci_core::session::SessionFactory;
use boardci_core::status::NotifyState;
use boardci_core::{Error, Job, JobStatus, Result};
use boardci_executor::{ShellState, StageExecutor, prepare_session};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::reporter::Reporter;

/// Where the stage definitions of a run come from.
#[derive(Debug, Clone)]
pub enum Definitions {
    /// Every `*.kdl` file in this directory, re-read for each run.
    Directory(PathBuf),
    /// Already parsed definitions.
    Fixed(Vec<Pipeline>),
}

impl Definitions {
    fn load(&self) -> Result<Vec<Pipeline>> {
        match self {
            Definitions::Directory(dir) => {
                load_definitions(dir).map_err(|e| Error::InvalidInput(e.to_string()))
            }
            Definitions::Fixed(pipelines) => Ok(pipelines.clone()),
        }
    }
}

/// Runs all stages of one job and decides its final status.
pub struct PipelineRunner {
    definitions: Definitions,
    sessions: Arc<dyn SessionFactory>,
    log_dir: PathBuf,
    device: Option<Arc<dyn Device>>,
    power: PowerPolicy,
}

impl PipelineRunner {
    pub fn new(
        definitions: Definitions,
        sessions: Arc<dyn SessionFactory>,
        log_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            definitions,
            sessions,
            log_dir: log_dir.into(),
            device: None,
            power: PowerPolicy::default(),
        }
    }

    /// Apply `power` to `device` around every run.
    pub fn with_device(mut self, device: Arc<dyn Device>, power: PowerPolicy) -> Self {
        self.device = Some(device);
        self.power = power;
        self
    }

    /// Run `job` to completion and record its terminal status.
    ///
    /// Only a failure to persist a status is returned as an error; everything that
    /// goes wrong with the job itself ends up in the returned status.
    pub async fn run(
        &self,
        job: &Job,
        cancel: &CancellationToken,
        reporter: &Reporter,
    ) -> Result<JobStatus> {
        let identity = &job.identity;
        let started = Instant::now();
        info!(job = %identity, run = %job.run_id.short(), "Starting job");

        reporter.persist(identity, JobStatus::Running, None).await?;
        reporter
            .notify(identity, NotifyState::Running, "Job running!")
            .await;
        if let Err(e) = reporter.store().clear_logs(identity).await {
            warn!(job = %identity, error = %e, "Failed to clear previous logs");
        }

        let status = match self.prepare_device(job, reporter).await {
            Ok(()) => self.run_pipelines(job, cancel, reporter).await,
            Err(status) => status,
        };
        self.release_device(job).await;

        let run_time = started.elapsed();
        reporter.persist(identity, status, Some(run_time)).await?;
        if status == JobStatus::Success {
            reporter
                .notify(identity, NotifyState::Success, "All good!")
                .await;
        }

        info!(job = %identity, %status, ?run_time, "Job finished");
        Ok(status)
    }

    async fn prepare_device(
        &self,
        job: &Job,
        reporter: &Reporter,
    ) -> std::result::Result<(), JobStatus> {
        let Some(device) = &self.device else {
            return Ok(());
        };
        if let Err(e) = self.power.before.apply(device.as_ref()).await {
            error!(job = %job.identity, error = %e, "Failed to prepare the board");
            reporter
                .notify(
                    &job.identity,
                    NotifyState::Failure,
                    &format!("Board power failed: {}", e),
                )
                .await;
            return Err(JobStatus::Failed);
        }
        Ok(())
    }

    async fn release_device(&self, job: &Job) {
        let Some(device) = &self.device else {
            return;
        };
        if self.power.before == PowerAction::Recovery {
            if let Err(e) = device.leave_recovery().await {
                warn!(job = %job.identity, error = %e, "Failed to leave recovery mode");
            }
        }
        if let Err(e) = self.power.after.apply(device.as_ref()).await {
            warn!(job = %job.identity, error = %e, "Failed to apply post-run power action");
        }
    }

    async fn run_pipelines(
        &self,
        job: &Job,
        cancel: &CancellationToken,
        reporter: &Reporter,
    ) -> JobStatus {
        let identity = &job.identity;

        let pipelines = match self.definitions.load() {
            Ok(pipelines) => pipelines,
            Err(e) => {
                error!(job = %identity, error = %e, "Failed to load stage definitions");
                reporter
                    .notify(
                        identity,
                        NotifyState::Failure,
                        &format!("Configuration error: {}", e),
                    )
                    .await;
                return JobStatus::Failed;
            }
        };

        let variables = JobVariables::from_descriptor(&job.descriptor);
        let executor = StageExecutor::new(cancel.clone());
        let mut state = ShellState::new();
        let mut status = JobStatus::Success;
        let nested_logs = pipelines.len() > 1;

        for pipeline in &pipelines {
            for stage in &pipeline.stages {
                if cancel.is_cancelled() {
                    if status == JobStatus::Success {
                        status = self.cancelled(job, &stage.name, reporter).await;
                    }
                    return status;
                }
                if status == JobStatus::Failed && !stage.always {
                    info!(job = %identity, stage = %stage.name, "Skipping stage after failure");
                    continue;
                }

                let qualified = format!("{}/{}", pipeline.name, stage.name);

                let mut session = match self.sessions.open().await {
                    Ok(session) => session,
                    Err(e) => {
                        error!(job = %identity, stage = %qualified, error = %e, "Could not open a shell");
                        if status == JobStatus::Success {
                            let message = if e.is_configuration() {
                                format!("Configuration error in stage {}: {}", qualified, e)
                            } else {
                                format!("Stage {} could not start: {}", qualified, e)
                            };
                            reporter
                                .notify(identity, NotifyState::Failure, &message)
                                .await;
                        }
                        return JobStatus::Failed;
                    }
                };

                let result = match prepare_session(session.as_mut(), &variables, &state).await {
                    Ok(()) => executor.run(stage, session.as_mut(), &mut state).await,
                    Err(e) => {
                        warn!(job = %identity, stage = %qualified, error = %e, "Shell setup failed");
                        StageResult {
                            name: stage.name.clone(),
                            transcript: format!("{}\n[boardci] {}\n", session.take_transcript(), e),
                            outcome: StageOutcome::Failed { index: 0 },
                        }
                    }
                };
                session.close().await;

                let log_path = if nested_logs {
                    self.log_dir.join(&pipeline.name).join(format!("{}.log", stage.name))
                } else {
                    self.log_dir.join(format!("{}.log", stage.name))
                };
                write_log_file(&log_path, &result.transcript).await;
                reporter
                    .append_log(identity, &qualified, &result.transcript)
                    .await;

                match result.outcome {
                    StageOutcome::Success => {
                        info!(job = %identity, stage = %qualified, "Stage passed");
                    }
                    StageOutcome::Failed { index } => {
                        info!(job = %identity, stage = %qualified, index, "Stage failed");
                        if status == JobStatus::Success {
                            status = JobStatus::Failed;
                            reporter
                                .notify(
                                    identity,
                                    NotifyState::Failure,
                                    &format!("Stage {} failed!", qualified),
                                )
                                .await;
                        }
                    }
                    StageOutcome::Cancelled { .. } => {
                        if status == JobStatus::Success {
                            status = self.cancelled(job, &qualified, reporter).await;
                        }
                        return status;
                    }
                }
            }
        }

        status
    }

    async fn cancelled(&self, job: &Job, stage: &str, reporter: &Reporter) -> JobStatus {
        info!(job = %job.identity, stage, "Job cancelled");
        reporter
            .notify(
                &job.identity,
                NotifyState::Failure,
                &format!("Job was stopped (stage {})!", stage),
            )
            .await;
        JobStatus::Cancelled
    }
}

async fn write_log_file(path: &Path, transcript: &str) {
    if let Some(parent) = path.parent() {
        if let Err(e) = tokio::fs::create_dir_all(parent).await {
            warn!(path = %parent.display(), error = %e, "Failed to create log directory");
            return;
        }
    }
    if let Err(e) = tokio::fs::write(path, transcript).await {
        warn!(path = %path.display(), error = %e, "Failed to write stage log");
    }
}

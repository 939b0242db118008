//! The scheduling loop and the handle callers submit work through.

use boardci_core::status::NotifyState;
use boardci_core::{Error, Job, JobDescriptor, JobIdentity, JobStatus, Result, RunId};
use std::sync::Arc;
use tokio::sync::{Mutex, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::queue::{JobQueue, QueueSnapshot};
use crate::reporter::Reporter;
use crate::runner::PipelineRunner;

struct Shared {
    queue: Mutex<JobQueue>,
    wake: Notify,
    reporter: Arc<Reporter>,
}

/// What `cancel` did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// Removed from the queue and recorded as cancelled.
    Dequeued,
    /// Running; it stops at the next check point.
    Signalled,
    /// Queued again behind its own running copy: the queued entries were removed
    /// and the running one stops at the next check point.
    DequeuedAndSignalled,
    /// Neither queued nor running; recorded as cancelled anyway.
    Acknowledged,
}

/// Owns the queue and runs one job at a time.
pub struct Scheduler {
    shared: Arc<Shared>,
    runner: Arc<PipelineRunner>,
}

/// Cloneable front door to the scheduler.
#[derive(Clone)]
pub struct SchedulerHandle {
    shared: Arc<Shared>,
}

impl Scheduler {
    pub fn new(runner: PipelineRunner, reporter: Arc<Reporter>) -> Self {
        Self {
            shared: Arc::new(Shared {
                queue: Mutex::new(JobQueue::new()),
                wake: Notify::new(),
                reporter,
            }),
            runner: Arc::new(runner),
        }
    }

    pub fn handle(&self) -> SchedulerHandle {
        SchedulerHandle {
            shared: self.shared.clone(),
        }
    }

    /// Run jobs until the reporter's shutdown token fires.
    pub async fn run(self) {
        let shutdown = self.shared.reporter.shutdown_token().clone();
        info!("Scheduler started");

        while !shutdown.is_cancelled() {
            let next = self.shared.queue.lock().await.start_next();
            match next {
                Some((job, cancel)) => {
                    let status = self.execute(job.clone(), cancel).await;
                    self.shared.queue.lock().await.finish(&job.identity, status);
                }
                None => {
                    tokio::select! {
                        _ = self.shared.wake.notified() => {}
                        _ = shutdown.cancelled() => {}
                    }
                }
            }
        }

        info!("Scheduler stopped");
    }

    /// Run one job on its own task and turn whatever happens into a terminal status.
    async fn execute(&self, job: Job, cancel: CancellationToken) -> JobStatus {
        let runner = self.runner.clone();
        let reporter = self.shared.reporter.clone();
        let task_job = job.clone();
        let task_cancel = cancel.clone();
        let mut handle =
            tokio::spawn(async move { runner.run(&task_job, &task_cancel, &reporter).await });

        let shutdown = self.shared.reporter.shutdown_token();
        let finished = tokio::select! {
            joined = &mut handle => Some(joined),
            _ = shutdown.cancelled() => None,
        };
        let joined = match finished {
            Some(joined) => joined,
            None => {
                info!(job = %job.identity, "Stopping running job for shutdown");
                cancel.cancel();
                handle.await
            }
        };

        let reporter = &self.shared.reporter;
        match joined {
            Ok(Ok(status)) => status,
            Ok(Err(e)) => {
                // The runner only fails when a status write failed for good, at
                // which point shutdown is already under way.
                error!(job = %job.identity, error = %e, "Job aborted");
                JobStatus::Failed
            }
            Err(e) => {
                error!(job = %job.identity, error = %e, "Job runner panicked");
                if reporter
                    .persist(&job.identity, JobStatus::Failed, None)
                    .await
                    .is_ok()
                {
                    reporter
                        .notify(&job.identity, NotifyState::Failure, "Internal error")
                        .await;
                }
                JobStatus::Failed
            }
        }
    }
}

impl SchedulerHandle {
    /// Queue a job for `descriptor`, superseding older automatic jobs of the same
    /// change.
    pub async fn submit(&self, descriptor: JobDescriptor, user_initiated: bool) -> Result<RunId> {
        let job = Job::new(descriptor, user_initiated);
        let run_id = job.run_id;
        let reporter = &self.shared.reporter;

        let mut queue = self.shared.queue.lock().await;
        info!(job = %job.identity, run = %run_id.short(), user_initiated, "Submitting job");

        reporter.register(&job.descriptor).await?;
        let identity = job.identity.clone();
        let submitted = queue.submit(job);

        for old in &submitted.superseded {
            reporter
                .persist(&old.identity, JobStatus::Cancelled, None)
                .await?;
            reporter
                .notify(&old.identity, NotifyState::Failure, "Job cancelled!")
                .await;
        }
        if let Some(stopped) = &submitted.stopped {
            info!(job = %stopped, by = %identity, "Running job will stop");
        }

        reporter.persist(&identity, JobStatus::Pending, None).await?;
        reporter
            .notify(&identity, NotifyState::Pending, "Job added to queue")
            .await;
        drop(queue);

        self.shared.wake.notify_one();
        Ok(run_id)
    }

    /// Cancel `identity` wherever it is. Cancelling something that is not active
    /// still records it as cancelled.
    pub async fn cancel(&self, identity: &JobIdentity) -> Result<CancelOutcome> {
        let reporter = &self.shared.reporter;
        let mut queue = self.shared.queue.lock().await;

        let cancelled = queue.cancel(identity);
        let dequeued = !cancelled.dequeued.is_empty();
        if dequeued {
            info!(job = %identity, removed = cancelled.dequeued.len(), "Removed from queue");
        }
        if cancelled.signalled {
            // The runner records and reports the cancellation when it stops.
            info!(job = %identity, "Stop requested for running job");
            return Ok(if dequeued {
                CancelOutcome::DequeuedAndSignalled
            } else {
                CancelOutcome::Signalled
            });
        }

        let outcome = if dequeued {
            CancelOutcome::Dequeued
        } else {
            info!(job = %identity, "Cancel for inactive job");
            CancelOutcome::Acknowledged
        };

        reporter
            .persist(identity, JobStatus::Cancelled, None)
            .await?;
        reporter
            .notify(identity, NotifyState::Failure, "Job cancelled!")
            .await;
        Ok(outcome)
    }

    /// Queue the stored job for `identity` again, on behalf of a user.
    pub async fn restart(&self, identity: &JobIdentity) -> Result<RunId> {
        let descriptor = self
            .shared
            .reporter
            .store()
            .get_descriptor(identity)
            .await?
            .ok_or_else(|| Error::NotFound(format!("job {}", identity)))?;
        self.submit(descriptor, true).await
    }

    pub async fn snapshot(&self) -> QueueSnapshot {
        self.shared.queue.lock().await.snapshot()
    }

    /// Latest status the scheduler knows of, falling back to the store.
    pub async fn status(&self, identity: &JobIdentity) -> Result<Option<JobStatus>> {
        if let Some(status) = self.shared.queue.lock().await.status(identity) {
            return Ok(Some(status));
        }
        match self.shared.reporter.store().get_record(identity).await {
            Ok(record) => Ok(record.map(|r| r.status)),
            Err(e) => {
                warn!(job = %identity, error = %e, "Failed to read job record");
                Err(e)
            }
        }
    }

    pub fn reporter(&self) -> &Arc<Reporter> {
        &self.shared.reporter
    }
}

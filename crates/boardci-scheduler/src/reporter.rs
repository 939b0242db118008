//! Persisting job status and notifying the status tracker.

use boardci_core::status::{NotifyState, StatusSink, StatusUpdate};
use boardci_core::store::JobStore;
use boardci_core::{Error, JobDescriptor, JobIdentity, JobStatus, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

/// Retry policy for status writes.
#[derive(Debug, Clone, Copy)]
pub struct PersistPolicy {
    pub attempts: u32,
    /// Delay before the second attempt; doubled for every further attempt.
    pub backoff: Duration,
}

impl Default for PersistPolicy {
    fn default() -> Self {
        Self {
            attempts: 5,
            backoff: Duration::from_millis(200),
        }
    }
}

/// Writes status transitions to the store and forwards them to the status sink.
///
/// A status write that still fails after every retry triggers `shutdown`: the
/// service cannot keep scheduling jobs it is unable to account for.
pub struct Reporter {
    store: Arc<dyn JobStore>,
    sink: Arc<dyn StatusSink>,
    policy: PersistPolicy,
    public_url: Option<String>,
    shutdown: CancellationToken,
}

impl Reporter {
    pub fn new(
        store: Arc<dyn JobStore>,
        sink: Arc<dyn StatusSink>,
        policy: PersistPolicy,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            store,
            sink,
            policy,
            public_url: None,
            shutdown,
        }
    }

    /// Link notifications to the log view under `public_url`.
    pub fn with_public_url(mut self, public_url: Option<String>) -> Self {
        self.public_url = public_url;
        self
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    pub async fn register(&self, descriptor: &JobDescriptor) -> Result<()> {
        let identity = descriptor.identity();
        self.with_retries(&identity, "register", || self.store.register(descriptor))
            .await
    }

    /// Record `status` for `identity`, retrying with exponential backoff.
    pub async fn persist(
        &self,
        identity: &JobIdentity,
        status: JobStatus,
        run_time: Option<Duration>,
    ) -> Result<()> {
        self.with_retries(identity, status.as_str(), || {
            self.store.record(identity, status, run_time)
        })
        .await
    }

    /// Store a stage transcript. Failures are logged; they never fail the job.
    pub async fn append_log(&self, identity: &JobIdentity, stage_name: &str, transcript: &str) {
        if let Err(e) = self.store.append_log(identity, stage_name, transcript).await {
            warn!(job = %identity, stage = %stage_name, error = %e, "Failed to store stage log");
        }
    }

    /// Tell the status tracker. Failures are logged and otherwise ignored.
    pub async fn notify(&self, identity: &JobIdentity, state: NotifyState, message: &str) {
        let update = StatusUpdate {
            identity: identity.clone(),
            state,
            message: message.to_string(),
            target_url: self.target_url(identity),
        };
        if let Err(e) = self.sink.notify(update).await {
            warn!(job = %identity, %state, error = %e, "Status notification failed");
        }
    }

    fn target_url(&self, identity: &JobIdentity) -> Option<String> {
        self.public_url.as_ref().map(|base| {
            format!(
                "{}/api/v1/jobs/{}/{}/logs",
                base, identity.unique_id, identity.commit_ref
            )
        })
    }

    async fn with_retries<F, Fut>(&self, identity: &JobIdentity, what: &str, op: F) -> Result<()>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<()>>,
    {
        let attempts = self.policy.attempts.max(1);
        let mut delay = self.policy.backoff;
        let mut last_error = None;

        for attempt in 1..=attempts {
            match op().await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    warn!(job = %identity, what, attempt, attempts, error = %e, "Status write failed");
                    last_error = Some(e);
                }
            }
            if attempt < attempts {
                tokio::time::sleep(delay).await;
                delay = delay.saturating_mul(2);
            }
        }

        let e = last_error.unwrap_or_else(|| Error::Store("no attempts made".to_string()));
        error!(job = %identity, what, error = %e, "Giving up on status write, shutting down");
        self.shutdown.cancel();
        Err(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{FlakyStore, RecordingSink};
    use boardci_db::MemoryStore;

    fn identity() -> JobIdentity {
        JobIdentity {
            project_full_name: "OP-TEE/optee_os".to_string(),
            change_number: 42,
            unique_id: 7,
            commit_ref: "aaa".to_string(),
        }
    }

    fn policy(attempts: u32) -> PersistPolicy {
        PersistPolicy {
            attempts,
            backoff: Duration::from_millis(1),
        }
    }

    #[tokio::test]
    async fn test_persist_retries_then_succeeds() {
        let store = Arc::new(FlakyStore::new(2));
        let shutdown = CancellationToken::new();
        let reporter = Reporter::new(
            store.clone(),
            Arc::new(RecordingSink::default()),
            policy(3),
            shutdown.clone(),
        );

        reporter
            .persist(&identity(), JobStatus::Running, None)
            .await
            .unwrap();
        assert!(!shutdown.is_cancelled());
        let record = store.inner.get_record(&identity()).await.unwrap().unwrap();
        assert_eq!(record.status, JobStatus::Running);
    }

    #[tokio::test]
    async fn test_exhausted_retries_trigger_shutdown() {
        let shutdown = CancellationToken::new();
        let reporter = Reporter::new(
            Arc::new(FlakyStore::new(10)),
            Arc::new(RecordingSink::default()),
            policy(3),
            shutdown.clone(),
        );

        let result = reporter.persist(&identity(), JobStatus::Failed, None).await;
        assert!(matches!(result, Err(Error::Store(_))));
        assert!(shutdown.is_cancelled());
    }

    #[tokio::test]
    async fn test_notification_links_to_logs() {
        let sink = Arc::new(RecordingSink::default());
        let reporter = Reporter::new(
            Arc::new(MemoryStore::new()),
            sink.clone(),
            policy(1),
            CancellationToken::new(),
        )
        .with_public_url(Some("https://ci.example.com".to_string()));

        reporter
            .notify(&identity(), NotifyState::Pending, "Job added to queue")
            .await;

        let updates = sink.updates.lock().unwrap();
        assert_eq!(
            updates[0].target_url.as_deref(),
            Some("https://ci.example.com/api/v1/jobs/7/aaa/logs")
        );
    }
}

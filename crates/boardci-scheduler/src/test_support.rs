//! Fakes shared by the scheduler tests.

use async_trait::async_trait;
use boardci_core::status::{NotifyState, StatusSink, StatusUpdate};
use boardci_core::store::{JobRecord, JobStore, LogRecord};
use boardci_core::{Error, JobDescriptor, JobIdentity, JobStatus, Result};
use boardci_db::MemoryStore;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

/// Fails the first `failures` status writes, then delegates.
pub struct FlakyStore {
    pub inner: MemoryStore,
    pub failures: AtomicU32,
}

impl FlakyStore {
    pub fn new(failures: u32) -> Self {
        Self {
            inner: MemoryStore::new(),
            failures: AtomicU32::new(failures),
        }
    }
}

#[async_trait]
impl JobStore for FlakyStore {
    async fn register(&self, descriptor: &JobDescriptor) -> Result<()> {
        self.inner.register(descriptor).await
    }

    async fn record(
        &self,
        identity: &JobIdentity,
        status: JobStatus,
        run_time: Option<Duration>,
    ) -> Result<()> {
        let remaining = self.failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures.store(remaining - 1, Ordering::SeqCst);
            return Err(Error::Store("connection reset".to_string()));
        }
        self.inner.record(identity, status, run_time).await
    }

    async fn append_log(&self, identity: &JobIdentity, stage: &str, t: &str) -> Result<()> {
        self.inner.append_log(identity, stage, t).await
    }

    async fn clear_logs(&self, identity: &JobIdentity) -> Result<()> {
        self.inner.clear_logs(identity).await
    }

    async fn logs(&self, identity: &JobIdentity) -> Result<Vec<LogRecord>> {
        self.inner.logs(identity).await
    }

    async fn get_descriptor(&self, identity: &JobIdentity) -> Result<Option<JobDescriptor>> {
        self.inner.get_descriptor(identity).await
    }

    async fn find_identity(&self, id: u64, sha: &str) -> Result<Option<JobIdentity>> {
        self.inner.find_identity(id, sha).await
    }

    async fn get_record(&self, identity: &JobIdentity) -> Result<Option<JobRecord>> {
        self.inner.get_record(identity).await
    }

    async fn list_jobs(&self, limit: usize) -> Result<Vec<JobRecord>> {
        self.inner.list_jobs(limit).await
    }
}

/// Collects every notification.
#[derive(Default)]
pub struct RecordingSink {
    pub updates: Mutex<Vec<StatusUpdate>>,
}

impl RecordingSink {
    pub fn states_for(&self, identity: &JobIdentity) -> Vec<(NotifyState, String)> {
        self.updates
            .lock()
            .unwrap()
            .iter()
            .filter(|u| &u.identity == identity)
            .map(|u| (u.state, u.message.clone()))
            .collect()
    }
}

#[async_trait]
impl StatusSink for RecordingSink {
    async fn notify(&self, update: StatusUpdate) -> Result<()> {
        self.updates.lock().unwrap().push(update);
        Ok(())
    }
}

pub fn descriptor(unique_id: u64, change: u64, sha: &str) -> JobDescriptor {
    JobDescriptor {
        unique_id,
        change_number: change,
        project_name: "optee_os".to_string(),
        project_full_name: "OP-TEE/optee_os".to_string(),
        commit_ref: sha.to_string(),
        clone_url: "https://github.com/someone/optee_os.git".to_string(),
        branch: "fix-boot".to_string(),
    }
}

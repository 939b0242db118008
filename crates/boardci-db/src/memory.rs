//! In-memory job store, used by tests and local runs.

use async_trait::async_trait;
use boardci_core::store::{JobRecord, JobStore, LogRecord};
use boardci_core::{JobDescriptor, JobIdentity, JobStatus, Result};
use chrono::Utc;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::RwLock;

#[derive(Default)]
struct Inner {
    descriptors: HashMap<JobIdentity, JobDescriptor>,
    records: HashMap<JobIdentity, JobRecord>,
    logs: HashMap<JobIdentity, Vec<LogRecord>>,
}

/// Keeps everything in process memory; nothing survives a restart.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobStore for MemoryStore {
    async fn register(&self, descriptor: &JobDescriptor) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner
            .descriptors
            .insert(descriptor.identity(), descriptor.clone());
        Ok(())
    }

    async fn record(
        &self,
        identity: &JobIdentity,
        status: JobStatus,
        run_time: Option<Duration>,
    ) -> Result<()> {
        let now = Utc::now();
        let mut inner = self.inner.write().await;
        let record = inner
            .records
            .entry(identity.clone())
            .or_insert_with(|| JobRecord {
                identity: identity.clone(),
                status,
                started_at: None,
                run_time: None,
                updated_at: now,
            });

        record.status = status;
        record.run_time = run_time;
        record.updated_at = now;
        if status == JobStatus::Running {
            record.started_at = Some(now);
        }
        Ok(())
    }

    async fn append_log(
        &self,
        identity: &JobIdentity,
        stage_name: &str,
        transcript: &str,
    ) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner
            .logs
            .entry(identity.clone())
            .or_default()
            .push(LogRecord {
                stage_name: stage_name.to_string(),
                transcript: transcript.to_string(),
                created_at: Utc::now(),
            });
        Ok(())
    }

    async fn clear_logs(&self, identity: &JobIdentity) -> Result<()> {
        self.inner.write().await.logs.remove(identity);
        Ok(())
    }

    async fn logs(&self, identity: &JobIdentity) -> Result<Vec<LogRecord>> {
        Ok(self
            .inner
            .read()
            .await
            .logs
            .get(identity)
            .cloned()
            .unwrap_or_default())
    }

    async fn get_descriptor(&self, identity: &JobIdentity) -> Result<Option<JobDescriptor>> {
        Ok(self.inner.read().await.descriptors.get(identity).cloned())
    }

    async fn find_identity(
        &self,
        unique_id: u64,
        commit_ref: &str,
    ) -> Result<Option<JobIdentity>> {
        let inner = self.inner.read().await;
        Ok(inner
            .descriptors
            .keys()
            .chain(inner.records.keys())
            .find(|id| id.unique_id == unique_id && id.commit_ref == commit_ref)
            .cloned())
    }

    async fn get_record(&self, identity: &JobIdentity) -> Result<Option<JobRecord>> {
        Ok(self.inner.read().await.records.get(identity).cloned())
    }

    async fn list_jobs(&self, limit: usize) -> Result<Vec<JobRecord>> {
        let inner = self.inner.read().await;
        let mut records: Vec<JobRecord> = inner.records.values().cloned().collect();
        records.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        records.truncate(limit);
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(unique_id: u64, sha: &str) -> JobDescriptor {
        JobDescriptor {
            unique_id,
            change_number: 42,
            project_name: "optee_os".to_string(),
            project_full_name: "OP-TEE/optee_os".to_string(),
            commit_ref: sha.to_string(),
            clone_url: "https://github.com/someone/optee_os.git".to_string(),
            branch: "fix-boot".to_string(),
        }
    }

    #[tokio::test]
    async fn test_register_and_resolve() {
        let store = MemoryStore::new();
        let d = descriptor(7, "aaa1111");
        store.register(&d).await.unwrap();

        let identity = store.find_identity(7, "aaa1111").await.unwrap().unwrap();
        assert_eq!(identity, d.identity());
        assert_eq!(store.get_descriptor(&identity).await.unwrap(), Some(d));
        assert!(store.find_identity(7, "bbb").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_record_stamps_start_time() {
        let store = MemoryStore::new();
        let identity = descriptor(7, "aaa").identity();

        store.record(&identity, JobStatus::Pending, None).await.unwrap();
        let pending = store.get_record(&identity).await.unwrap().unwrap();
        assert!(pending.started_at.is_none());

        store.record(&identity, JobStatus::Running, None).await.unwrap();
        store
            .record(&identity, JobStatus::Success, Some(Duration::from_secs(90)))
            .await
            .unwrap();

        let done = store.get_record(&identity).await.unwrap().unwrap();
        assert_eq!(done.status, JobStatus::Success);
        assert!(done.started_at.is_some());
        assert_eq!(done.run_time, Some(Duration::from_secs(90)));
    }

    #[tokio::test]
    async fn test_logs_round_trip_and_clear() {
        let store = MemoryStore::new();
        let identity = descriptor(7, "aaa").identity();

        store
            .append_log(&identity, "hikey/build", "make -j8\r\nDONE\r\n")
            .await
            .unwrap();
        store.append_log(&identity, "hikey/flash", "OKAY\r\n").await.unwrap();

        let logs = store.logs(&identity).await.unwrap();
        assert_eq!(logs.len(), 2);
        assert_eq!(logs[0].stage_name, "hikey/build");
        assert_eq!(logs[0].transcript, "make -j8\r\nDONE\r\n");

        store.clear_logs(&identity).await.unwrap();
        assert!(store.logs(&identity).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_list_jobs_newest_first() {
        let store = MemoryStore::new();
        for (id, sha) in [(1, "aaa"), (2, "bbb"), (3, "ccc")] {
            store
                .record(&descriptor(id, sha).identity(), JobStatus::Pending, None)
                .await
                .unwrap();
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
        store
            .record(&descriptor(1, "aaa").identity(), JobStatus::Running, None)
            .await
            .unwrap();

        let jobs = store.list_jobs(2).await.unwrap();
        assert_eq!(jobs.len(), 2);
        assert_eq!(jobs[0].identity.unique_id, 1);
    }
}

//! Durable storage of job records and stage transcripts.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::{JobDescriptor, JobIdentity, JobStatus, Result};

/// Persisted state of one job identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub identity: JobIdentity,
    pub status: JobStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub run_time: Option<Duration>,
    pub updated_at: DateTime<Utc>,
}

/// A stored stage transcript.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogRecord {
    pub stage_name: String,
    pub transcript: String,
    pub created_at: DateTime<Utc>,
}

#[async_trait]
pub trait JobStore: Send + Sync {
    /// Remember the descriptor of a job so it can be restarted later.
    async fn register(&self, descriptor: &JobDescriptor) -> Result<()>;

    /// Upsert the status of a job. Entering `Running` also stamps `started_at`.
    async fn record(
        &self,
        identity: &JobIdentity,
        status: JobStatus,
        run_time: Option<Duration>,
    ) -> Result<()>;

    /// Append one stage transcript to the job's log archive.
    async fn append_log(&self, identity: &JobIdentity, stage_name: &str, transcript: &str)
    -> Result<()>;

    /// Drop logs left behind by a previous run of the same identity.
    async fn clear_logs(&self, identity: &JobIdentity) -> Result<()>;

    /// Transcripts of the latest run, in append order.
    async fn logs(&self, identity: &JobIdentity) -> Result<Vec<LogRecord>>;

    async fn get_descriptor(&self, identity: &JobIdentity) -> Result<Option<JobDescriptor>>;

    /// Resolve the full identity from the pair used in URLs.
    async fn find_identity(&self, unique_id: u64, commit_ref: &str)
    -> Result<Option<JobIdentity>>;

    async fn get_record(&self, identity: &JobIdentity) -> Result<Option<JobRecord>>;

    /// Most recently updated jobs first.
    async fn list_jobs(&self, limit: usize) -> Result<Vec<JobRecord>>;
}

//! PostgreSQL job store.

use async_trait::async_trait;
use boardci_core::store::{JobRecord, JobStore, LogRecord};
use boardci_core::{JobDescriptor, JobIdentity, JobStatus, Result};
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use sqlx::types::Json;
use std::time::Duration;

use crate::{DbError, DbResult};

#[derive(Debug, sqlx::FromRow)]
struct JobRow {
    unique_id: i64,
    commit_ref: String,
    project_full_name: String,
    change_number: i64,
    status: String,
    started_at: Option<DateTime<Utc>>,
    run_time_ms: Option<i64>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<JobRow> for JobRecord {
    type Error = DbError;

    fn try_from(row: JobRow) -> DbResult<Self> {
        let status = row
            .status
            .parse::<JobStatus>()
            .map_err(|e| DbError::Corrupt(e.to_string()))?;

        Ok(JobRecord {
            identity: JobIdentity {
                project_full_name: row.project_full_name,
                change_number: row.change_number as u64,
                unique_id: row.unique_id as u64,
                commit_ref: row.commit_ref,
            },
            status,
            started_at: row.started_at,
            run_time: row.run_time_ms.map(|ms| Duration::from_millis(ms as u64)),
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct LogRow {
    stage_name: String,
    transcript: String,
    created_at: DateTime<Utc>,
}

/// Job store backed by the `jobs` and `job_logs` tables.
pub struct PgJobStore {
    pool: PgPool,
}

impl PgJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn upsert_status(
        &self,
        identity: &JobIdentity,
        status: JobStatus,
        run_time: Option<Duration>,
    ) -> DbResult<()> {
        sqlx::query(
            r#"
            INSERT INTO jobs (unique_id, commit_ref, project_full_name, change_number, status,
                              started_at, run_time_ms, updated_at)
            VALUES ($1, $2, $3, $4, $5, CASE WHEN $5 = 'running' THEN NOW() END, $6, NOW())
            ON CONFLICT (unique_id, commit_ref) DO UPDATE SET
                status = EXCLUDED.status,
                started_at = COALESCE(EXCLUDED.started_at, jobs.started_at),
                run_time_ms = EXCLUDED.run_time_ms,
                updated_at = NOW()
            "#,
        )
        .bind(identity.unique_id as i64)
        .bind(&identity.commit_ref)
        .bind(&identity.project_full_name)
        .bind(identity.change_number as i64)
        .bind(status.as_str())
        .bind(run_time.map(|d| d.as_millis() as i64))
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn register(&self, descriptor: &JobDescriptor) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO jobs (unique_id, commit_ref, project_full_name, change_number, descriptor)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (unique_id, commit_ref) DO UPDATE SET
                descriptor = EXCLUDED.descriptor,
                updated_at = NOW()
            "#,
        )
        .bind(descriptor.unique_id as i64)
        .bind(&descriptor.commit_ref)
        .bind(&descriptor.project_full_name)
        .bind(descriptor.change_number as i64)
        .bind(Json(descriptor))
        .execute(&self.pool)
        .await
        .map_err(DbError::from)?;
        Ok(())
    }

    async fn record(
        &self,
        identity: &JobIdentity,
        status: JobStatus,
        run_time: Option<Duration>,
    ) -> Result<()> {
        Ok(self.upsert_status(identity, status, run_time).await?)
    }

    async fn append_log(
        &self,
        identity: &JobIdentity,
        stage_name: &str,
        transcript: &str,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO job_logs (id, unique_id, commit_ref, stage_name, transcript, created_at)
            VALUES ($1, $2, $3, $4, $5, NOW())
            "#,
        )
        .bind(uuid::Uuid::now_v7())
        .bind(identity.unique_id as i64)
        .bind(&identity.commit_ref)
        .bind(stage_name)
        .bind(transcript)
        .execute(&self.pool)
        .await
        .map_err(DbError::from)?;
        Ok(())
    }

    async fn clear_logs(&self, identity: &JobIdentity) -> Result<()> {
        sqlx::query("DELETE FROM job_logs WHERE unique_id = $1 AND commit_ref = $2")
            .bind(identity.unique_id as i64)
            .bind(&identity.commit_ref)
            .execute(&self.pool)
            .await
            .map_err(DbError::from)?;
        Ok(())
    }

    async fn logs(&self, identity: &JobIdentity) -> Result<Vec<LogRecord>> {
        let rows = sqlx::query_as::<_, LogRow>(
            r#"
            SELECT stage_name, transcript, created_at
            FROM job_logs
            WHERE unique_id = $1 AND commit_ref = $2
            ORDER BY id ASC
            "#,
        )
        .bind(identity.unique_id as i64)
        .bind(&identity.commit_ref)
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::from)?;

        Ok(rows
            .into_iter()
            .map(|row| LogRecord {
                stage_name: row.stage_name,
                transcript: row.transcript,
                created_at: row.created_at,
            })
            .collect())
    }

    async fn get_descriptor(&self, identity: &JobIdentity) -> Result<Option<JobDescriptor>> {
        let descriptor: Option<Option<Json<JobDescriptor>>> = sqlx::query_scalar(
            "SELECT descriptor FROM jobs WHERE unique_id = $1 AND commit_ref = $2",
        )
        .bind(identity.unique_id as i64)
        .bind(&identity.commit_ref)
        .fetch_optional(&self.pool)
        .await
        .map_err(DbError::from)?;

        Ok(descriptor.flatten().map(|Json(d)| d))
    }

    async fn find_identity(
        &self,
        unique_id: u64,
        commit_ref: &str,
    ) -> Result<Option<JobIdentity>> {
        let row: Option<(String, i64)> = sqlx::query_as(
            "SELECT project_full_name, change_number FROM jobs WHERE unique_id = $1 AND commit_ref = $2",
        )
        .bind(unique_id as i64)
        .bind(commit_ref)
        .fetch_optional(&self.pool)
        .await
        .map_err(DbError::from)?;

        Ok(row.map(|(project_full_name, change_number)| JobIdentity {
            project_full_name,
            change_number: change_number as u64,
            unique_id,
            commit_ref: commit_ref.to_string(),
        }))
    }

    async fn get_record(&self, identity: &JobIdentity) -> Result<Option<JobRecord>> {
        let row = sqlx::query_as::<_, JobRow>(
            r#"
            SELECT unique_id, commit_ref, project_full_name, change_number, status,
                   started_at, run_time_ms, updated_at
            FROM jobs
            WHERE unique_id = $1 AND commit_ref = $2
            "#,
        )
        .bind(identity.unique_id as i64)
        .bind(&identity.commit_ref)
        .fetch_optional(&self.pool)
        .await
        .map_err(DbError::from)?;

        Ok(row.map(JobRecord::try_from).transpose()?)
    }

    async fn list_jobs(&self, limit: usize) -> Result<Vec<JobRecord>> {
        let rows = sqlx::query_as::<_, JobRow>(
            r#"
            SELECT unique_id, commit_ref, project_full_name, change_number, status,
                   started_at, run_time_ms, updated_at
            FROM jobs
            ORDER BY updated_at DESC
            LIMIT $1
            "#,
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::from)?;

        Ok(rows
            .into_iter()
            .map(JobRecord::try_from)
            .collect::<DbResult<Vec<_>>>()?)
    }
}

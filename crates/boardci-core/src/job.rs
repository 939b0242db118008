//! Job identity, descriptor and status.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::RunId;

/// Exact identity of a job: one commit of one change in one project.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobIdentity {
    /// Full project name, e.g. "OP-TEE/optee_os".
    pub project_full_name: String,
    /// Change (pull request) number within the project.
    pub change_number: u64,
    /// Provider-wide unique id of the change.
    pub unique_id: u64,
    /// Commit the job builds.
    pub commit_ref: String,
}

/// The coarser key used to decide whether a new submission replaces an older one.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SupersessionKey {
    pub project_full_name: String,
    pub change_number: u64,
}

impl JobIdentity {
    pub fn supersession_key(&self) -> SupersessionKey {
        SupersessionKey {
            project_full_name: self.project_full_name.clone(),
            change_number: self.change_number,
        }
    }

    pub fn shares_key(&self, other: &JobIdentity) -> bool {
        self.change_number == other.change_number
            && self.project_full_name == other.project_full_name
    }

    /// The first seven characters of the commit reference.
    pub fn short_ref(&self) -> &str {
        match self.commit_ref.char_indices().nth(7) {
            Some((end, _)) => &self.commit_ref[..end],
            None => &self.commit_ref,
        }
    }
}

impl fmt::Display for JobIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}#{} ({}/{})",
            self.project_full_name,
            self.change_number,
            self.unique_id,
            self.short_ref()
        )
    }
}

/// Everything needed to reproduce the checkout and build of a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobDescriptor {
    pub unique_id: u64,
    pub change_number: u64,
    /// Short project name, e.g. "optee_os".
    pub project_name: String,
    pub project_full_name: String,
    pub commit_ref: String,
    /// Where the change can be fetched from.
    pub clone_url: String,
    pub branch: String,
}

impl JobDescriptor {
    pub fn identity(&self) -> JobIdentity {
        JobIdentity {
            project_full_name: self.project_full_name.clone(),
            change_number: self.change_number,
            unique_id: self.unique_id,
            commit_ref: self.commit_ref.clone(),
        }
    }

    /// Build a descriptor from a GitHub `pull_request` event payload.
    pub fn from_github_payload(payload: &serde_json::Value) -> Option<Self> {
        let pull_request = payload.get("pull_request")?;
        let head = pull_request.get("head")?;
        let repository = payload.get("repository")?;

        let change_number = payload
            .get("number")
            .and_then(|n| n.as_u64())
            .or_else(|| pull_request.get("number").and_then(|n| n.as_u64()))?;

        Some(Self {
            unique_id: pull_request.get("id")?.as_u64()?,
            change_number,
            project_name: repository.get("name")?.as_str()?.to_string(),
            project_full_name: repository.get("full_name")?.as_str()?.to_string(),
            commit_ref: head.get("sha")?.as_str()?.to_string(),
            clone_url: head
                .get("repo")
                .and_then(|r| r.get("clone_url"))
                .and_then(|u| u.as_str())
                .unwrap_or_default()
                .to_string(),
            branch: head
                .get("ref")
                .and_then(|r| r.as_str())
                .unwrap_or_default()
                .to_string(),
        })
    }
}

/// Lifecycle status of a job. Success, Failed and Cancelled are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Success,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Success | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Success => "success",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobStatus {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "running" => Ok(JobStatus::Running),
            "success" => Ok(JobStatus::Success),
            "failed" => Ok(JobStatus::Failed),
            "cancelled" => Ok(JobStatus::Cancelled),
            other => Err(crate::Error::InvalidInput(format!(
                "unknown job status: {}",
                other
            ))),
        }
    }
}

/// One submission of a job, as held by the queue and the registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub run_id: RunId,
    pub identity: JobIdentity,
    pub descriptor: JobDescriptor,
    /// Restarted by a person rather than by an incoming event. Such jobs are
    /// never superseded.
    pub user_initiated: bool,
    pub status: JobStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub run_time: Option<Duration>,
}

impl Job {
    pub fn new(descriptor: JobDescriptor, user_initiated: bool) -> Self {
        Self {
            run_id: RunId::new(),
            identity: descriptor.identity(),
            descriptor,
            user_initiated,
            status: JobStatus::Pending,
            started_at: None,
            run_time: None,
        }
    }

    /// Whether submitting `newer` should remove this job from the queue or stop it.
    pub fn is_superseded_by(&self, newer: &Job) -> bool {
        !self.user_initiated
            && self.identity.shares_key(&newer.identity)
            && self.identity != newer.identity
    }
}

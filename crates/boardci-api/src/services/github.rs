//! Commit status reporting.

use async_trait::async_trait;
use boardci_core::status::{NotifyState, StatusSink, StatusUpdate};
use boardci_core::{Error, Result};
use serde::Serialize;
use tracing::{debug, info};

/// GitHub limits status descriptions to 140 characters.
const MAX_DESCRIPTION: usize = 140;

/// Body of `POST /repos/{owner}/{repo}/statuses/{sha}`.
#[derive(Debug, Serialize, PartialEq)]
pub struct CommitStatus<'a> {
    pub state: &'static str,
    pub description: String,
    pub context: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_url: Option<&'a str>,
}

impl<'a> CommitStatus<'a> {
    pub fn new(update: &'a StatusUpdate, context: &'a str) -> Self {
        Self {
            state: github_state(update.state),
            description: truncate(&update.message, MAX_DESCRIPTION),
            context,
            target_url: update.target_url.as_deref(),
        }
    }
}

/// GitHub has no "running" state; a running job stays pending there.
fn github_state(state: NotifyState) -> &'static str {
    match state {
        NotifyState::Pending | NotifyState::Running => "pending",
        NotifyState::Success => "success",
        NotifyState::Failure => "failure",
    }
}

fn truncate(message: &str, max: usize) -> String {
    match message.char_indices().nth(max) {
        Some((end, _)) => message[..end].to_string(),
        None => message.to_string(),
    }
}

/// GitHub API errors.
#[derive(Debug, thiserror::Error)]
pub enum GitHubError {
    #[error("Request failed: {0}")]
    Request(String),

    #[error("API error: {0}")]
    Api(String),
}

impl From<GitHubError> for Error {
    fn from(err: GitHubError) -> Self {
        Error::Notify(err.to_string())
    }
}

/// Posts commit statuses to GitHub.
pub struct GitHubStatusSink {
    client: reqwest::Client,
    api_url: String,
    access_token: String,
    context: String,
}

impl GitHubStatusSink {
    pub fn new(api_url: &str, access_token: String, context: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_url: api_url.trim_end_matches('/').to_string(),
            access_token,
            context,
        }
    }

    async fn post_status(&self, update: &StatusUpdate) -> std::result::Result<(), GitHubError> {
        let url = format!(
            "{}/repos/{}/statuses/{}",
            self.api_url, update.identity.project_full_name, update.identity.commit_ref
        );

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.access_token))
            .header("User-Agent", "boardci")
            .header("Accept", "application/vnd.github+json")
            .json(&CommitStatus::new(update, &self.context))
            .send()
            .await
            .map_err(|e| GitHubError::Request(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(GitHubError::Api(format!(
                "Failed to set status ({}): {}",
                status, text
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl StatusSink for GitHubStatusSink {
    async fn notify(&self, update: StatusUpdate) -> Result<()> {
        debug!(job = %update.identity, state = %update.state, "Posting commit status");
        self.post_status(&update).await?;
        Ok(())
    }
}

/// Writes notifications to the log only. Used when no GitHub token is configured.
pub struct LogStatusSink;

#[async_trait]
impl StatusSink for LogStatusSink {
    async fn notify(&self, update: StatusUpdate) -> Result<()> {
        info!(
            job = %update.identity,
            state = %update.state,
            url = ?update.target_url,
            "{}",
            update.message
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use boardci_core::JobIdentity;

    fn update(state: NotifyState, message: &str) -> StatusUpdate {
        StatusUpdate {
            identity: JobIdentity {
                project_full_name: "OP-TEE/optee_os".to_string(),
                change_number: 42,
                unique_id: 7,
                commit_ref: "aaa".to_string(),
            },
            state,
            message: message.to_string(),
            target_url: Some("https://ci.example.com/api/v1/jobs/7/aaa/logs".to_string()),
        }
    }

    #[test]
    fn test_running_is_reported_as_pending() {
        let running = update(NotifyState::Running, "Job running!");
        let status = CommitStatus::new(&running, "boardci/hikey");
        assert_eq!(status.state, "pending");

        let body = serde_json::to_value(&status).unwrap();
        assert_eq!(body["context"], "boardci/hikey");
        assert_eq!(body["description"], "Job running!");
        assert_eq!(
            body["target_url"],
            "https://ci.example.com/api/v1/jobs/7/aaa/logs"
        );

        let failed = update(NotifyState::Failure, "Stage hikey/flash failed!");
        assert_eq!(CommitStatus::new(&failed, "c").state, "failure");
    }

    #[test]
    fn test_long_descriptions_are_truncated() {
        let long = "é".repeat(200);
        let u = update(NotifyState::Failure, &long);
        assert_eq!(CommitStatus::new(&u, "c").description.chars().count(), 140);
        assert_eq!(truncate("short", 140), "short");
    }

    #[tokio::test]
    async fn test_unreachable_api_is_a_notify_error() {
        let sink = GitHubStatusSink::new("http://127.0.0.1:9", "t".to_string(), "c".to_string());
        let err = sink
            .notify(update(NotifyState::Pending, "Job added to queue"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Notify(_)));
    }
}

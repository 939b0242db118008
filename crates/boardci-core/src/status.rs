//! Status reporting to the external tracker.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::{JobIdentity, Result};

/// State reported to the status tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotifyState {
    Pending,
    Running,
    Success,
    Failure,
}

impl fmt::Display for NotifyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NotifyState::Pending => "pending",
            NotifyState::Running => "running",
            NotifyState::Success => "success",
            NotifyState::Failure => "failure",
        };
        f.write_str(s)
    }
}

/// One status notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusUpdate {
    pub identity: JobIdentity,
    pub state: NotifyState,
    pub message: String,
    pub target_url: Option<String>,
}

/// Receives every phase transition of every job.
#[async_trait]
pub trait StatusSink: Send + Sync {
    async fn notify(&self, update: StatusUpdate) -> Result<()>;
}

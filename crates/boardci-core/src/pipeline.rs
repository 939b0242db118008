//! Pipeline, stage and command entry definitions.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Timeout applied to a command entry that does not declare one.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(3);

/// Matched index at or above which a pattern expectation counts as a failure.
pub const DEFAULT_FAIL_FROM: usize = 1;

/// One declarative definition file: an ordered list of stages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pipeline {
    /// Definition name (e.g. "hikey").
    pub name: String,
    /// Stages in execution order.
    pub stages: Vec<Stage>,
}

/// A named phase of a pipeline: clone, build, flash, boot, test...
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stage {
    pub name: String,
    pub entries: Vec<CommandEntry>,
    /// Run this stage even when an earlier stage failed (power-off, log
    /// collection). It never turns a failed job into a successful one.
    pub always: bool,
}

impl Stage {
    pub fn new(name: impl Into<String>, entries: Vec<CommandEntry>) -> Self {
        Self {
            name: name.into(),
            entries,
            always: false,
        }
    }
}

/// What to wait for after sending a command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Expectation {
    /// Fire and forget.
    None,
    /// Wait for the first of these regexes. Indices below `fail_from` are
    /// acceptable outputs, indices at or above it are known bad signatures.
    Patterns { patterns: Vec<String>, fail_from: usize },
    /// Wrap the command so its exit status is echoed behind a sentinel and
    /// require it to be zero.
    ReturnCode,
}

impl Expectation {
    pub fn patterns(patterns: Vec<String>) -> Self {
        Expectation::Patterns {
            patterns,
            fail_from: DEFAULT_FAIL_FROM,
        }
    }
}

/// One step of a stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandEntry {
    pub command: Option<String>,
    pub expectation: Expectation,
    pub timeout: Duration,
}

impl CommandEntry {
    /// A command whose exit status must be zero.
    pub fn checked(command: impl Into<String>) -> Self {
        Self {
            command: Some(command.into()),
            expectation: Expectation::ReturnCode,
            timeout: DEFAULT_COMMAND_TIMEOUT,
        }
    }

    /// A command that is sent without waiting for anything.
    pub fn send(command: impl Into<String>) -> Self {
        Self {
            command: Some(command.into()),
            expectation: Expectation::None,
            timeout: DEFAULT_COMMAND_TIMEOUT,
        }
    }

    /// A command followed by a wait for one of `patterns`.
    pub fn expect(command: Option<String>, patterns: Vec<String>) -> Self {
        Self {
            command,
            expectation: Expectation::patterns(patterns),
            timeout: DEFAULT_COMMAND_TIMEOUT,
        }
    }

    pub fn noop() -> Self {
        Self {
            command: None,
            expectation: Expectation::None,
            timeout: DEFAULT_COMMAND_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn is_noop(&self) -> bool {
        self.command.is_none() && self.expectation == Expectation::None
    }
}

/// How a stage ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StageOutcome {
    Success,
    /// The entry at `index` did not produce an acceptable output in time.
    Failed { index: usize },
    /// Cancellation was observed after the entry at `index` finished.
    Cancelled { index: usize },
}

impl StageOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, StageOutcome::Success)
    }
}

/// Result of running one stage against a command session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageResult {
    pub name: String,
    pub transcript: String,
    pub outcome: StageOutcome,
}

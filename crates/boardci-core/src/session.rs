//! Interactive command sessions.
//!
//! A command session is one live shell connected to the device under test. It is
//! driven with two primitives: `send` a line, then `wait` for one of a list of
//! patterns to show up in the output.

use async_trait::async_trait;
use regex::Regex;
use std::time::Duration;

use crate::Result;

/// Outcome of waiting for a list of patterns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The pattern at this index matched first.
    Matched(usize),
    /// Nothing matched within the timeout.
    Timeout,
    /// The shell exited before anything matched.
    Eof,
}

/// One live interactive shell. Not meant to be shared between executors.
#[async_trait]
pub trait CommandSession: Send {
    /// Write `line` followed by a newline.
    async fn send(&mut self, line: &str) -> Result<()>;

    /// Scan unread output for the first pattern (in list order) that matches.
    /// Output up to the end of the match is consumed.
    async fn wait(&mut self, patterns: &[Regex], timeout: Duration) -> Result<WaitOutcome>;

    /// Drain everything the shell has printed since the last call.
    fn take_transcript(&mut self) -> String;

    /// Tear the shell down. Calling it twice is harmless.
    async fn close(&mut self);
}

/// Creates ready-to-use command sessions.
#[async_trait]
pub trait SessionFactory: Send + Sync {
    /// Open a session whose prompt has been observed. Fails with
    /// [`Error::SessionNotReady`](crate::Error::SessionNotReady) otherwise.
    async fn open(&self) -> Result<Box<dyn CommandSession>>;
}

//! Command sessions backed by a shell on a pseudo-terminal.

use async_trait::async_trait;
use boardci_config::ShellConfig;
use boardci_core::session::{CommandSession, SessionFactory, WaitOutcome};
use boardci_core::{Error, Result};
use bytes::Bytes;
use portable_pty::{Child, ChildKiller, CommandBuilder, MasterPty, PtySize, native_pty_system};
use regex::Regex;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, warn};

/// The shell prints this (with the arithmetic expanded) once it accepts input.
const READY_MARKER: &str = "BOARDCI_READY_";

/// Opens a fresh shell per call.
#[derive(Debug, Clone)]
pub struct PtySessionFactory {
    shell: ShellConfig,
    cwd: Option<PathBuf>,
}

impl PtySessionFactory {
    pub fn new(shell: ShellConfig) -> Self {
        Self { shell, cwd: None }
    }

    /// Start every shell in `cwd` instead of the service's working directory.
    pub fn with_cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    fn command(&self) -> CommandBuilder {
        let mut cmd = CommandBuilder::new(&self.shell.program);
        match &self.shell.rcfile {
            Some(rcfile) => {
                cmd.arg("--rcfile");
                cmd.arg(rcfile);
            }
            None => {
                cmd.arg("--norc");
                cmd.arg("--noprofile");
            }
        }
        cmd.env("TERM", "dumb");
        if let Some(cwd) = &self.cwd {
            cmd.cwd(cwd);
        }
        cmd
    }
}

#[async_trait]
impl SessionFactory for PtySessionFactory {
    async fn open(&self) -> Result<Box<dyn CommandSession>> {
        let mut session = PtySession::spawn(self.command())?;

        if let Err(e) = session.await_ready(&self.shell.prompt, self.shell.ready_timeout).await {
            session.close().await;
            return Err(e);
        }

        Ok(Box::new(session))
    }
}

/// One shell process on a pseudo-terminal.
pub struct PtySession {
    child: Box<dyn Child + Send + Sync>,
    writer: Option<Box<dyn Write + Send>>,
    // Dropping the master hangs up the terminal, so it lives as long as the session.
    _master: Box<dyn MasterPty + Send>,
    output: mpsc::UnboundedReceiver<Bytes>,
    /// Output not yet consumed by a match.
    unread: String,
    /// Everything printed since the last `take_transcript`.
    transcript: String,
    /// Trailing bytes of an incomplete UTF-8 sequence.
    partial: Vec<u8>,
    eof: bool,
    closed: bool,
}

impl PtySession {
    /// Spawn `cmd` on a new pseudo-terminal and start pumping its output.
    pub fn spawn(cmd: CommandBuilder) -> Result<Self> {
        let pair = native_pty_system()
            .openpty(PtySize {
                rows: 24,
                cols: 200,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| Error::Session(format!("failed to open pty: {}", e)))?;

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| Error::Session(format!("failed to spawn shell: {}", e)))?;
        drop(pair.slave);

        let mut reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| Error::Session(format!("failed to clone pty reader: {}", e)))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| Error::Session(format!("failed to take pty writer: {}", e)))?;

        let (tx, rx) = mpsc::unbounded_channel();
        std::thread::Builder::new()
            .name("boardci-pty-reader".to_string())
            .spawn(move || {
                let mut buf = [0u8; 4096];
                loop {
                    match reader.read(&mut buf) {
                        Ok(0) => break,
                        Ok(n) => {
                            if tx.send(Bytes::copy_from_slice(&buf[..n])).is_err() {
                                break;
                            }
                        }
                        // EIO once the shell side is gone
                        Err(_) => break,
                    }
                }
            })
            .map_err(|e| Error::Session(format!("failed to start pty reader: {}", e)))?;

        Ok(Self {
            child,
            writer: Some(writer),
            _master: pair.master,
            output: rx,
            unread: String::new(),
            transcript: String::new(),
            partial: Vec::new(),
            eof: false,
            closed: false,
        })
    }

    /// Set the prompt and check that the shell evaluates a command.
    ///
    /// The marker is computed by the shell, so the echoed command line itself can
    /// never satisfy the wait.
    async fn await_ready(&mut self, prompt: &str, timeout: Duration) -> Result<()> {
        self.send(&format!("export PS1={}", boardci_config::shell_quote(prompt)))
            .await?;
        self.send(&format!("echo {}$((40+2))", READY_MARKER)).await?;

        let marker = Regex::new(&format!("{}42", READY_MARKER))
            .map_err(|e| Error::Internal(e.to_string()))?;
        let prompt_pattern =
            Regex::new(&regex::escape(prompt)).map_err(|e| Error::Internal(e.to_string()))?;

        let deadline = Instant::now() + timeout;
        for pattern in [marker, prompt_pattern] {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.wait(std::slice::from_ref(&pattern), remaining).await? {
                WaitOutcome::Matched(_) => {}
                WaitOutcome::Timeout | WaitOutcome::Eof => {
                    return Err(Error::SessionNotReady(format!(
                        "no prompt within {:?}: {}",
                        timeout,
                        self.unread.trim()
                    )));
                }
            }
        }

        debug!("Shell ready");
        self.transcript.clear();
        Ok(())
    }

    fn push_output(&mut self, chunk: &[u8]) {
        self.partial.extend_from_slice(chunk);
        let valid = match std::str::from_utf8(&self.partial) {
            Ok(_) => self.partial.len(),
            // An incomplete sequence at the end waits for the next chunk.
            Err(e) if e.error_len().is_none() => e.valid_up_to(),
            Err(_) => self.partial.len(),
        };

        let rest = self.partial.split_off(valid);
        let text = String::from_utf8_lossy(&self.partial).into_owned();
        self.partial = rest;

        self.unread.push_str(&text);
        self.transcript.push_str(&text);
    }

    fn find_match(&mut self, patterns: &[Regex]) -> Option<usize> {
        for (index, pattern) in patterns.iter().enumerate() {
            if let Some(m) = pattern.find(&self.unread) {
                self.unread.drain(..m.end());
                return Some(index);
            }
        }
        None
    }
}

#[async_trait]
impl CommandSession for PtySession {
    async fn send(&mut self, line: &str) -> Result<()> {
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| Error::Session("session is closed".to_string()))?;

        debug!(line = %line, "Sending");
        writer
            .write_all(line.as_bytes())
            .and_then(|_| writer.write_all(b"\n"))
            .and_then(|_| writer.flush())
            .map_err(|e| Error::Session(format!("failed to write to shell: {}", e)))
    }

    async fn wait(&mut self, patterns: &[Regex], timeout: Duration) -> Result<WaitOutcome> {
        let deadline = Instant::now() + timeout;

        loop {
            if let Some(index) = self.find_match(patterns) {
                return Ok(WaitOutcome::Matched(index));
            }
            if self.eof {
                return Ok(WaitOutcome::Eof);
            }

            match tokio::time::timeout_at(deadline, self.output.recv()).await {
                Ok(Some(chunk)) => self.push_output(&chunk),
                Ok(None) => self.eof = true,
                Err(_) => return Ok(WaitOutcome::Timeout),
            }
        }
    }

    fn take_transcript(&mut self) -> String {
        // Pick up whatever arrived after the last wait.
        while let Ok(chunk) = self.output.try_recv() {
            self.push_output(&chunk);
        }
        std::mem::take(&mut self.transcript)
    }

    async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.writer = None;

        if let Err(e) = self.child.kill() {
            // Already exited.
            debug!(error = %e, "Kill failed");
        }
        for _ in 0..50 {
            match self.child.try_wait() {
                Ok(Some(status)) => {
                    debug!(?status, "Shell exited");
                    return;
                }
                Ok(None) => tokio::time::sleep(Duration::from_millis(20)).await,
                Err(e) => {
                    warn!(error = %e, "Failed to reap shell");
                    return;
                }
            }
        }
        warn!("Shell still running after kill");
    }
}

impl Drop for PtySession {
    fn drop(&mut self) {
        if !self.closed {
            let _ = self.child.kill();
        }
    }
}

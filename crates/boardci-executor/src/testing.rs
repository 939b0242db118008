//! Scripted in-process command sessions for tests.
//!
//! A [`Script`] maps commands to canned shell output and exit statuses. Commands
//! wrapped for an exit status check get the matching sentinel line appended, so the
//! stage executor sees the same output shape a real shell would produce.

use async_trait::async_trait;
use boardci_core::session::{CommandSession, SessionFactory, WaitOutcome};
use boardci_core::{Error, Result};
use regex::Regex;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Clone)]
enum Action {
    Respond { output: String, code: i32 },
    Hang,
    Cancel(CancellationToken),
    Gate(CancellationToken),
}

#[derive(Clone)]
struct Rule {
    needle: String,
    action: Action,
}

/// Canned responses, matched by substring against the command (first rule wins).
/// Commands without a rule print nothing and exit 0.
#[derive(Clone, Default)]
pub struct Script {
    rules: Vec<Rule>,
    sent: Arc<Mutex<Vec<String>>>,
    fail_open: bool,
}

impl Script {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn print(self, needle: &str, output: &str) -> Self {
        self.respond(needle, output, 0)
    }

    pub fn exit(self, needle: &str, code: i32) -> Self {
        self.respond(needle, "", code)
    }

    pub fn respond(self, needle: &str, output: &str, code: i32) -> Self {
        self.rule(
            needle,
            Action::Respond {
                output: output.to_string(),
                code,
            },
        )
    }

    /// The command never finishes; any wait after it times out.
    pub fn hang(self, needle: &str) -> Self {
        self.rule(needle, Action::Hang)
    }

    /// The command succeeds, but its output only shows up once `release` is
    /// cancelled. A wait that times out first sees nothing.
    pub fn gate(self, needle: &str, release: CancellationToken) -> Self {
        self.rule(needle, Action::Gate(release))
    }

    /// Cancel `token` while the command "runs"; the command itself succeeds.
    pub fn cancel_on(self, needle: &str, token: CancellationToken) -> Self {
        self.rule(needle, Action::Cancel(token))
    }

    /// Every session open fails as if the shell never became ready.
    pub fn unready(mut self) -> Self {
        self.fail_open = true;
        self
    }

    /// Every line sent to any session of this script, in order.
    pub fn sent(&self) -> Vec<String> {
        self.sent.lock().map(|s| s.clone()).unwrap_or_default()
    }

    /// Whether a line containing `needle` was ever sent.
    pub fn saw(&self, needle: &str) -> bool {
        self.sent().iter().any(|line| line.contains(needle))
    }

    fn rule(mut self, needle: &str, action: Action) -> Self {
        self.rules.push(Rule {
            needle: needle.to_string(),
            action,
        });
        self
    }

    fn action_for(&self, line: &str) -> Option<Action> {
        let (command, _) = split_sentinel(line);
        self.rules
            .iter()
            .find(|rule| command.contains(&rule.needle))
            .map(|rule| rule.action.clone())
    }

    fn output_for(&self, line: &str) -> String {
        if let Ok(mut sent) = self.sent.lock() {
            sent.push(line.to_string());
        }

        let (_, sentinel) = split_sentinel(line);
        let (output, code) = match self.action_for(line) {
            Some(Action::Respond { output, code }) => (output, code),
            Some(Action::Hang) => return String::new(),
            Some(Action::Cancel(token)) => {
                token.cancel();
                (String::new(), 0)
            }
            Some(Action::Gate(_)) | None => (String::new(), 0),
        };

        match sentinel {
            Some(sentinel) => format!("{}{}:{}\n", output, sentinel, code),
            None => output,
        }
    }
}

/// Split `<command>; echo "<sentinel>:$?"` into its parts.
fn split_sentinel(line: &str) -> (&str, Option<&str>) {
    line.strip_suffix(":$?\"")
        .and_then(|rest| rest.rsplit_once("; echo \""))
        .map(|(command, sentinel)| (command, Some(sentinel)))
        .unwrap_or((line, None))
}

/// A command session that answers from a [`Script`] instead of a shell.
pub struct ScriptedSession {
    script: Script,
    unread: String,
    transcript: String,
    /// Output of a gated command, held back until its gate opens.
    held: Option<(String, CancellationToken)>,
    closed: bool,
}

impl ScriptedSession {
    pub fn new(script: Script) -> Self {
        Self {
            script,
            unread: String::new(),
            transcript: String::new(),
            held: None,
            closed: false,
        }
    }
}

#[async_trait]
impl CommandSession for ScriptedSession {
    async fn send(&mut self, line: &str) -> Result<()> {
        if self.closed {
            return Err(Error::Session("session is closed".to_string()));
        }
        // Mimic the terminal echoing the line back.
        let echo = format!("{}\n", line);
        self.unread.push_str(&echo);
        self.transcript.push_str(&echo);

        let output = self.script.output_for(line);
        match self.script.action_for(line) {
            Some(Action::Gate(release)) => self.held = Some((output, release)),
            _ => {
                self.unread.push_str(&output);
                self.transcript.push_str(&output);
            }
        }
        Ok(())
    }

    async fn wait(&mut self, patterns: &[Regex], timeout: Duration) -> Result<WaitOutcome> {
        if let Some((output, release)) = self.held.take() {
            if tokio::time::timeout(timeout, release.cancelled()).await.is_err() {
                self.held = Some((output, release));
                return Ok(WaitOutcome::Timeout);
            }
            self.unread.push_str(&output);
            self.transcript.push_str(&output);
        }
        for (index, pattern) in patterns.iter().enumerate() {
            if let Some(m) = pattern.find(&self.unread) {
                self.unread.drain(..m.end());
                return Ok(WaitOutcome::Matched(index));
            }
        }
        Ok(WaitOutcome::Timeout)
    }

    fn take_transcript(&mut self) -> String {
        std::mem::take(&mut self.transcript)
    }

    async fn close(&mut self) {
        self.closed = true;
    }
}

/// Opens [`ScriptedSession`]s sharing one script.
#[derive(Clone, Default)]
pub struct ScriptedSessionFactory {
    script: Script,
}

impl ScriptedSessionFactory {
    pub fn new(script: Script) -> Self {
        Self { script }
    }
}

#[async_trait]
impl SessionFactory for ScriptedSessionFactory {
    async fn open(&self) -> Result<Box<dyn CommandSession>> {
        if self.script.fail_open {
            return Err(Error::SessionNotReady("scripted shell".to_string()));
        }
        Ok(Box::new(ScriptedSession::new(self.script.clone())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_sentinel() {
        let line = crate::stage::wrap_with_sentinel("make -j8", "BOARDCI_RC_abc");
        assert_eq!(split_sentinel(&line), ("make -j8", Some("BOARDCI_RC_abc")));
        assert_eq!(split_sentinel("ls"), ("ls", None));
    }

    #[test]
    fn test_output_for_wrapped_command() {
        let script = Script::new().respond("xtest", "PASSED\n", 2);
        let line = crate::stage::wrap_with_sentinel("xtest -l 15", "S");
        assert_eq!(script.output_for(&line), "PASSED\nS:2\n");
        assert_eq!(script.output_for("xtest"), "PASSED\n");
        assert!(script.saw("xtest -l 15"));
    }

    #[tokio::test]
    async fn test_gated_output_waits_for_release() {
        let release = CancellationToken::new();
        let script = Script::new().gate("flash.sh", release.clone());
        let mut session = ScriptedSession::new(script);
        let done = Regex::new("S:0").unwrap();

        let line = crate::stage::wrap_with_sentinel("flash.sh", "S");
        session.send(&line).await.unwrap();
        let outcome = session
            .wait(std::slice::from_ref(&done), Duration::from_millis(10))
            .await
            .unwrap();
        assert!(matches!(outcome, WaitOutcome::Timeout));

        release.cancel();
        let outcome = session
            .wait(std::slice::from_ref(&done), Duration::from_millis(10))
            .await
            .unwrap();
        assert!(matches!(outcome, WaitOutcome::Matched(0)));
    }
}

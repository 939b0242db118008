//! Replaying a stage's command entries against a live shell.

use boardci_config::JobVariables;
use boardci_core::pipeline::{CommandEntry, Expectation, Stage, StageOutcome, StageResult};
use boardci_core::session::{CommandSession, WaitOutcome};
use boardci_core::{Error, Result};
use regex::Regex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Shell state that later stages of the same run inherit: every `export` and the
/// last `cd`.
#[derive(Debug, Clone, Default)]
pub struct ShellState {
    exports: Vec<String>,
    last_cd: Option<String>,
}

impl ShellState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remember `command` if it changes the environment or the working directory.
    pub fn observe(&mut self, command: &str) {
        let command = command.trim();
        if command.starts_with("cd ") {
            self.last_cd = Some(command.to_string());
        } else if command.starts_with("export ") {
            self.exports.push(command.to_string());
        }
    }

    /// Lines that bring a fresh shell to the same state. Exports come first so
    /// that `cd $VAR` works.
    pub fn replay(&self) -> impl Iterator<Item = &str> {
        self.exports
            .iter()
            .map(String::as_str)
            .chain(self.last_cd.as_deref())
    }
}

/// Export the job variables into `session`, then replay what earlier stages left
/// behind.
pub async fn prepare_session(
    session: &mut dyn CommandSession,
    variables: &JobVariables,
    state: &ShellState,
) -> Result<()> {
    for line in variables.export_lines() {
        session.send(&line).await?;
    }
    for line in state.replay() {
        debug!(line = %line, "Replaying");
        session.send(line).await?;
    }
    Ok(())
}

/// `<command>; echo "<sentinel>:$?"`
pub fn wrap_with_sentinel(command: &str, sentinel: &str) -> String {
    format!("{}; echo \"{}:$?\"", command, sentinel)
}

fn new_sentinel() -> String {
    format!("BOARDCI_RC_{}", Uuid::new_v4().simple())
}

/// Runs the entries of one stage in order and classifies the outcome.
pub struct StageExecutor {
    cancel: CancellationToken,
}

enum EntryOutcome {
    Passed,
    Failed,
}

impl StageExecutor {
    pub fn new(cancel: CancellationToken) -> Self {
        Self { cancel }
    }

    /// Run `stage` against `session`. Cancellation is sampled after every entry
    /// and wins over whatever that entry produced. Session errors fail the stage.
    pub async fn run(
        &self,
        stage: &Stage,
        session: &mut dyn CommandSession,
        state: &mut ShellState,
    ) -> StageResult {
        info!(stage = %stage.name, entries = stage.entries.len(), "Running stage");
        let mut outcome = StageOutcome::Success;
        let mut notes = String::new();

        for (index, entry) in stage.entries.iter().enumerate() {
            let result = self.run_entry(entry, session, state).await;

            if self.cancel.is_cancelled() {
                info!(stage = %stage.name, index, "Cancellation observed");
                outcome = StageOutcome::Cancelled { index };
                break;
            }

            match result {
                Ok(EntryOutcome::Passed) => {}
                Ok(EntryOutcome::Failed) => {
                    info!(stage = %stage.name, index, "Entry failed");
                    outcome = StageOutcome::Failed { index };
                    break;
                }
                Err(e) => {
                    warn!(stage = %stage.name, index, error = %e, "Session error");
                    notes = format!("\n[boardci] {}\n", e);
                    outcome = StageOutcome::Failed { index };
                    break;
                }
            }
        }

        let mut transcript = session.take_transcript();
        transcript.push_str(&notes);

        StageResult {
            name: stage.name.clone(),
            transcript,
            outcome,
        }
    }

    async fn run_entry(
        &self,
        entry: &CommandEntry,
        session: &mut dyn CommandSession,
        state: &mut ShellState,
    ) -> Result<EntryOutcome> {
        if entry.is_noop() {
            return Ok(EntryOutcome::Passed);
        }

        let (patterns, fail_from) = match &entry.expectation {
            Expectation::None => (Vec::new(), 0),
            Expectation::Patterns { patterns, fail_from } => {
                let compiled = patterns
                    .iter()
                    .map(|p| Regex::new(p))
                    .collect::<std::result::Result<Vec<_>, _>>()
                    .map_err(|e| Error::InvalidInput(e.to_string()))?;
                (compiled, *fail_from)
            }
            Expectation::ReturnCode => {
                let sentinel = new_sentinel();
                if let Some(command) = &entry.command {
                    state.observe(command);
                    session.send(&wrap_with_sentinel(command, &sentinel)).await?;
                }
                let success = Regex::new(&format!("{}:0", sentinel))
                    .map_err(|e| Error::Internal(e.to_string()))?;
                let failure = Regex::new(&format!("{}:[1-9][0-9]*", sentinel))
                    .map_err(|e| Error::Internal(e.to_string()))?;
                return self.await_patterns(session, &[success, failure], 1, entry).await;
            }
        };

        if let Some(command) = &entry.command {
            state.observe(command);
            session.send(command).await?;
        }

        if patterns.is_empty() {
            return Ok(EntryOutcome::Passed);
        }
        self.await_patterns(session, &patterns, fail_from, entry).await
    }

    async fn await_patterns(
        &self,
        session: &mut dyn CommandSession,
        patterns: &[Regex],
        fail_from: usize,
        entry: &CommandEntry,
    ) -> Result<EntryOutcome> {
        debug!(
            command = entry.command.as_deref().unwrap_or(""),
            patterns = patterns.len(),
            timeout = ?entry.timeout,
            fail_from,
            "Waiting"
        );

        let outcome = session.wait(patterns, entry.timeout).await?;
        debug!(?outcome, "Wait finished");

        Ok(match outcome {
            WaitOutcome::Matched(index) if index < fail_from => EntryOutcome::Passed,
            WaitOutcome::Matched(_) | WaitOutcome::Timeout | WaitOutcome::Eof => {
                EntryOutcome::Failed
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Script, ScriptedSession};
    use std::time::Duration;

    fn stage(entries: Vec<CommandEntry>) -> Stage {
        Stage::new("build", entries)
    }

    async fn run(script: &Script, stage: &Stage, cancel: CancellationToken) -> StageResult {
        let mut session = ScriptedSession::new(script.clone());
        let mut state = ShellState::new();
        StageExecutor::new(cancel)
            .run(stage, &mut session, &mut state)
            .await
    }

    #[tokio::test]
    async fn test_all_entries_pass() {
        let script = Script::new()
            .print("make", "build finished\n")
            .print("cat out.txt", "finished\n");
        let stage = stage(vec![
            CommandEntry::send("source env.sh"),
            CommandEntry::checked("make -j8"),
            CommandEntry::expect(Some("cat out.txt".to_string()), vec!["finished".to_string()]),
            CommandEntry::noop(),
        ]);

        let result = run(&script, &stage, CancellationToken::new()).await;
        assert_eq!(result.outcome, StageOutcome::Success);
        assert!(result.transcript.contains("build finished"));
        assert_eq!(script.sent().len(), 3);
    }

    #[tokio::test]
    async fn test_nonzero_exit_fails_despite_success_text() {
        let script = Script::new().respond("xtest", "All tests passed\n", 1);
        let stage = stage(vec![CommandEntry::checked("xtest"), CommandEntry::checked("true")]);

        let result = run(&script, &stage, CancellationToken::new()).await;
        assert_eq!(result.outcome, StageOutcome::Failed { index: 0 });
        assert!(result.transcript.contains("All tests passed"));
        assert_eq!(script.sent().len(), 1);
    }

    #[tokio::test]
    async fn test_timeout_fails_stage() {
        let script = Script::new().hang("make");
        let stage = stage(vec![
            CommandEntry::checked("make").with_timeout(Duration::from_millis(10)),
            CommandEntry::checked("make install"),
        ]);

        let result = run(&script, &stage, CancellationToken::new()).await;
        assert_eq!(result.outcome, StageOutcome::Failed { index: 0 });
    }

    #[tokio::test]
    async fn test_pattern_at_or_above_threshold_fails() {
        let script = Script::new().print("fastboot", "FAILED (remote: flash write failure)\n");
        let entry = CommandEntry {
            command: Some("fastboot flash boot boot.img".to_string()),
            expectation: Expectation::Patterns {
                patterns: vec!["OKAY".to_string(), "FAILED".to_string()],
                fail_from: 1,
            },
            timeout: Duration::from_secs(1),
        };

        let result = run(&script, &stage(vec![entry]), CancellationToken::new()).await;
        assert_eq!(result.outcome, StageOutcome::Failed { index: 0 });
    }

    #[tokio::test]
    async fn test_wait_only_entry() {
        let script = Script::new().print("reboot", "Welcome\nlogin: ");
        let stage = stage(vec![
            CommandEntry::send("reboot"),
            CommandEntry::expect(None, vec!["login:".to_string(), "Kernel panic".to_string()]),
        ]);

        let result = run(&script, &stage, CancellationToken::new()).await;
        assert_eq!(result.outcome, StageOutcome::Success);
    }

    #[tokio::test]
    async fn test_cancellation_wins_over_success() {
        let cancel = CancellationToken::new();
        let script = Script::new().cancel_on("flash.sh", cancel.clone());
        let stage = stage(vec![
            CommandEntry::checked("flash.sh"),
            CommandEntry::checked("fastboot reboot"),
        ]);

        let result = run(&script, &stage, cancel).await;
        assert_eq!(result.outcome, StageOutcome::Cancelled { index: 0 });
        let sent = script.sent();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].starts_with("flash.sh; echo \"BOARDCI_RC_"));
    }

    #[tokio::test]
    async fn test_state_records_cd_and_exports() {
        let script = Script::new();
        let stage = stage(vec![
            CommandEntry::checked("export CROSS_COMPILE=aarch64-linux-gnu-"),
            CommandEntry::send("cd /tmp"),
            CommandEntry::send("cd $HOME/devel/optee"),
            CommandEntry::checked("make"),
        ]);

        let mut session = ScriptedSession::new(script);
        let mut state = ShellState::new();
        StageExecutor::new(CancellationToken::new())
            .run(&stage, &mut session, &mut state)
            .await;

        let replay: Vec<&str> = state.replay().collect();
        assert_eq!(
            replay,
            vec![
                "export CROSS_COMPILE=aarch64-linux-gnu-",
                "cd $HOME/devel/optee"
            ]
        );
    }

    #[tokio::test]
    async fn test_prepare_session_order() {
        let script = Script::new();
        let mut session = ScriptedSession::new(script.clone());
        let mut state = ShellState::new();
        state.observe("cd $PR_NAME");
        state.observe("export FOO=bar");

        let descriptor = boardci_core::JobDescriptor {
            unique_id: 7,
            change_number: 42,
            project_name: "optee_os".to_string(),
            project_full_name: "OP-TEE/optee_os".to_string(),
            commit_ref: "aaa".to_string(),
            clone_url: String::new(),
            branch: "master".to_string(),
        };
        prepare_session(
            &mut session,
            &JobVariables::from_descriptor(&descriptor),
            &state,
        )
        .await
        .unwrap();

        let sent = script.sent();
        assert_eq!(sent[0], "export PR_SHA1='aaa'");
        assert_eq!(sent[sent.len() - 2], "export FOO=bar");
        assert_eq!(sent[sent.len() - 1], "cd $PR_NAME");
    }

    #[tokio::test]
    async fn test_real_shell_exit_status() {
        use crate::pty::PtySessionFactory;
        use boardci_config::ShellConfig;
        use boardci_core::session::SessionFactory;

        let factory = PtySessionFactory::new(ShellConfig {
            ready_timeout: Duration::from_secs(5),
            ..ShellConfig::default()
        });
        let mut session = factory.open().await.unwrap();
        let mut state = ShellState::new();
        let stage = stage(vec![
            CommandEntry::checked("echo 'tests passed'").with_timeout(Duration::from_secs(5)),
            CommandEntry::checked("false").with_timeout(Duration::from_secs(5)),
        ]);

        let result = StageExecutor::new(CancellationToken::new())
            .run(&stage, session.as_mut(), &mut state)
            .await;
        session.close().await;

        assert_eq!(result.outcome, StageOutcome::Failed { index: 1 });
        assert!(result.transcript.contains("tests passed"));
    }
}

//! Execution supervisor: the bounded run / classify / repair loop.

use std::path::PathBuf;
use std::time::Instant;

use anyhow::Result;
use chrono::Local;
use serde::Serialize;
use tracing::{info, instrument, warn};

use crate::attempt::{AttemptResult, Launcher};
use crate::core::budget::RetryBudget;
use crate::core::classifier::classify;
use crate::core::types::{FailureReport, ProbeStatus, RunCommand, RunOutcome};
use crate::error::EngineError;
use crate::io::attempt_log::{
    AttemptMeta, AttemptWriteRequest, new_session_id, timestamp, write_attempt,
};
use crate::io::console::Operator;
use crate::io::oracle::Oracle;
use crate::io::prompt::PromptPack;
use crate::io::signal::CancelToken;
use crate::io::store::FileStore;
use crate::io::transcript::Transcript;
use crate::repair::RepairNegotiator;

pub const RUN_PROMPT: &str = "Do you want to execute this code?";

/// Supervisor states, recorded in the order they were entered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Idle,
    Confirming,
    Running,
    Repairing,
    Success,
    Cancelled,
    Declined,
    Exhausted,
    Unverified,
}

/// Why a session ended. None of these are errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionStop {
    Success,
    /// Keyboard interrupt; the child was terminated and nothing was repaired.
    Cancelled,
    /// The operator declined to run the script.
    Declined,
    /// Every attempt failed; needs a human. `None` only for a zero budget.
    Exhausted { last_failure: Option<FailureReport> },
    /// The server never answered the health probe, so nothing could be verified.
    Unverified,
}

impl SessionStop {
    pub fn phase(&self) -> Phase {
        match self {
            Self::Success => Phase::Success,
            Self::Cancelled => Phase::Cancelled,
            Self::Declined => Phase::Declined,
            Self::Exhausted { .. } => Phase::Exhausted,
            Self::Unverified => Phase::Unverified,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionOutcome {
    pub session_id: String,
    pub stop: SessionStop,
    pub attempts: u32,
    pub repair_cycles: u32,
    pub transitions: Vec<Phase>,
}

/// Fixed inputs of one supervised session.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub workdir: PathBuf,
    pub run_script: String,
    pub shell: String,
    pub max_attempts: u32,
    pub unattended: bool,
    /// Project root for attempt logs; `None` disables them.
    pub log_root: Option<PathBuf>,
}

pub struct ExecutionSupervisor<'a> {
    launcher: &'a dyn Launcher,
    oracle: &'a dyn Oracle,
    store: &'a dyn FileStore,
    operator: &'a dyn Operator,
    prompts: &'a PromptPack,
    settings: SessionSettings,
}

struct Session {
    id: String,
    transitions: Vec<Phase>,
    attempts: u32,
    repair_cycles: u32,
}

impl Session {
    fn enter(&mut self, phase: Phase) {
        info!(session = %self.id, ?phase, "session phase");
        self.transitions.push(phase);
    }

    fn end(mut self, stop: SessionStop) -> SessionOutcome {
        self.enter(stop.phase());
        SessionOutcome {
            session_id: self.id,
            stop,
            attempts: self.attempts,
            repair_cycles: self.repair_cycles,
            transitions: self.transitions,
        }
    }
}

impl<'a> ExecutionSupervisor<'a> {
    pub fn new(
        launcher: &'a dyn Launcher,
        oracle: &'a dyn Oracle,
        store: &'a dyn FileStore,
        operator: &'a dyn Operator,
        prompts: &'a PromptPack,
        settings: SessionSettings,
    ) -> Self {
        Self {
            launcher,
            oracle,
            store,
            operator,
            prompts,
            settings,
        }
    }

    /// Drive one session to a terminal state.
    ///
    /// Errors only for conditions no retry can fix: a missing run script, a
    /// command that cannot be launched, or a failing operator prompt.
    #[instrument(skip_all, fields(max_attempts = self.settings.max_attempts))]
    pub fn run(&self, cancel: &CancelToken, transcript: &mut Transcript) -> Result<SessionOutcome> {
        let mut session = Session {
            id: new_session_id(Local::now()),
            transitions: vec![Phase::Idle],
            attempts: 0,
            repair_cycles: 0,
        };

        let script = self
            .store
            .read(&self.settings.run_script)?
            .ok_or_else(|| EngineError::NoRunScript(self.settings.run_script.clone()))?;
        if !self.settings.unattended {
            session.enter(Phase::Confirming);
            self.operator.show(&self.settings.run_script, &script);
            if !self.operator.confirm(RUN_PROMPT)? {
                self.operator.warn("Ok, not executing the code.");
                return Ok(session.end(SessionStop::Declined));
            }
        }

        let command = RunCommand::script(
            &self.settings.shell,
            &self.settings.run_script,
            &self.settings.workdir,
        );
        let mut budget = RetryBudget::new(self.settings.max_attempts);

        while let Some(attempt) = budget.begin_attempt() {
            if cancel.is_cancelled() {
                return Ok(session.end(SessionStop::Cancelled));
            }
            session.enter(Phase::Running);
            session.attempts = attempt;
            self.operator.show(
                &format!("Attempt {attempt} of {}", budget.max_attempts()),
                "You can press ctrl+c *once* to stop the execution.",
            );

            let started_at = Local::now();
            let clock = Instant::now();
            let result = self.launcher.launch(&command, cancel)?;
            let report = match result.outcome {
                RunOutcome::Finished(exit) => classify(&exit, &result.output, &result.severe_logs),
                RunOutcome::Cancelled => None,
            };
            self.record_attempt(
                &session.id,
                attempt,
                &command,
                &result,
                report.as_ref(),
                started_at,
                clock,
            );

            if result.outcome == RunOutcome::Cancelled {
                return Ok(session.end(SessionStop::Cancelled));
            }
            let Some(report) = report else {
                if result.probe == ProbeStatus::NotReady {
                    self.operator
                        .warn("Unable to confirm server startup; not attempting a repair.");
                    return Ok(session.end(SessionStop::Unverified));
                }
                return Ok(session.end(SessionStop::Success));
            };

            self.operator.show(report.label(), &report.render());
            if budget.is_exhausted() {
                return Ok(session.end(SessionStop::Exhausted {
                    last_failure: Some(report),
                }));
            }

            session.enter(Phase::Repairing);
            session.repair_cycles += 1;
            let negotiator =
                RepairNegotiator::new(self.oracle, self.store, self.operator, self.prompts);
            match negotiator.repair(&report, transcript) {
                Ok(summary) => info!(
                    patches = summary.patches_applied.len(),
                    task_failures = summary.task_failures.len(),
                    "repair cycle finished"
                ),
                Err(err) => {
                    warn!(err = %err, "repair cycle aborted");
                    self.operator.warn(&format!("repair cycle aborted: {err:#}"));
                }
            }
        }

        // Every failed attempt returns above; only a zero budget ends here.
        Ok(session.end(SessionStop::Exhausted { last_failure: None }))
    }

    #[allow(clippy::too_many_arguments)]
    fn record_attempt(
        &self,
        session_id: &str,
        attempt: u32,
        command: &RunCommand,
        result: &AttemptResult,
        report: Option<&FailureReport>,
        started_at: chrono::DateTime<Local>,
        clock: Instant,
    ) {
        let Some(root) = &self.settings.log_root else {
            return;
        };
        let meta = AttemptMeta {
            session_id: session_id.to_string(),
            attempt,
            command: command.to_string(),
            exit: result.exit(),
            probe: result.probe,
            started_at: timestamp(started_at),
            ended_at: timestamp(Local::now()),
            duration_ms: u64::try_from(clock.elapsed().as_millis()).unwrap_or(u64::MAX),
        };
        let written = write_attempt(&AttemptWriteRequest {
            root,
            meta: &meta,
            output: &result.output,
            severe_logs: &result.severe_logs,
            report,
        });
        if let Err(err) = written {
            warn!(err = %err, attempt, "failed to write attempt log");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{
        MemoryStore, ScriptedAttempt, ScriptedLauncher, ScriptedOperator, ScriptedOracle,
    };

    const PLAN: &str = r#"{"plan": [{"todo": "fix syntax", "goal": "compile"}]}"#;
    const PATCH: &str = "```sh:run.sh\nnode app.js\n```";

    fn settings(max_attempts: u32, unattended: bool) -> SessionSettings {
        SessionSettings {
            workdir: PathBuf::from("."),
            run_script: "run.sh".to_string(),
            shell: "bash".to_string(),
            max_attempts,
            unattended,
            log_root: None,
        }
    }

    fn store() -> MemoryStore {
        MemoryStore::with_files([("run.sh", "node app.js\n")])
    }

    #[test]
    fn success_without_repair() {
        let launcher = ScriptedLauncher::new(vec![ScriptedAttempt::success()]);
        let oracle = ScriptedOracle::default();
        let store = store();
        let operator = ScriptedOperator::default();
        let prompts = PromptPack::new().expect("templates");
        let mut transcript = Transcript::new(None);

        let outcome = ExecutionSupervisor::new(
            &launcher,
            &oracle,
            &store,
            &operator,
            &prompts,
            settings(5, true),
        )
        .run(&CancelToken::new(), &mut transcript)
        .expect("session");

        assert_eq!(outcome.stop, SessionStop::Success);
        assert_eq!(outcome.attempts, 1);
        assert_eq!(outcome.repair_cycles, 0);
        assert!(oracle.prompts().is_empty());
        assert_eq!(
            outcome.transitions,
            vec![Phase::Idle, Phase::Running, Phase::Success]
        );
        assert_eq!(launcher.commands(), vec!["bash run.sh".to_string()]);
    }

    #[test]
    fn failure_then_repair_then_success() {
        let launcher = ScriptedLauncher::new(vec![
            ScriptedAttempt::exited(1, "", "SyntaxError: line 4"),
            ScriptedAttempt::success(),
        ]);
        let oracle = ScriptedOracle::from_texts([PLAN, PATCH]);
        let store = store();
        let operator = ScriptedOperator::default();
        let prompts = PromptPack::new().expect("templates");
        let mut transcript = Transcript::new(None);

        let outcome = ExecutionSupervisor::new(
            &launcher,
            &oracle,
            &store,
            &operator,
            &prompts,
            settings(5, true),
        )
        .run(&CancelToken::new(), &mut transcript)
        .expect("session");

        assert_eq!(outcome.stop, SessionStop::Success);
        assert_eq!(outcome.attempts, 2);
        assert_eq!(outcome.repair_cycles, 1);
        assert_eq!(
            outcome.transitions,
            vec![
                Phase::Idle,
                Phase::Running,
                Phase::Repairing,
                Phase::Running,
                Phase::Success
            ]
        );
        assert_eq!(store.writes(), vec!["run.sh".to_string()]);
    }

    #[test]
    fn budget_bounds_launches_and_ends_exhausted() {
        let launcher = ScriptedLauncher::new(vec![
            ScriptedAttempt::exited(1, "", "boom 1"),
            ScriptedAttempt::exited(1, "", "boom 2"),
            ScriptedAttempt::exited(1, "", "boom 3"),
            ScriptedAttempt::success(),
        ]);
        // Repairs happen after attempts 1 and 2 only.
        let oracle = ScriptedOracle::from_texts([PLAN, PATCH, PLAN, PATCH]);
        let store = store();
        let operator = ScriptedOperator::default();
        let prompts = PromptPack::new().expect("templates");
        let mut transcript = Transcript::new(None);

        let outcome = ExecutionSupervisor::new(
            &launcher,
            &oracle,
            &store,
            &operator,
            &prompts,
            settings(3, true),
        )
        .run(&CancelToken::new(), &mut transcript)
        .expect("session");

        assert_eq!(launcher.launches(), 3);
        assert_eq!(outcome.repair_cycles, 2);
        match outcome.stop {
            SessionStop::Exhausted {
                last_failure: Some(FailureReport::ProcessExit { stderr, .. }),
            } => assert_eq!(stderr, "boom 3"),
            other => panic!("unexpected stop: {other:?}"),
        }
    }

    #[test]
    fn cancellation_skips_repair() {
        let launcher = ScriptedLauncher::new(vec![ScriptedAttempt::cancelled()]);
        let oracle = ScriptedOracle::default();
        let store = store();
        let operator = ScriptedOperator::default();
        let prompts = PromptPack::new().expect("templates");
        let mut transcript = Transcript::new(None);

        let outcome = ExecutionSupervisor::new(
            &launcher,
            &oracle,
            &store,
            &operator,
            &prompts,
            settings(5, true),
        )
        .run(&CancelToken::new(), &mut transcript)
        .expect("session");

        assert_eq!(outcome.stop, SessionStop::Cancelled);
        assert_eq!(outcome.repair_cycles, 0);
        assert!(oracle.prompts().is_empty());
    }

    #[test]
    fn cancel_before_next_attempt_stops_the_loop() {
        let launcher = ScriptedLauncher::new(vec![ScriptedAttempt::exited(1, "", "boom")]);
        let oracle = ScriptedOracle::from_texts([PLAN, PATCH]);
        let store = store();
        let operator = ScriptedOperator::default();
        let prompts = PromptPack::new().expect("templates");
        let mut transcript = Transcript::new(None);
        let cancel = CancelToken::new();

        struct CancellingOracle<'a> {
            inner: &'a ScriptedOracle,
            cancel: &'a CancelToken,
        }
        impl Oracle for CancellingOracle<'_> {
            fn send(&self, transcript: &Transcript) -> Result<String> {
                self.cancel.cancel();
                self.inner.send(transcript)
            }
        }
        let cancelling = CancellingOracle {
            inner: &oracle,
            cancel: &cancel,
        };

        let outcome = ExecutionSupervisor::new(
            &launcher,
            &cancelling,
            &store,
            &operator,
            &prompts,
            settings(5, true),
        )
        .run(&cancel, &mut transcript)
        .expect("session");

        assert_eq!(outcome.stop, SessionStop::Cancelled);
        assert_eq!(launcher.launches(), 1);
    }

    #[test]
    fn runtime_errors_trigger_repair_with_browser_text() {
        let launcher = ScriptedLauncher::new(vec![
            ScriptedAttempt::runtime_errors(&["Uncaught TypeError: x is undefined"]),
            ScriptedAttempt::success(),
        ]);
        let oracle = ScriptedOracle::from_texts([PLAN, PATCH]);
        let store = store();
        let operator = ScriptedOperator::default();
        let prompts = PromptPack::new().expect("templates");
        let mut transcript = Transcript::new(None);

        let outcome = ExecutionSupervisor::new(
            &launcher,
            &oracle,
            &store,
            &operator,
            &prompts,
            settings(5, true),
        )
        .run(&CancelToken::new(), &mut transcript)
        .expect("session");

        assert_eq!(outcome.stop, SessionStop::Success);
        assert!(oracle.prompts()[0].contains("Uncaught TypeError: x is undefined"));
    }

    #[test]
    fn unreachable_server_is_unverified_without_repair() {
        let launcher = ScriptedLauncher::new(vec![ScriptedAttempt::not_ready()]);
        let oracle = ScriptedOracle::default();
        let store = store();
        let operator = ScriptedOperator::default();
        let prompts = PromptPack::new().expect("templates");
        let mut transcript = Transcript::new(None);

        let outcome = ExecutionSupervisor::new(
            &launcher,
            &oracle,
            &store,
            &operator,
            &prompts,
            settings(5, true),
        )
        .run(&CancelToken::new(), &mut transcript)
        .expect("session");

        assert_eq!(outcome.stop, SessionStop::Unverified);
        assert_eq!(outcome.repair_cycles, 0);
        assert!(operator.warnings()[0].contains("Unable to confirm server startup"));
    }

    #[test]
    fn declined_confirmation_never_launches() {
        let launcher = ScriptedLauncher::new(vec![ScriptedAttempt::success()]);
        let oracle = ScriptedOracle::default();
        let store = store();
        let operator = ScriptedOperator::answering(&[false]);
        let prompts = PromptPack::new().expect("templates");
        let mut transcript = Transcript::new(None);

        let outcome = ExecutionSupervisor::new(
            &launcher,
            &oracle,
            &store,
            &operator,
            &prompts,
            settings(5, false),
        )
        .run(&CancelToken::new(), &mut transcript)
        .expect("session");

        assert_eq!(outcome.stop, SessionStop::Declined);
        assert_eq!(launcher.launches(), 0);
        assert_eq!(operator.questions(), vec![RUN_PROMPT.to_string()]);
        assert_eq!(operator.shown()[0].1, "node app.js\n");
        assert_eq!(
            outcome.transitions,
            vec![Phase::Idle, Phase::Confirming, Phase::Declined]
        );
    }

    #[test]
    fn plan_parse_failure_still_retries() {
        let launcher = ScriptedLauncher::new(vec![
            ScriptedAttempt::exited(1, "", "boom"),
            ScriptedAttempt::success(),
        ]);
        let oracle = ScriptedOracle::from_texts(["not json at all"]);
        let store = store();
        let operator = ScriptedOperator::default();
        let prompts = PromptPack::new().expect("templates");
        let mut transcript = Transcript::new(None);

        let outcome = ExecutionSupervisor::new(
            &launcher,
            &oracle,
            &store,
            &operator,
            &prompts,
            settings(5, true),
        )
        .run(&CancelToken::new(), &mut transcript)
        .expect("session");

        assert_eq!(outcome.stop, SessionStop::Success);
        assert_eq!(launcher.launches(), 2);
        assert!(
            operator
                .warnings()
                .iter()
                .any(|w| w.contains("repair plan is not valid"))
        );
    }

    #[test]
    fn launch_failure_is_an_error() {
        let launcher = ScriptedLauncher::new(vec![ScriptedAttempt::LaunchFailure]);
        let oracle = ScriptedOracle::default();
        let store = store();
        let operator = ScriptedOperator::default();
        let prompts = PromptPack::new().expect("templates");
        let mut transcript = Transcript::new(None);

        let err = ExecutionSupervisor::new(
            &launcher,
            &oracle,
            &store,
            &operator,
            &prompts,
            settings(5, true),
        )
        .run(&CancelToken::new(), &mut transcript)
        .expect_err("launch failure");

        assert!(matches!(
            err.downcast_ref::<EngineError>(),
            Some(EngineError::ProcessLaunch { .. })
        ));
        assert!(oracle.prompts().is_empty());
    }

    #[test]
    fn missing_run_script_is_an_error() {
        let launcher = ScriptedLauncher::default();
        let oracle = ScriptedOracle::default();
        let store = MemoryStore::default();
        let operator = ScriptedOperator::default();
        let prompts = PromptPack::new().expect("templates");
        let mut transcript = Transcript::new(None);

        let err = ExecutionSupervisor::new(
            &launcher,
            &oracle,
            &store,
            &operator,
            &prompts,
            settings(5, true),
        )
        .run(&CancelToken::new(), &mut transcript)
        .expect_err("no run.sh");

        assert!(matches!(
            err.downcast_ref::<EngineError>(),
            Some(EngineError::NoRunScript(_))
        ));
    }
}

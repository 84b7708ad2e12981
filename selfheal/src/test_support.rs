//! Scripted collaborators and fixtures for tests.
//!
//! Every fake records what it was asked so tests can assert on the calls the
//! engine made, not only on its final outcome.

use std::cell::RefCell;
use std::collections::{BTreeMap, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use tempfile::TempDir;

use crate::attempt::{AttemptResult, Launcher};
use crate::core::types::{
    CapturedOutput, LogEntry, ProbeStatus, ProcessExit, RunCommand, RunOutcome,
};
use crate::error::EngineError;
use crate::io::console::Operator;
use crate::io::git::VersionControl;
use crate::io::oracle::Oracle;
use crate::io::signal::CancelToken;
use crate::io::store::{DirStore, FileStore};
use crate::io::transcript::{Role, Transcript};

/// Oracle that replays canned replies in order and records each prompt.
#[derive(Debug, Default)]
pub struct ScriptedOracle {
    replies: RefCell<VecDeque<Result<String, String>>>,
    prompts: RefCell<Vec<String>>,
}

impl ScriptedOracle {
    /// `Err` entries make that exchange fail with the given message.
    pub fn new(replies: Vec<Result<String, String>>) -> Self {
        Self {
            replies: RefCell::new(replies.into()),
            prompts: RefCell::new(Vec::new()),
        }
    }

    pub fn from_texts<const N: usize>(replies: [&str; N]) -> Self {
        Self::new(replies.iter().map(|r| Ok(r.to_string())).collect())
    }

    /// The latest prompt of every exchange, in order.
    pub fn prompts(&self) -> Vec<String> {
        self.prompts.borrow().clone()
    }
}

impl Oracle for ScriptedOracle {
    fn send(&self, transcript: &Transcript) -> Result<String> {
        let prompt = transcript
            .entries()
            .iter()
            .rev()
            .find(|entry| entry.role == Role::Prompt)
            .map(|entry| entry.content.clone())
            .unwrap_or_default();
        self.prompts.borrow_mut().push(prompt);
        match self.replies.borrow_mut().pop_front() {
            Some(Ok(reply)) => Ok(reply),
            Some(Err(message)) => Err(anyhow!(message)),
            None => Err(anyhow!("scripted oracle has no replies left")),
        }
    }
}

/// In-memory [`FileStore`] that records every write.
#[derive(Debug, Default)]
pub struct MemoryStore {
    files: RefCell<BTreeMap<String, String>>,
    writes: RefCell<Vec<String>>,
    fail_on: Option<String>,
}

impl MemoryStore {
    pub fn with_files<const N: usize>(files: [(&str, &str); N]) -> Self {
        let store = Self::default();
        for (path, content) in files {
            store
                .files
                .borrow_mut()
                .insert(path.to_string(), content.to_string());
        }
        store
    }

    /// Writes to `path` fail.
    pub fn failing_on(mut self, path: &str) -> Self {
        self.fail_on = Some(path.to_string());
        self
    }

    pub fn get(&self, path: &str) -> Option<String> {
        self.files.borrow().get(path).cloned()
    }

    pub fn writes(&self) -> Vec<String> {
        self.writes.borrow().clone()
    }
}

impl FileStore for MemoryStore {
    fn read(&self, path: &str) -> Result<Option<String>> {
        Ok(self.get(path))
    }

    fn write(&self, path: &str, content: &str) -> Result<()> {
        if self.fail_on.as_deref() == Some(path) {
            return Err(anyhow!("permission denied: {path}"));
        }
        self.writes.borrow_mut().push(path.to_string());
        self.files
            .borrow_mut()
            .insert(path.to_string(), content.to_string());
        Ok(())
    }

    fn list_files(&self) -> Result<BTreeMap<String, String>> {
        Ok(self.files.borrow().clone())
    }
}

/// One scripted launch.
#[derive(Debug, Clone)]
pub enum ScriptedAttempt {
    Completed(AttemptResult),
    /// The command could not be started at all.
    LaunchFailure,
}

impl ScriptedAttempt {
    /// Exit 0, no console errors.
    pub fn success() -> Self {
        Self::exited(0, "", "")
    }

    pub fn exited(code: i32, stdout: &str, stderr: &str) -> Self {
        Self::Completed(AttemptResult {
            outcome: RunOutcome::Finished(ProcessExit::Exited { code: Some(code) }),
            output: CapturedOutput {
                stdout: split_lines(stdout),
                stderr: split_lines(stderr),
            },
            severe_logs: Vec::new(),
            probe: ProbeStatus::Skipped,
        })
    }

    /// Server answered but the browser console logged severe entries.
    pub fn runtime_errors(messages: &[&str]) -> Self {
        Self::Completed(AttemptResult {
            outcome: RunOutcome::Finished(ProcessExit::Stopped),
            output: CapturedOutput::default(),
            severe_logs: messages.iter().map(|m| LogEntry::severe(*m)).collect(),
            probe: ProbeStatus::Ready,
        })
    }

    pub fn not_ready() -> Self {
        Self::Completed(AttemptResult {
            outcome: RunOutcome::Finished(ProcessExit::Stopped),
            output: CapturedOutput::default(),
            severe_logs: Vec::new(),
            probe: ProbeStatus::NotReady,
        })
    }

    pub fn cancelled() -> Self {
        Self::Completed(AttemptResult {
            outcome: RunOutcome::Cancelled,
            output: CapturedOutput::default(),
            severe_logs: Vec::new(),
            probe: ProbeStatus::Skipped,
        })
    }
}

fn split_lines(text: &str) -> Vec<String> {
    text.lines().map(str::to_string).collect()
}

/// Launcher that replays scripted attempts and counts launches.
#[derive(Debug, Default)]
pub struct ScriptedLauncher {
    attempts: RefCell<VecDeque<ScriptedAttempt>>,
    commands: RefCell<Vec<String>>,
}

impl ScriptedLauncher {
    pub fn new(attempts: Vec<ScriptedAttempt>) -> Self {
        Self {
            attempts: RefCell::new(attempts.into()),
            commands: RefCell::new(Vec::new()),
        }
    }

    pub fn launches(&self) -> usize {
        self.commands.borrow().len()
    }

    pub fn commands(&self) -> Vec<String> {
        self.commands.borrow().clone()
    }
}

impl Launcher for ScriptedLauncher {
    fn launch(&self, command: &RunCommand, _cancel: &CancelToken) -> Result<AttemptResult> {
        self.commands.borrow_mut().push(command.to_string());
        match self.attempts.borrow_mut().pop_front() {
            Some(ScriptedAttempt::Completed(result)) => Ok(result),
            Some(ScriptedAttempt::LaunchFailure) => Err(EngineError::ProcessLaunch {
                command: command.to_string(),
                workdir: command.workdir.clone(),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "no such file"),
            }
            .into()),
            None => Err(anyhow!("scripted launcher has no attempts left")),
        }
    }
}

/// A call made against [`ScriptedVcs`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VcsCall {
    ListChangedFiles,
    Diff,
    Checkout(String),
    Add(Vec<String>),
    Commit(String),
    Push,
}

/// Version control fake with a fixed working tree state.
#[derive(Debug, Default)]
pub struct ScriptedVcs {
    changed: Vec<String>,
    diff: String,
    fail_checkout: bool,
    fail_push: bool,
    calls: RefCell<Vec<VcsCall>>,
}

impl ScriptedVcs {
    pub fn new(changed: &[&str], diff: &str) -> Self {
        Self {
            changed: changed.iter().map(|p| p.to_string()).collect(),
            diff: diff.to_string(),
            ..Self::default()
        }
    }

    pub fn failing_checkout(mut self) -> Self {
        self.fail_checkout = true;
        self
    }

    pub fn failing_push(mut self) -> Self {
        self.fail_push = true;
        self
    }

    pub fn calls(&self) -> Vec<VcsCall> {
        self.calls.borrow().clone()
    }

    /// True if any add, commit or push was attempted.
    pub fn mutated(&self) -> bool {
        self.calls.borrow().iter().any(|call| {
            matches!(
                call,
                VcsCall::Checkout(_) | VcsCall::Add(_) | VcsCall::Commit(_) | VcsCall::Push
            )
        })
    }

    fn record(&self, call: VcsCall) {
        self.calls.borrow_mut().push(call);
    }
}

impl VersionControl for ScriptedVcs {
    fn list_changed_files(&self) -> Result<Vec<String>> {
        self.record(VcsCall::ListChangedFiles);
        Ok(self.changed.clone())
    }

    fn diff(&self) -> Result<String> {
        self.record(VcsCall::Diff);
        Ok(self.diff.clone())
    }

    fn checkout(&self, branch: &str) -> Result<()> {
        self.record(VcsCall::Checkout(branch.to_string()));
        if self.fail_checkout {
            return Err(anyhow!("branch {branch} is checked out elsewhere"));
        }
        Ok(())
    }

    fn add(&self, paths: &[String]) -> Result<()> {
        self.record(VcsCall::Add(paths.to_vec()));
        Ok(())
    }

    fn commit(&self, message: &str) -> Result<()> {
        self.record(VcsCall::Commit(message.to_string()));
        Ok(())
    }

    fn push(&self) -> Result<()> {
        self.record(VcsCall::Push);
        if self.fail_push {
            return Err(anyhow!("remote rejected push"));
        }
        Ok(())
    }
}

/// Operator with queued yes/no answers; unanswered questions get "yes".
#[derive(Debug, Default)]
pub struct ScriptedOperator {
    answers: RefCell<VecDeque<bool>>,
    questions: RefCell<Vec<String>>,
    shown: RefCell<Vec<(String, String)>>,
    warnings: RefCell<Vec<String>>,
}

impl ScriptedOperator {
    pub fn answering(answers: &[bool]) -> Self {
        Self {
            answers: RefCell::new(answers.iter().copied().collect()),
            ..Self::default()
        }
    }

    pub fn questions(&self) -> Vec<String> {
        self.questions.borrow().clone()
    }

    pub fn shown(&self) -> Vec<(String, String)> {
        self.shown.borrow().clone()
    }

    pub fn warnings(&self) -> Vec<String> {
        self.warnings.borrow().clone()
    }
}

impl Operator for ScriptedOperator {
    fn confirm(&self, prompt: &str) -> Result<bool> {
        self.questions.borrow_mut().push(prompt.to_string());
        Ok(self.answers.borrow_mut().pop_front().unwrap_or(true))
    }

    fn show(&self, title: &str, body: &str) {
        self.shown
            .borrow_mut()
            .push((title.to_string(), body.to_string()));
    }

    fn warn(&self, message: &str) {
        self.warnings.borrow_mut().push(message.to_string());
    }
}

/// Temporary project directory with helpers for seeding files.
pub struct TestProject {
    temp: TempDir,
}

impl TestProject {
    pub fn new() -> Result<Self> {
        Ok(Self {
            temp: tempfile::tempdir().context("create temp project")?,
        })
    }

    pub fn root(&self) -> &Path {
        self.temp.path()
    }

    pub fn path(&self, rel: &str) -> PathBuf {
        self.root().join(rel)
    }

    pub fn write(&self, rel: &str, content: &str) -> Result<()> {
        let path = self.path(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, content).with_context(|| format!("write {}", path.display()))
    }

    pub fn read(&self, rel: &str) -> Result<String> {
        let path = self.path(rel);
        fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))
    }

    pub fn store(&self) -> DirStore {
        DirStore::new(self.root(), vec![".git".to_string(), ".selfheal".to_string()])
    }
}

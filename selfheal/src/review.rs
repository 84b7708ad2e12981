//! Review gate: diff approval before any version-control mutation.
//!
//! Version control is best effort relative to the build loop. Every git
//! failure becomes a warning string on the outcome; only operator and oracle
//! transport failures surface as errors.

use anyhow::Result;
use tracing::{info, instrument, warn};

use crate::core::types::DiffSnapshot;
use crate::io::console::Operator;
use crate::io::git::VersionControl;
use crate::io::oracle::{Oracle, exchange};
use crate::io::prompt::PromptPack;
use crate::io::transcript::{ExchangeKind, Transcript};

pub const PUSH_PROMPT: &str = "Proceed with commit and push to repository?";
const FALLBACK_COMMIT_MESSAGE: &str = "Fix runtime errors found during execution";
const MAX_BRANCH_LEN: usize = 60;

#[derive(Debug, Clone, Default)]
pub struct ReviewSettings {
    pub unattended: bool,
    /// Fixed branch to commit on; wins over a generated name.
    pub branch: Option<String>,
    pub generate_branch_name: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReviewOutcome {
    /// Working tree is clean; nothing was shown or asked.
    NoChanges,
    /// The operator declined; nothing was mutated.
    Rejected,
    /// The diff could not be computed.
    Unavailable { warning: String },
    Applied {
        branch: Option<String>,
        message: String,
        committed: bool,
        pushed: bool,
        warnings: Vec<String>,
    },
}

pub struct ReviewGate<'a> {
    vcs: &'a dyn VersionControl,
    oracle: &'a dyn Oracle,
    operator: &'a dyn Operator,
    prompts: &'a PromptPack,
    settings: ReviewSettings,
}

impl<'a> ReviewGate<'a> {
    pub fn new(
        vcs: &'a dyn VersionControl,
        oracle: &'a dyn Oracle,
        operator: &'a dyn Operator,
        prompts: &'a PromptPack,
        settings: ReviewSettings,
    ) -> Self {
        Self {
            vcs,
            oracle,
            operator,
            prompts,
            settings,
        }
    }

    /// Fresh snapshot of the working tree, `None` when nothing changed.
    pub fn propose(&self) -> Result<Option<DiffSnapshot>> {
        let files = self.vcs.list_changed_files()?;
        if files.is_empty() {
            return Ok(None);
        }
        let diff = self.vcs.diff()?;
        Ok(Some(DiffSnapshot { files, diff }))
    }

    #[instrument(skip_all, fields(unattended = self.settings.unattended))]
    pub fn review(&self, transcript: &mut Transcript) -> Result<ReviewOutcome> {
        let snapshot = match self.propose() {
            Ok(Some(snapshot)) => snapshot,
            Ok(None) => {
                info!("no changes to review");
                return Ok(ReviewOutcome::NoChanges);
            }
            Err(err) => {
                let warning = format!("could not compute diff: {err:#}");
                warn!(err = %err, "review diff unavailable");
                self.operator.warn(&warning);
                return Ok(ReviewOutcome::Unavailable { warning });
            }
        };

        self.operator.show(
            &format!("Changed files ({})", snapshot.files.len()),
            &snapshot.files.join("\n"),
        );
        self.operator.show("Diff", &snapshot.diff);
        let approved = self.settings.unattended || self.operator.confirm(PUSH_PROMPT)?;
        if !approved {
            info!("changes rejected by operator");
            return Ok(ReviewOutcome::Rejected);
        }

        let prompt = self.prompts.render_commit_message(&snapshot.diff)?;
        let raw = exchange(self.oracle, transcript, ExchangeKind::CommitMessage, prompt)?;
        let message = clean_commit_message(&raw)
            .unwrap_or_else(|| FALLBACK_COMMIT_MESSAGE.to_string());
        let branch = match &self.settings.branch {
            Some(branch) => Some(branch.clone()),
            None if self.settings.generate_branch_name => {
                let prompt = self.prompts.render_branch_name(&snapshot.diff)?;
                let raw = exchange(self.oracle, transcript, ExchangeKind::BranchName, prompt)?;
                sanitize_branch_name(&raw)
            }
            None => None,
        };

        Ok(self.apply(&snapshot, branch, message))
    }

    fn apply(
        &self,
        snapshot: &DiffSnapshot,
        branch: Option<String>,
        message: String,
    ) -> ReviewOutcome {
        let mut warnings = Vec::new();
        let mut note = |what: &str, err: anyhow::Error| {
            let warning = format!("{what} failed: {err:#}");
            warn!(err = %err, step = what, "version control step failed");
            self.operator.warn(&warning);
            warnings.push(warning);
        };

        let mut committed = false;
        let mut pushed = false;
        let ready = match &branch {
            Some(name) => self
                .vcs
                .checkout(name)
                .map_err(|err| note(&format!("checkout {name}"), err))
                .is_ok(),
            None => true,
        };
        if ready {
            committed = self
                .vcs
                .add(&snapshot.files)
                .and_then(|()| self.vcs.commit(&message))
                .map_err(|err| note("commit", err))
                .is_ok();
        }
        if committed {
            pushed = self.vcs.push().map_err(|err| note("push", err)).is_ok();
        }
        info!(committed, pushed, "review applied");

        ReviewOutcome::Applied {
            branch,
            message,
            committed,
            pushed,
            warnings,
        }
    }
}

/// Strip code fences and quotes from an oracle-written commit message.
pub fn clean_commit_message(raw: &str) -> Option<String> {
    let body: Vec<&str> = raw
        .lines()
        .filter(|line| !line.trim_start().starts_with("```"))
        .collect();
    let message = body
        .join("\n")
        .trim()
        .trim_matches(['"', '\'', '`'])
        .trim()
        .to_string();
    (!message.is_empty()).then_some(message)
}

/// Turn an oracle-suggested name into a git-safe branch slug.
pub fn sanitize_branch_name(raw: &str) -> Option<String> {
    let line = raw
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty() && !line.starts_with("```"))?;
    let mut slug = String::new();
    for ch in line.trim_matches(['"', '\'', '`']).chars() {
        let ch = ch.to_ascii_lowercase();
        let mapped = if ch.is_ascii_alphanumeric() || matches!(ch, '/' | '_' | '.') {
            ch
        } else {
            '-'
        };
        if mapped == '-' && slug.ends_with('-') {
            continue;
        }
        slug.push(mapped);
    }
    while slug.contains("..") {
        slug = slug.replace("..", ".");
    }
    while slug.contains("/.") {
        slug = slug.replace("/.", "/");
    }
    while slug.contains("//") {
        slug = slug.replace("//", "/");
    }
    slug.truncate(MAX_BRANCH_LEN);
    let slug = slug.trim_matches(['-', '/', '.']).to_string();
    let slug = slug.strip_suffix(".lock").unwrap_or(&slug).to_string();
    (!slug.is_empty()).then_some(slug)
}

//! Version-control adapter for the review gate.
//!
//! A small, explicit wrapper around `git` subprocess calls. The review gate
//! talks to it through [`VersionControl`] so tests can record calls instead.

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument, warn};

use crate::io::config::STATE_DIR;

/// Operations the review gate needs. All synchronous, all fallible.
pub trait VersionControl {
    /// Paths with tracked or untracked changes, in porcelain order.
    fn list_changed_files(&self) -> Result<Vec<String>>;
    /// Unified diff of the working tree, including untracked files.
    fn diff(&self) -> Result<String>;
    /// Switch to `branch`, creating it at HEAD if missing.
    fn checkout(&self, branch: &str) -> Result<()>;
    fn add(&self, paths: &[String]) -> Result<()>;
    fn commit(&self, message: &str) -> Result<()>;
    /// Push the current branch to the configured remote.
    fn push(&self) -> Result<()>;
}

/// Parsed `git status --porcelain` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEntry {
    /// 2-letter XY code, or "??" for untracked.
    pub code: String,
    /// Path for the changed file.
    pub path: String,
}

impl StatusEntry {
    pub fn is_untracked(&self) -> bool {
        self.code == "??"
    }
}

/// Wrapper for executing git commands in a working directory.
#[derive(Debug, Clone)]
pub struct Git {
    workdir: PathBuf,
    remote: String,
}

impl Git {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
            remote: "origin".to_string(),
        }
    }

    pub fn with_remote(mut self, remote: impl Into<String>) -> Self {
        self.remote = remote.into();
        self
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    /// Return the current branch name (errors on detached HEAD).
    #[instrument(skip_all)]
    pub fn current_branch(&self) -> Result<String> {
        let out = self.run_capture(&["rev-parse", "--abbrev-ref", "HEAD"])?;
        let name = out.trim().to_string();
        if name == "HEAD" {
            warn!("detached HEAD detected");
            return Err(anyhow!("detached HEAD (refuse to push)"));
        }
        debug!(branch = %name, "current branch");
        Ok(name)
    }

    /// Get status entries (including untracked) in porcelain format.
    ///
    /// The engine's own state directory is never reported.
    pub fn status_porcelain(&self) -> Result<Vec<StatusEntry>> {
        let exclude = state_exclude();
        let out =
            self.run_capture(&["status", "--porcelain=v1", "-uall", "--", ".", &exclude])?;
        let mut entries = Vec::new();
        for line in out.lines() {
            if line.trim().is_empty() {
                continue;
            }
            entries.push(parse_status_line(line)?);
        }
        Ok(entries)
    }

    /// True once the repository has at least one commit.
    pub fn has_head(&self) -> Result<bool> {
        Ok(self
            .run(&["rev-parse", "--verify", "--quiet", "HEAD"])?
            .status
            .success())
    }

    /// Check whether a local branch exists.
    pub fn branch_exists(&self, branch: &str) -> Result<bool> {
        let status = self
            .run(&[
                "show-ref",
                "--verify",
                "--quiet",
                &format!("refs/heads/{branch}"),
            ])?
            .status;
        Ok(status.success())
    }

    /// True if there is anything staged for commit.
    pub fn has_staged_changes(&self) -> Result<bool> {
        let out = self.run(&["diff", "--cached", "--name-only"])?;
        Ok(!String::from_utf8_lossy(&out.stdout).trim().is_empty())
    }

    fn untracked_diff(&self, path: &str) -> Result<String> {
        // `--no-index` exits 1 when the files differ, which is always here.
        let output = self.run(&["diff", "--no-index", "--", "/dev/null", path])?;
        match output.status.code() {
            Some(0) | Some(1) => Ok(String::from_utf8_lossy(&output.stdout).to_string()),
            _ => Err(anyhow!(
                "git diff --no-index {path} failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )),
        }
    }

    fn run_capture(&self, args: &[&str]) -> Result<String> {
        let output = self.run_checked(args)?;
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    fn run_checked(&self, args: &[&str]) -> Result<Output> {
        let output = self.run(args)?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!("git {} failed: {}", args.join(" "), stderr.trim()));
        }
        Ok(output)
    }

    fn run(&self, args: &[&str]) -> Result<Output> {
        Command::new("git")
            .args(args)
            .current_dir(&self.workdir)
            .output()
            .with_context(|| format!("spawn git {}", args.join(" ")))
    }
}

impl VersionControl for Git {
    fn list_changed_files(&self) -> Result<Vec<String>> {
        Ok(self
            .status_porcelain()?
            .into_iter()
            .map(|entry| entry.path)
            .collect())
    }

    #[instrument(skip_all)]
    fn diff(&self) -> Result<String> {
        let exclude = state_exclude();
        let base = if self.has_head()? { "HEAD" } else { "--cached" };
        let mut diff = self.run_capture(&["diff", base, "--", ".", &exclude])?;
        for entry in self.status_porcelain()? {
            if entry.is_untracked() {
                diff.push_str(&self.untracked_diff(&entry.path)?);
            }
        }
        debug!(bytes = diff.len(), "computed working tree diff");
        Ok(diff)
    }

    #[instrument(skip_all, fields(branch = %branch))]
    fn checkout(&self, branch: &str) -> Result<()> {
        if self.has_head()? && self.current_branch()? == branch {
            return Ok(());
        }
        if self.branch_exists(branch)? {
            debug!(branch, "checking out existing branch");
            self.run_checked(&["checkout", branch])?;
        } else {
            debug!(branch, "creating and checking out new branch");
            self.run_checked(&["checkout", "-b", branch])?;
        }
        Ok(())
    }

    fn add(&self, paths: &[String]) -> Result<()> {
        if paths.is_empty() {
            return Ok(());
        }
        let mut args = vec!["add", "-A", "--"];
        args.extend(paths.iter().map(String::as_str));
        self.run_checked(&args)?;
        Ok(())
    }

    #[instrument(skip_all)]
    fn commit(&self, message: &str) -> Result<()> {
        if !self.has_staged_changes()? {
            return Err(anyhow!("nothing staged to commit"));
        }
        debug!("committing staged changes");
        self.run_checked(&["commit", "-m", message])?;
        Ok(())
    }

    #[instrument(skip_all, fields(remote = %self.remote))]
    fn push(&self) -> Result<()> {
        let branch = self.current_branch()?;
        self.run_checked(&["push", "-u", &self.remote, &branch])?;
        Ok(())
    }
}

/// Pathspec keeping attempt logs and the transcript out of reviews and commits.
fn state_exclude() -> String {
    format!(":(exclude){STATE_DIR}")
}

fn parse_status_line(line: &str) -> Result<StatusEntry> {
    if let Some(path) = line.strip_prefix("?? ") {
        return Ok(StatusEntry {
            code: "??".to_string(),
            path: path.trim().to_string(),
        });
    }
    if line.len() < 4 {
        return Err(anyhow!("unexpected porcelain line: '{line}'"));
    }
    let code = line[..2].to_string();
    let mut path = line[3..].trim().to_string();
    if let Some((_, new)) = path.split_once("->") {
        path = new.trim().to_string();
    }
    Ok(StatusEntry { code, path })
}

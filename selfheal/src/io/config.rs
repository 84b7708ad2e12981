//! Engine configuration stored under `.selfheal/config.toml`.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use reqwest::Url;
use serde::{Deserialize, Serialize};

/// Directory under the project root holding engine-owned files.
pub const STATE_DIR: &str = ".selfheal";

/// Engine configuration (TOML).
///
/// Intended to be edited by humans. Missing fields default to the values the
/// reference deployment used.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EngineConfig {
    /// Script executed for every attempt, relative to the project root.
    pub run_script: String,

    /// Interpreter used to run `run_script`.
    pub shell: String,

    /// Process launches allowed per supervised session.
    pub max_attempts: u32,

    /// Kill a non-server run after this many seconds. `None` waits forever.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attempt_timeout_secs: Option<u64>,

    /// Skip every confirmation prompt.
    pub unattended: bool,

    pub health: HealthConfig,
    pub browser: BrowserConfig,
    pub oracle: OracleConfig,
    pub transcript: TranscriptConfig,
    pub review: ReviewConfig,
    pub store: StoreConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct HealthConfig {
    /// Probe the URL after launch. Disable for programs that are not servers.
    pub enabled: bool,
    pub url: String,
    /// Readiness polls before giving up (independent of `max_attempts`).
    pub max_attempts: u32,
    pub interval_ms: u64,
    pub request_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct BrowserConfig {
    /// Capture browser console errors once the server is ready.
    pub enabled: bool,
    /// WebDriver endpoint (e.g. a local chromedriver).
    pub webdriver_url: String,
    pub browser_args: Vec<String>,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct OracleConfig {
    /// Command that reads the conversation on stdin and answers on stdout.
    pub command: Vec<String>,
    pub timeout_secs: u64,
    pub output_limit_bytes: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct TranscriptConfig {
    /// Send only the last N transcript entries to the oracle. `None` sends all.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub window: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ReviewConfig {
    /// Branch to commit on. Checked out (or created) before committing.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    /// Ask the oracle for a branch name when `branch` is unset.
    pub generate_branch_name: bool,
    pub remote: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct StoreConfig {
    /// Directory names never listed into prompts.
    pub ignore: Vec<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            run_script: "run.sh".to_string(),
            shell: "bash".to_string(),
            max_attempts: 5,
            attempt_timeout_secs: None,
            unattended: false,
            health: HealthConfig::default(),
            browser: BrowserConfig::default(),
            oracle: OracleConfig::default(),
            transcript: TranscriptConfig::default(),
            review: ReviewConfig::default(),
            store: StoreConfig::default(),
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            url: "http://localhost:3000".to_string(),
            max_attempts: 30,
            interval_ms: 1_000,
            request_timeout_ms: 1_000,
        }
    }
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            webdriver_url: "http://localhost:9515".to_string(),
            browser_args: vec!["--headless".to_string()],
            timeout_secs: 30,
        }
    }
}

impl Default for OracleConfig {
    fn default() -> Self {
        Self {
            command: vec!["codex".to_string(), "exec".to_string(), "-".to_string()],
            timeout_secs: 10 * 60,
            output_limit_bytes: 1_000_000,
        }
    }
}

impl Default for ReviewConfig {
    fn default() -> Self {
        Self {
            branch: None,
            generate_branch_name: false,
            remote: "origin".to_string(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            ignore: [
                ".git",
                STATE_DIR,
                "node_modules",
                "target",
                "dist",
                "build",
                "__pycache__",
                ".venv",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<()> {
        if self.run_script.trim().is_empty() {
            return Err(anyhow!("run_script must be non-empty"));
        }
        if self.shell.trim().is_empty() {
            return Err(anyhow!("shell must be non-empty"));
        }
        if self.max_attempts == 0 {
            return Err(anyhow!("max_attempts must be > 0"));
        }
        if self.attempt_timeout_secs == Some(0) {
            return Err(anyhow!("attempt_timeout_secs must be > 0 when set"));
        }
        if self.health.max_attempts == 0 {
            return Err(anyhow!("health.max_attempts must be > 0"));
        }
        if self.health.request_timeout_ms == 0 {
            return Err(anyhow!("health.request_timeout_ms must be > 0"));
        }
        Url::parse(&self.health.url)
            .with_context(|| format!("health.url is not a URL: {}", self.health.url))?;
        Url::parse(&self.browser.webdriver_url).with_context(|| {
            format!(
                "browser.webdriver_url is not a URL: {}",
                self.browser.webdriver_url
            )
        })?;
        if self.oracle.command.is_empty() || self.oracle.command[0].trim().is_empty() {
            return Err(anyhow!("oracle.command must be a non-empty array"));
        }
        if self.oracle.timeout_secs == 0 {
            return Err(anyhow!("oracle.timeout_secs must be > 0"));
        }
        if self.oracle.output_limit_bytes == 0 {
            return Err(anyhow!("oracle.output_limit_bytes must be > 0"));
        }
        if self.transcript.window == Some(0) {
            return Err(anyhow!("transcript.window must be > 0 when set"));
        }
        if self.review.remote.trim().is_empty() {
            return Err(anyhow!("review.remote must be non-empty"));
        }
        Ok(())
    }
}

/// `<root>/.selfheal/config.toml`.
pub fn config_path(root: &Path) -> PathBuf {
    root.join(STATE_DIR).join("config.toml")
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `EngineConfig::default()`.
pub fn load_config(path: &Path) -> Result<EngineConfig> {
    if !path.exists() {
        let cfg = EngineConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: EngineConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &EngineConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("config path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}

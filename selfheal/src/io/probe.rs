//! Runtime health probing: HTTP readiness polling and browser console capture.
//!
//! Readiness is a plain GET loop against the configured URL. Console capture
//! drives a WebDriver endpoint (chromedriver) over its JSON wire protocol: open
//! a headless session, navigate, read the `browser` log, and always delete the
//! session again.

use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use reqwest::StatusCode;
use reqwest::blocking::Client;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, info, instrument, warn};

use crate::core::types::{LogEntry, severe_only};
use crate::io::config::{BrowserConfig, HealthConfig};

/// Polls an HTTP endpoint until it answers 200.
#[derive(Debug, Clone)]
pub struct HealthProbe {
    client: Client,
    url: String,
    max_attempts: u32,
    interval: Duration,
}

impl HealthProbe {
    pub fn new(config: &HealthConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_millis(config.request_timeout_ms))
            .build()
            .context("build health probe client")?;
        Ok(Self {
            client,
            url: config.url.clone(),
            max_attempts: config.max_attempts,
            interval: Duration::from_millis(config.interval_ms),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// One GET; connection failures count as "not ready yet".
    pub fn check_once(&self) -> bool {
        match self.client.get(&self.url).send() {
            Ok(response) => {
                debug!(status = %response.status(), "health probe response");
                response.status() == StatusCode::OK
            }
            Err(err) => {
                debug!(err = %err, "health probe not reachable yet");
                false
            }
        }
    }

    /// Poll until the first HTTP 200 or `max_attempts` polls have failed.
    ///
    /// `keep_waiting` runs before every poll; returning `false` abandons the
    /// wait early (child exited, session cancelled).
    #[instrument(skip_all, fields(url = %self.url, max_attempts = self.max_attempts))]
    pub fn await_ready(&self, mut keep_waiting: impl FnMut() -> bool) -> bool {
        for attempt in 1..=self.max_attempts {
            if !keep_waiting() {
                debug!(attempt, "readiness wait abandoned");
                return false;
            }
            if self.check_once() {
                info!(attempt, "server is ready");
                return true;
            }
            thread::sleep(self.interval);
        }
        warn!("unable to confirm server startup");
        false
    }
}

/// Source of browser console messages for a running page.
pub trait BrowserConsole {
    /// Load `url` headlessly and return its `SEVERE` console entries.
    fn capture_runtime_errors(&self, url: &str) -> Result<Vec<LogEntry>>;
}

/// [`BrowserConsole`] backed by a WebDriver server such as chromedriver.
#[derive(Debug, Clone)]
pub struct WebDriverConsole {
    client: Client,
    endpoint: String,
    browser_args: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct WireResponse<T> {
    value: T,
}

#[derive(Debug, Deserialize)]
struct NewSession {
    #[serde(rename = "sessionId")]
    session_id: String,
}

impl WebDriverConsole {
    pub fn new(config: &BrowserConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .context("build webdriver client")?;
        Ok(Self {
            client,
            endpoint: config.webdriver_url.trim_end_matches('/').to_string(),
            browser_args: config.browser_args.clone(),
        })
    }

    fn open_session(&self) -> Result<WebDriverSession<'_>> {
        let capabilities = json!({
            "capabilities": {
                "alwaysMatch": {
                    "browserName": "chrome",
                    "goog:chromeOptions": { "args": self.browser_args },
                    "goog:loggingPrefs": { "browser": "ALL" }
                }
            }
        });
        let created: WireResponse<NewSession> =
            self.post_json(&format!("{}/session", self.endpoint), &capabilities)?;
        debug!(session = %created.value.session_id, "opened webdriver session");
        Ok(WebDriverSession {
            console: self,
            id: created.value.session_id,
        })
    }

    fn post_json<T: for<'de> Deserialize<'de>>(&self, url: &str, body: &Value) -> Result<T> {
        let response = self
            .client
            .post(url)
            .json(body)
            .send()
            .with_context(|| format!("POST {url}"))?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().unwrap_or_default();
            return Err(anyhow!("POST {url} failed with {status}: {}", text.trim()));
        }
        response
            .json::<T>()
            .with_context(|| format!("decode response from {url}"))
    }
}

impl BrowserConsole for WebDriverConsole {
    #[instrument(skip_all, fields(url = %url))]
    fn capture_runtime_errors(&self, url: &str) -> Result<Vec<LogEntry>> {
        let session = self.open_session()?;
        session.navigate(url)?;
        let entries = session.browser_log()?;
        let severe = severe_only(entries);
        for entry in &severe {
            warn!(message = %entry.message, "severe browser console entry");
        }
        Ok(severe)
    }
}

/// Live WebDriver session, deleted when dropped.
struct WebDriverSession<'a> {
    console: &'a WebDriverConsole,
    id: String,
}

impl WebDriverSession<'_> {
    fn url(&self, suffix: &str) -> String {
        format!("{}/session/{}/{suffix}", self.console.endpoint, self.id)
    }

    fn navigate(&self, target: &str) -> Result<()> {
        let _: WireResponse<Value> = self
            .console
            .post_json(&self.url("url"), &json!({ "url": target }))
            .with_context(|| format!("navigate to {target}"))?;
        Ok(())
    }

    fn browser_log(&self) -> Result<Vec<LogEntry>> {
        let logs: WireResponse<Vec<LogEntry>> = self
            .console
            .post_json(&self.url("se/log"), &json!({ "type": "browser" }))
            .context("read browser log")?;
        Ok(logs.value)
    }
}

impl Drop for WebDriverSession<'_> {
    fn drop(&mut self) {
        let url = format!("{}/session/{}", self.console.endpoint, self.id);
        match self.console.client.delete(&url).send() {
            Ok(_) => debug!(session = %self.id, "closed webdriver session"),
            Err(err) => warn!(session = %self.id, err = %err, "failed to close webdriver session"),
        }
    }
}

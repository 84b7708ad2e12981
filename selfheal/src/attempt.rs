//! One attempt: launch `run.sh`, probe the server, gather runtime errors.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tracing::{debug, instrument, warn};

use crate::core::types::{
    CapturedOutput, LogEntry, ProbeStatus, ProcessExit, RunCommand, RunOutcome, severe_only,
};
use crate::io::config::EngineConfig;
use crate::io::probe::{BrowserConsole, HealthProbe, WebDriverConsole};
use crate::io::process::{OutputObserver, ProcessRunner, RunningProcess};
use crate::io::signal::CancelToken;

/// Everything observed during one launch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptResult {
    pub outcome: RunOutcome,
    pub output: CapturedOutput,
    /// Severe browser console entries; empty unless the probe saw the server.
    pub severe_logs: Vec<LogEntry>,
    pub probe: ProbeStatus,
}

/// Runs the program once and reports what happened.
pub trait Launcher {
    fn launch(&self, command: &RunCommand, cancel: &CancelToken) -> Result<AttemptResult>;
}

/// [`Launcher`] that spawns a local child process.
pub struct LocalLauncher {
    runner: ProcessRunner,
    probe: Option<HealthProbe>,
    console: Option<Box<dyn BrowserConsole>>,
    timeout: Option<Duration>,
}

impl LocalLauncher {
    pub fn new(runner: ProcessRunner) -> Self {
        Self {
            runner,
            probe: None,
            console: None,
            timeout: None,
        }
    }

    pub fn from_config(config: &EngineConfig, observer: Arc<dyn OutputObserver>) -> Result<Self> {
        let mut launcher = Self::new(ProcessRunner::new(observer))
            .with_timeout(config.attempt_timeout_secs.map(Duration::from_secs));
        if config.health.enabled {
            launcher = launcher.with_probe(HealthProbe::new(&config.health)?);
            if config.browser.enabled {
                launcher = launcher.with_console(Box::new(WebDriverConsole::new(&config.browser)?));
            }
        }
        Ok(launcher)
    }

    pub fn with_probe(mut self, probe: HealthProbe) -> Self {
        self.probe = Some(probe);
        self
    }

    pub fn with_console(mut self, console: Box<dyn BrowserConsole>) -> Self {
        self.console = Some(console);
        self
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    fn capture_console(&self, url: &str) -> Vec<LogEntry> {
        let Some(console) = &self.console else {
            return Vec::new();
        };
        match console.capture_runtime_errors(url) {
            Ok(entries) => severe_only(entries),
            Err(err) => {
                warn!(err = %err, "browser console capture failed; continuing without it");
                Vec::new()
            }
        }
    }

    fn supervise_with_probe(
        &self,
        probe: &HealthProbe,
        process: &mut RunningProcess,
        cancel: &CancelToken,
    ) -> Result<(RunOutcome, ProbeStatus, Vec<LogEntry>)> {
        let ready = probe.await_ready(|| {
            !cancel.is_cancelled() && matches!(process.try_exit(), Ok(None))
        });
        if cancel.is_cancelled() {
            let outcome = process.wait(cancel, None)?;
            return Ok((outcome, ProbeStatus::Skipped, Vec::new()));
        }
        if !ready {
            if let Some(exit) = process.try_exit()? {
                debug!(?exit, "process ended before the server answered");
                return Ok((RunOutcome::Finished(exit), ProbeStatus::Skipped, Vec::new()));
            }
            let exit = process.stop()?;
            return Ok((RunOutcome::Finished(exit), ProbeStatus::NotReady, Vec::new()));
        }

        let severe_logs = self.capture_console(probe.url());
        if cancel.is_cancelled() {
            let outcome = process.wait(cancel, None)?;
            return Ok((outcome, ProbeStatus::Ready, severe_logs));
        }
        // A crash while the page was loading wins over the console.
        let exit = process.stop()?;
        Ok((RunOutcome::Finished(exit), ProbeStatus::Ready, severe_logs))
    }
}

impl Launcher for LocalLauncher {
    #[instrument(skip_all, fields(command = %command))]
    fn launch(&self, command: &RunCommand, cancel: &CancelToken) -> Result<AttemptResult> {
        let mut process = self.runner.spawn(command)?;
        let (outcome, probe, severe_logs) = match &self.probe {
            Some(probe) => self.supervise_with_probe(probe, &mut process, cancel)?,
            None => (
                process.wait(cancel, self.timeout)?,
                ProbeStatus::Skipped,
                Vec::new(),
            ),
        };
        let output = process.finish()?;
        debug!(?outcome, ?probe, severe = severe_logs.len(), "attempt finished");
        Ok(AttemptResult {
            outcome,
            output,
            severe_logs,
            probe,
        })
    }
}

impl AttemptResult {
    /// Exit of the attempt, `None` when it was cancelled.
    pub fn exit(&self) -> Option<ProcessExit> {
        match self.outcome {
            RunOutcome::Finished(exit) => Some(exit),
            RunOutcome::Cancelled => None,
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::core::types::LogLevel;
    use crate::io::config::HealthConfig;
    use crate::io::process::SilentObserver;
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::thread;

    fn launcher() -> LocalLauncher {
        LocalLauncher::new(ProcessRunner::new(Arc::new(SilentObserver)))
    }

    fn sh(script: &str) -> RunCommand {
        RunCommand {
            program: "sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
            workdir: std::env::temp_dir(),
        }
    }

    fn probe(url: String, max_attempts: u32) -> HealthProbe {
        HealthProbe::new(&HealthConfig {
            enabled: true,
            url,
            max_attempts,
            interval_ms: 20,
            request_timeout_ms: 200,
        })
        .expect("probe")
    }

    fn serve_ok() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().expect("addr");
        thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(mut stream) = stream else { continue };
                let mut buf = [0_u8; 1024];
                let _ = stream.read(&mut buf);
                let _ = stream.write_all(
                    b"HTTP/1.1 200 OK\r\ncontent-length: 2\r\nconnection: close\r\n\r\nok",
                );
            }
        });
        format!("http://{addr}/")
    }

    struct FakeConsole(Vec<LogEntry>);

    impl BrowserConsole for FakeConsole {
        fn capture_runtime_errors(&self, _url: &str) -> Result<Vec<LogEntry>> {
            Ok(self.0.clone())
        }
    }

    struct BrokenConsole;

    impl BrowserConsole for BrokenConsole {
        fn capture_runtime_errors(&self, _url: &str) -> Result<Vec<LogEntry>> {
            Err(anyhow::anyhow!("chromedriver not running"))
        }
    }

    #[test]
    fn failing_script_reports_exit_and_stderr() {
        let result = launcher()
            .launch(&sh("echo boom >&2; exit 3"), &CancelToken::new())
            .expect("launch");
        assert_eq!(
            result.outcome,
            RunOutcome::Finished(ProcessExit::Exited { code: Some(3) })
        );
        assert_eq!(result.output.stderr, vec!["boom".to_string()]);
        assert_eq!(result.probe, ProbeStatus::Skipped);
    }

    #[test]
    fn attempt_timeout_kills_the_child() {
        let result = launcher()
            .with_timeout(Some(Duration::from_millis(200)))
            .launch(&sh("sleep 5"), &CancelToken::new())
            .expect("launch");
        assert_eq!(result.exit(), Some(ProcessExit::TimedOut));
    }

    #[test]
    fn cancelled_token_yields_cancelled_outcome() {
        let cancel = CancelToken::new();
        cancel.cancel();
        let result = launcher().launch(&sh("sleep 5"), &cancel).expect("launch");
        assert_eq!(result.outcome, RunOutcome::Cancelled);
        assert_eq!(result.exit(), None);
    }

    #[test]
    fn unreachable_server_is_stopped_and_marked_not_ready() {
        let result = launcher()
            .with_probe(probe("http://127.0.0.1:9/".to_string(), 3))
            .launch(&sh("sleep 5"), &CancelToken::new())
            .expect("launch");
        assert_eq!(result.probe, ProbeStatus::NotReady);
        assert_eq!(result.exit(), Some(ProcessExit::Stopped));
    }

    #[test]
    fn early_exit_skips_probe_and_keeps_real_status() {
        let result = launcher()
            .with_probe(probe("http://127.0.0.1:9/".to_string(), 50))
            .launch(&sh("echo fatal >&2; exit 1"), &CancelToken::new())
            .expect("launch");
        assert_eq!(result.probe, ProbeStatus::Skipped);
        assert_eq!(result.exit(), Some(ProcessExit::Exited { code: Some(1) }));
        assert_eq!(result.output.stderr, vec!["fatal".to_string()]);
    }

    #[test]
    fn ready_server_collects_only_severe_console_entries() {
        let entries = vec![
            LogEntry {
                level: LogLevel::Info,
                message: "loaded".to_string(),
            },
            LogEntry::severe("Uncaught ReferenceError: foo is not defined"),
        ];
        let result = launcher()
            .with_probe(probe(serve_ok(), 20))
            .with_console(Box::new(FakeConsole(entries)))
            .launch(&sh("sleep 5"), &CancelToken::new())
            .expect("launch");
        assert_eq!(result.probe, ProbeStatus::Ready);
        assert_eq!(result.exit(), Some(ProcessExit::Stopped));
        assert_eq!(
            result.severe_logs,
            vec![LogEntry::severe("Uncaught ReferenceError: foo is not defined")]
        );
    }

    #[test]
    fn console_failure_is_not_fatal() {
        let result = launcher()
            .with_probe(probe(serve_ok(), 20))
            .with_console(Box::new(BrokenConsole))
            .launch(&sh("sleep 5"), &CancelToken::new())
            .expect("launch");
        assert_eq!(result.probe, ProbeStatus::Ready);
        assert!(result.severe_logs.is_empty());
    }
}

//! Child process supervision.
//!
//! [`ProcessRunner`] launches the project's run command with both pipes
//! attached, drains each pipe on its own reader thread (one container per
//! stream, handed back on join) and echoes every line to an observer while the
//! primary thread waits, polls or probes. [`run_helper`] reuses the same
//! process-group handling for one-shot tools that take their input on stdin,
//! such as the oracle command.

use std::collections::VecDeque;
use std::io::{self, BufRead, BufReader, Read, Write};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, error, instrument, warn};
use wait_timeout::ChildExt;

use crate::core::types::{CapturedOutput, ProcessExit, RunCommand, RunOutcome, Stream};
use crate::error::EngineError;
use crate::io::signal::CancelToken;

/// How often the primary thread re-checks cancellation while waiting.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);
/// Lines kept per stream; older lines are dropped first.
pub const DEFAULT_MAX_LINES: usize = 5_000;

/// Receives every captured line as it is read.
///
/// Called from the reader threads, so implementations must not block.
pub trait OutputObserver: Send + Sync {
    fn on_line(&self, stream: Stream, line: &str);
}

/// Observer that discards lines.
pub struct SilentObserver;

impl OutputObserver for SilentObserver {
    fn on_line(&self, _stream: Stream, _line: &str) {}
}

/// Launches and supervises one child process per attempt.
#[derive(Clone)]
pub struct ProcessRunner {
    observer: Arc<dyn OutputObserver>,
    poll_interval: Duration,
    max_lines: usize,
}

impl ProcessRunner {
    pub fn new(observer: Arc<dyn OutputObserver>) -> Self {
        Self {
            observer,
            poll_interval: DEFAULT_POLL_INTERVAL,
            max_lines: DEFAULT_MAX_LINES,
        }
    }

    pub fn with_max_lines(mut self, max_lines: usize) -> Self {
        self.max_lines = max_lines.max(1);
        self
    }

    /// Start the child with stdout/stderr piped and both readers running.
    #[instrument(skip_all, fields(command = %command, workdir = %command.workdir.display()))]
    pub fn spawn(&self, command: &RunCommand) -> Result<RunningProcess> {
        debug!("spawning child process");
        let mut child = spawn_in_group(command, Stdio::null())?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("stdout was not piped"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| anyhow!("stderr was not piped"))?;

        let stdout_reader =
            spawn_line_reader(stdout, Stream::Stdout, self.observer.clone(), self.max_lines);
        let stderr_reader =
            spawn_line_reader(stderr, Stream::Stderr, self.observer.clone(), self.max_lines);

        Ok(RunningProcess {
            child,
            stdout_reader: Some(stdout_reader),
            stderr_reader: Some(stderr_reader),
            exit: None,
            poll_interval: self.poll_interval,
        })
    }

    /// Run to completion (or cancellation/timeout) and return captured output.
    pub fn run(
        &self,
        command: &RunCommand,
        cancel: &CancelToken,
        timeout: Option<Duration>,
    ) -> Result<(RunOutcome, CapturedOutput)> {
        let mut process = self.spawn(command)?;
        let outcome = process.wait(cancel, timeout)?;
        let output = process.finish()?;
        Ok((outcome, output))
    }
}

/// A launched child whose pipes are being drained in the background.
///
/// Dropping it kills and reaps the child if it is still running.
pub struct RunningProcess {
    child: Child,
    stdout_reader: Option<LineReader>,
    stderr_reader: Option<LineReader>,
    exit: Option<ProcessExit>,
    poll_interval: Duration,
}

type LineReader = JoinHandle<Result<Vec<String>>>;

impl RunningProcess {
    pub fn id(&self) -> u32 {
        self.child.id()
    }

    /// Non-blocking check whether the child has exited.
    pub fn try_exit(&mut self) -> Result<Option<ProcessExit>> {
        if let Some(exit) = self.exit {
            return Ok(Some(exit));
        }
        match self.child.try_wait().context("poll child process")? {
            Some(status) => Ok(Some(self.record_exit(status))),
            None => Ok(None),
        }
    }

    /// Block until the child exits, the token is cancelled or `timeout` passes.
    #[instrument(skip_all, fields(pid = self.child.id()))]
    pub fn wait(&mut self, cancel: &CancelToken, timeout: Option<Duration>) -> Result<RunOutcome> {
        let started = Instant::now();
        loop {
            if let Some(exit) = self.exit {
                return Ok(RunOutcome::Finished(exit));
            }
            if cancel.is_cancelled() {
                warn!("cancellation requested, terminating child");
                self.terminate()?;
                self.exit = Some(ProcessExit::Stopped);
                return Ok(RunOutcome::Cancelled);
            }
            if let Some(limit) = timeout
                && started.elapsed() >= limit
            {
                warn!(timeout_secs = limit.as_secs(), "child timed out, killing");
                self.terminate()?;
                self.exit = Some(ProcessExit::TimedOut);
                return Ok(RunOutcome::Finished(ProcessExit::TimedOut));
            }
            if let Some(status) = self
                .child
                .wait_timeout(self.poll_interval)
                .context("wait for child process")?
            {
                self.record_exit(status);
            }
        }
    }

    /// Stop a child the engine has finished observing.
    ///
    /// Returns its real exit if it already ended on its own.
    pub fn stop(&mut self) -> Result<ProcessExit> {
        if let Some(exit) = self.try_exit()? {
            return Ok(exit);
        }
        debug!(pid = self.child.id(), "stopping child process");
        self.terminate()?;
        self.exit = Some(ProcessExit::Stopped);
        Ok(ProcessExit::Stopped)
    }

    /// Join both readers and return everything they captured.
    ///
    /// Stops the child first if it is still running, so no trailing output is
    /// lost and no reader is left blocked on an open pipe.
    pub fn finish(mut self) -> Result<CapturedOutput> {
        if self.exit.is_none() {
            self.stop()?;
        }
        // Background grandchildren may still hold the pipes open.
        signal_group(self.child.id());
        let stdout = join_reader(self.stdout_reader.take()).context("join stdout")?;
        let stderr = join_reader(self.stderr_reader.take()).context("join stderr")?;
        Ok(CapturedOutput { stdout, stderr })
    }

    fn record_exit(&mut self, status: ExitStatus) -> ProcessExit {
        debug!(exit_code = ?status.code(), "child process exited");
        let exit = ProcessExit::Exited {
            code: status.code(),
        };
        self.exit = Some(exit);
        exit
    }

    fn terminate(&mut self) -> Result<()> {
        signal_group(self.child.id());
        if self.child.try_wait().context("poll child process")?.is_none() {
            self.child.kill().context("kill child process")?;
        }
        self.child.wait().context("wait child process after kill")?;
        Ok(())
    }
}

impl Drop for RunningProcess {
    fn drop(&mut self) {
        if self.exit.is_none() {
            signal_group(self.child.id());
            let _ = self.child.kill();
            let _ = self.child.wait();
        }
    }
}

fn spawn_line_reader<R: Read + Send + 'static>(
    reader: R,
    stream: Stream,
    observer: Arc<dyn OutputObserver>,
    max_lines: usize,
) -> LineReader {
    thread::spawn(move || read_lines(reader, stream, observer.as_ref(), max_lines))
}

/// Read decoded lines until end-of-stream, echoing each to `observer`.
fn read_lines<R: Read>(
    reader: R,
    stream: Stream,
    observer: &dyn OutputObserver,
    max_lines: usize,
) -> Result<Vec<String>> {
    let mut buf_reader = BufReader::new(reader);
    let mut lines = VecDeque::new();
    let mut dropped = 0usize;

    loop {
        let mut raw = Vec::new();
        let n = buf_reader
            .read_until(b'\n', &mut raw)
            .context("read line")?;
        if n == 0 {
            break;
        }
        let line = String::from_utf8_lossy(&raw)
            .trim_end_matches(['\n', '\r'])
            .to_string();
        observer.on_line(stream, &line);
        if lines.len() >= max_lines {
            lines.pop_front();
            dropped += 1;
        }
        lines.push_back(line);
    }

    if dropped > 0 {
        warn!(?stream, dropped, "captured output exceeded line cap, kept the tail");
    }
    Ok(Vec::from(lines))
}

fn join_reader(handle: Option<LineReader>) -> Result<Vec<String>> {
    handle.map_or_else(|| Ok(Vec::new()), join_thread)
}

fn join_thread<T>(handle: JoinHandle<Result<T>>) -> Result<T> {
    handle
        .join()
        .unwrap_or_else(|_| Err(anyhow!("output reader thread panicked")))
}

/// Kill every process in the child's group (the child is the group leader).
#[cfg(unix)]
fn signal_group(pid: u32) {
    let target = format!("-{pid}");
    match Command::new("kill")
        .args(["-KILL", "--", &target])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
    {
        Ok(status) => debug!(pid, delivered = status.success(), "signalled process group"),
        Err(err) => debug!(pid, err = %err, "could not signal process group"),
    }
}

#[cfg(not(unix))]
fn signal_group(_pid: u32) {}

/// Spawn `command` with piped output as the leader of a new process group.
///
/// Own process group: ctrl+c reaches only the engine, and the whole tree can
/// be torn down together.
fn spawn_in_group(command: &RunCommand, stdin: Stdio) -> Result<Child> {
    let mut cmd = Command::new(&command.program);
    cmd.args(&command.args)
        .current_dir(&command.workdir)
        .stdin(stdin)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        cmd.process_group(0);
    }
    let child = cmd.spawn().map_err(|source| {
        error!(err = %source, "failed to spawn command");
        EngineError::ProcessLaunch {
            command: command.to_string(),
            workdir: command.workdir.clone(),
            source,
        }
    })?;
    Ok(child)
}

/// Output of a one-shot helper run through [`run_helper`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HelperOutput {
    pub exit: ProcessExit,
    pub stdout: String,
    pub stderr: String,
    /// Bytes discarded past the per-stream capture limit.
    pub dropped_bytes: u64,
}

/// Feed `input` to `command` on stdin and collect what it prints.
///
/// Stdin is written from its own thread so a helper that answers before
/// reading everything cannot stall the wait. On timeout the helper's whole
/// process group is killed and the exit is [`ProcessExit::TimedOut`]. At most
/// `max_bytes` are kept per stream; the rest is drained and counted.
#[instrument(skip_all, fields(command = %command, timeout_secs = timeout.as_secs()))]
pub fn run_helper(
    command: &RunCommand,
    input: &str,
    timeout: Duration,
    max_bytes: usize,
) -> Result<HelperOutput> {
    debug!("spawning helper process");
    let mut child = spawn_in_group(command, Stdio::piped())?;
    let (Some(mut stdin), Some(stdout), Some(stderr)) =
        (child.stdin.take(), child.stdout.take(), child.stderr.take())
    else {
        return Err(anyhow!("helper pipes were not attached"));
    };

    let input = input.as_bytes().to_vec();
    let feeder = thread::spawn(move || stdin.write_all(&input));
    let stdout_sink = thread::spawn(move || capture_bytes(stdout, max_bytes));
    let stderr_sink = thread::spawn(move || capture_bytes(stderr, max_bytes));

    let exit = match child.wait_timeout(timeout).context("wait for helper")? {
        Some(status) => ProcessExit::Exited {
            code: status.code(),
        },
        None => {
            warn!("helper timed out, killing its process group");
            signal_group(child.id());
            if child.try_wait().context("poll helper")?.is_none() {
                child.kill().context("kill helper")?;
            }
            child.wait().context("wait helper after kill")?;
            ProcessExit::TimedOut
        }
    };
    // Background grandchildren may still hold the pipes open.
    signal_group(child.id());

    match feeder.join() {
        Ok(Ok(())) => {}
        Ok(Err(err)) => debug!(err = %err, "helper closed stdin early"),
        Err(_) => return Err(anyhow!("stdin writer thread panicked")),
    }
    let stdout = join_thread(stdout_sink).context("join stdout")?;
    let stderr = join_thread(stderr_sink).context("join stderr")?;

    let dropped_bytes = stdout.dropped + stderr.dropped;
    if dropped_bytes > 0 {
        warn!(dropped_bytes, max_bytes, "helper output exceeded capture limit");
    }
    debug!(?exit, "helper finished");
    Ok(HelperOutput {
        exit,
        stdout: String::from_utf8_lossy(&stdout.kept).into_owned(),
        stderr: String::from_utf8_lossy(&stderr.kept).into_owned(),
        dropped_bytes,
    })
}

/// Sink that keeps the first `limit` bytes and counts everything after.
struct CappedSink {
    kept: Vec<u8>,
    limit: usize,
    dropped: u64,
}

impl Write for CappedSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let keep = self.limit.saturating_sub(self.kept.len()).min(buf.len());
        self.kept.extend_from_slice(&buf[..keep]);
        self.dropped += (buf.len() - keep) as u64;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn capture_bytes<R: Read>(mut reader: R, limit: usize) -> Result<CappedSink> {
    let mut sink = CappedSink {
        kept: Vec::new(),
        limit,
        dropped: 0,
    };
    io::copy(&mut reader, &mut sink).context("read helper output")?;
    Ok(sink)
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingObserver {
        lines: Mutex<Vec<(Stream, String)>>,
    }

    impl OutputObserver for RecordingObserver {
        fn on_line(&self, stream: Stream, line: &str) {
            self.lines
                .lock()
                .expect("observer lock")
                .push((stream, line.to_string()));
        }
    }

    fn sh(script: &str, dir: &std::path::Path) -> RunCommand {
        RunCommand {
            program: "sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
            workdir: dir.to_path_buf(),
        }
    }

    #[test]
    fn captures_both_streams_in_order() {
        let temp = tempfile::tempdir().expect("tempdir");
        let observer = Arc::new(RecordingObserver::default());
        let runner = ProcessRunner::new(observer.clone());

        let (outcome, output) = runner
            .run(
                &sh("echo one; echo two; echo oops >&2; exit 3", temp.path()),
                &CancelToken::new(),
                None,
            )
            .expect("run");

        assert_eq!(
            outcome,
            RunOutcome::Finished(ProcessExit::Exited { code: Some(3) })
        );
        assert_eq!(output.stdout, vec!["one", "two"]);
        assert_eq!(output.stderr, vec!["oops"]);
        let echoed = observer.lines.lock().expect("lock").len();
        assert_eq!(echoed, 3);
    }

    #[test]
    fn zero_exit_is_process_success() {
        let temp = tempfile::tempdir().expect("tempdir");
        let runner = ProcessRunner::new(Arc::new(SilentObserver));
        let (outcome, _) = runner
            .run(&sh("true", temp.path()), &CancelToken::new(), None)
            .expect("run");
        match outcome {
            RunOutcome::Finished(exit) => assert!(exit.is_success()),
            RunOutcome::Cancelled => panic!("unexpected cancel"),
        }
    }

    #[test]
    fn cancelled_token_terminates_child() {
        let temp = tempfile::tempdir().expect("tempdir");
        let runner = ProcessRunner::new(Arc::new(SilentObserver));
        let cancel = CancelToken::new();
        let trigger = cancel.clone();
        let canceller = thread::spawn(move || {
            thread::sleep(Duration::from_millis(200));
            trigger.cancel();
        });

        let started = Instant::now();
        let (outcome, _) = runner
            .run(&sh("echo started; sleep 30", temp.path()), &cancel, None)
            .expect("run");
        canceller.join().expect("join canceller");

        assert_eq!(outcome, RunOutcome::Cancelled);
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn timeout_kills_child() {
        let temp = tempfile::tempdir().expect("tempdir");
        let runner = ProcessRunner::new(Arc::new(SilentObserver));
        let (outcome, _) = runner
            .run(
                &sh("sleep 30", temp.path()),
                &CancelToken::new(),
                Some(Duration::from_millis(200)),
            )
            .expect("run");
        assert_eq!(outcome, RunOutcome::Finished(ProcessExit::TimedOut));
    }

    #[test]
    fn missing_program_is_launch_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        let runner = ProcessRunner::new(Arc::new(SilentObserver));
        let command = RunCommand {
            program: "definitely-not-a-real-binary-selfheal".to_string(),
            args: Vec::new(),
            workdir: temp.path().to_path_buf(),
        };
        let err = runner
            .run(&command, &CancelToken::new(), None)
            .err()
            .expect("launch should fail");
        assert!(matches!(
            err.downcast_ref::<EngineError>(),
            Some(EngineError::ProcessLaunch { .. })
        ));
    }

    #[test]
    fn line_cap_keeps_tail() {
        let temp = tempfile::tempdir().expect("tempdir");
        let runner = ProcessRunner::new(Arc::new(SilentObserver)).with_max_lines(2);
        let (_, output) = runner
            .run(
                &sh("echo a; echo b; echo c", temp.path()),
                &CancelToken::new(),
                None,
            )
            .expect("run");
        assert_eq!(output.stdout, vec!["b", "c"]);
    }

    #[test]
    fn stop_reports_stopped_for_running_child() {
        let temp = tempfile::tempdir().expect("tempdir");
        let runner = ProcessRunner::new(Arc::new(SilentObserver));
        let mut process = runner.spawn(&sh("sleep 30", temp.path())).expect("spawn");
        assert_eq!(process.try_exit().expect("poll"), None);
        assert_eq!(process.stop().expect("stop"), ProcessExit::Stopped);
        process.finish().expect("finish");
    }

    fn helper(script: &str, dir: &std::path::Path) -> RunCommand {
        RunCommand {
            program: "sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
            workdir: dir.to_path_buf(),
        }
    }

    #[test]
    fn helper_receives_input_on_stdin() {
        let temp = tempfile::tempdir().expect("tempdir");
        let output = run_helper(
            &helper("cat; echo warn >&2", temp.path()),
            "hello\n",
            Duration::from_secs(5),
            1000,
        )
        .expect("run");
        assert_eq!(output.exit, ProcessExit::Exited { code: Some(0) });
        assert_eq!(output.stdout, "hello\n");
        assert_eq!(output.stderr, "warn\n");
        assert_eq!(output.dropped_bytes, 0);
    }

    #[test]
    fn helper_output_past_limit_is_counted_not_kept() {
        let temp = tempfile::tempdir().expect("tempdir");
        let output = run_helper(
            &helper("printf 0123456789", temp.path()),
            "",
            Duration::from_secs(5),
            4,
        )
        .expect("run");
        assert_eq!(output.stdout, "0123");
        assert_eq!(output.dropped_bytes, 6);
    }

    #[test]
    fn helper_that_ignores_stdin_still_times_out() {
        let temp = tempfile::tempdir().expect("tempdir");
        let big = "x".repeat(1 << 20);
        let started = Instant::now();
        let output = run_helper(
            &helper("sleep 30", temp.path()),
            &big,
            Duration::from_millis(300),
            1000,
        )
        .expect("run");
        assert_eq!(output.exit, ProcessExit::TimedOut);
        assert!(started.elapsed() < Duration::from_secs(10));
    }
}

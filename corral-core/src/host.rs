// ABOUTME: Session Host Controller: runs one agent container and relays its framed output records.
// ABOUTME: Enforces hard/idle liveness deadlines and resolves every run to a ContainerOutput value.

use crate::config::ContainerConfig;
use crate::container::{Launch, StopCommand};
use crate::deadlines::{Expiry, LivenessDeadlines, Timeouts};
use crate::metrics;
use corral_agent::{ContainerInput, ContainerOutput, FrameDecoder, Mailbox, OutputStatus};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::time::{Instant, MissedTickBehavior};

const STDERR_TAIL_LINES: usize = 50;
const STOP_TIMEOUT: Duration = Duration::from_secs(15);
const EXIT_WAIT_TIMEOUT: Duration = Duration::from_secs(10);
const STDERR_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy)]
pub struct HostLimits {
    pub timeouts: Timeouts,
    /// Longest stdout line decoded, and the stderr bytes kept for diagnostics
    pub max_output_bytes: usize,
}

impl HostLimits {
    pub fn from_config(config: &ContainerConfig) -> Self {
        Self {
            timeouts: Timeouts {
                hard: config.hard_timeout(),
                idle: config.idle_timeout(),
                grace: config.close_grace(),
            },
            max_output_bytes: config.max_output_bytes,
        }
    }
}

/// One container invocation
#[derive(Debug, Clone)]
pub struct HostRun {
    pub group: String,
    pub launch: Launch,
    /// Host side of the session's ipc directory; idle close writes its sentinel here
    pub ipc_dir: PathBuf,
    /// Where the per-run log file goes, if anywhere
    pub log_dir: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub output: ContainerOutput,
    /// Well-formed records decoded from stdout
    pub records: usize,
    pub exit_code: Option<i32>,
    /// The deadline that forced the container down, if one did
    pub forced_by: Option<Expiry>,
    /// The session was asked to close after going idle
    pub idle_closed: bool,
    pub duration: Duration,
}

impl RunOutcome {
    pub fn status(&self) -> OutputStatus {
        self.output.status
    }
}

/// How the process ended
#[derive(Debug, Clone, PartialEq)]
enum Ending {
    SpawnFailed(String),
    Exited { code: Option<i32> },
    Forced { expiry: Expiry, code: Option<i32> },
}

impl Ending {
    fn exit_code(&self) -> Option<i32> {
        match self {
            Self::SpawnFailed(_) => None,
            Self::Exited { code } | Self::Forced { code, .. } => *code,
        }
    }
}

/// What the controller has learned from stdout so far
#[derive(Debug)]
struct OutputState {
    decoder: FrameDecoder,
    /// Lines longer than this are dropped unread
    max_line_bytes: usize,
    bytes: usize,
    overlong_lines: usize,
    records: usize,
    session_id: Option<String>,
    last_result: Option<String>,
    last_record: Option<ContainerOutput>,
}

impl OutputState {
    fn new(max_line_bytes: usize) -> Self {
        Self {
            decoder: FrameDecoder::new(),
            max_line_bytes,
            bytes: 0,
            overlong_lines: 0,
            records: 0,
            session_id: None,
            last_result: None,
            last_record: None,
        }
    }

    /// Feed one raw stdout line; returns a record when one completes
    fn accept_line(&mut self, group: &str, raw: &[u8]) -> Option<ContainerOutput> {
        self.bytes += raw.len();
        let text = String::from_utf8_lossy(raw);
        let line = text.trim_end_matches(['\n', '\r']);
        match self.decoder.push_line(line)? {
            Ok(record) => {
                self.records += 1;
                if let Some(id) = &record.new_session_id {
                    self.session_id = Some(id.clone());
                }
                if let Some(result) = &record.result {
                    self.last_result = Some(result.clone());
                }
                self.last_record = Some(record.clone());
                metrics::record_output_record();
                Some(record)
            }
            Err(e) => {
                metrics::record_framing_error();
                tracing::warn!(group = %group, error = %e, line = %e.line, "Dropping malformed output record");
                None
            }
        }
    }

    /// A line went past `max_line_bytes` and was skipped
    fn skip_line(&mut self, group: &str, len: usize) {
        self.bytes += len;
        self.overlong_lines += 1;
        metrics::record_error("stdout_line_too_long");
        if self.decoder.discard_line() {
            metrics::record_framing_error();
            tracing::warn!(group = %group, len, max = self.max_line_bytes, "Dropping oversized output record");
        } else {
            tracing::warn!(group = %group, len, max = self.max_line_bytes, "Skipping oversized stdout line");
        }
    }
}

/// One step of [`BoundedLines`]
#[derive(Debug, PartialEq)]
enum LineRead {
    Line(Vec<u8>),
    /// A line of this many bytes exceeded the limit and was thrown away
    Overlong(usize),
    Eof,
}

/// Newline-delimited reader that never holds more than `max` bytes of one line.
///
/// Cancel-safe: partial lines live in the struct, so dropping a pending
/// `next_line` future loses nothing.
struct BoundedLines<R> {
    reader: R,
    max: usize,
    line: Vec<u8>,
    /// Bytes of the current line seen after it went over the limit
    skipped: Option<usize>,
}

impl<R: AsyncBufRead + Unpin> BoundedLines<R> {
    fn new(reader: R, max: usize) -> Self {
        Self {
            reader,
            max,
            line: Vec::new(),
            skipped: None,
        }
    }

    async fn next_line(&mut self) -> std::io::Result<LineRead> {
        loop {
            let available = self.reader.fill_buf().await?;
            if available.is_empty() {
                if let Some(len) = self.skipped.take() {
                    return Ok(LineRead::Overlong(len));
                }
                if self.line.is_empty() {
                    return Ok(LineRead::Eof);
                }
                return Ok(LineRead::Line(std::mem::take(&mut self.line)));
            }

            let (used, complete) = match available.iter().position(|b| *b == b'\n') {
                Some(pos) => (pos + 1, true),
                None => (available.len(), false),
            };
            if let Some(len) = self.skipped.as_mut() {
                *len += used;
            } else if self.line.len() + used > self.max {
                self.skipped = Some(self.line.len() + used);
                self.line = Vec::new();
            } else {
                self.line.extend_from_slice(&available[..used]);
            }
            self.reader.consume(used);

            if complete {
                if let Some(len) = self.skipped.take() {
                    return Ok(LineRead::Overlong(len));
                }
                return Ok(LineRead::Line(std::mem::take(&mut self.line)));
            }
        }
    }
}

/// Stderr lines kept for diagnostics
#[derive(Debug, Default)]
struct StderrCapture {
    tail: VecDeque<String>,
    bytes: usize,
    truncated: bool,
}

impl StderrCapture {
    fn lines(&self) -> Vec<String> {
        self.tail.iter().cloned().collect()
    }
}

/// Decide the run's outcome.
///
/// Any decoded record means the session did useful work, so the run
/// succeeds with the last known session id and result even if a deadline
/// later killed the container. The exception is a non-zero exit whose last
/// record was itself an error: that record is the outcome.
fn resolve(state: &OutputState, ending: &Ending, stderr: &[String], timeouts: &Timeouts) -> ContainerOutput {
    if let Some(last) = &state.last_record {
        let failed_exit = matches!(ending, Ending::Exited { code: Some(code) } if *code != 0);
        if failed_exit && last.status == OutputStatus::Error {
            let mut output = last.clone();
            if output.new_session_id.is_none() {
                output.new_session_id = state.session_id.clone();
            }
            return output;
        }
        return ContainerOutput::success(state.last_result.clone(), state.session_id.clone());
    }

    let mut message = match ending {
        Ending::SpawnFailed(reason) => return ContainerOutput::error(reason.clone(), None),
        Ending::Forced {
            expiry: Expiry::Hard,
            ..
        } => format!(
            "Container timed out after {:?} with no output",
            timeouts.hard
        ),
        Ending::Forced { expiry, .. } => format!(
            "Container was stopped ({} deadline) before producing output",
            expiry.as_str()
        ),
        Ending::Exited { code: Some(code) } => {
            format!("Container exited with code {code} without producing output")
        }
        Ending::Exited { code: None } => {
            "Container was terminated by a signal without producing output".to_string()
        }
    };
    if let Some(last) = stderr.last() {
        message.push_str(": ");
        message.push_str(last);
    }
    ContainerOutput::error(message, None)
}

enum HostStep {
    Read(std::io::Result<LineRead>),
    Exited(std::io::Result<std::process::ExitStatus>),
    Tick,
}

#[derive(Debug, Clone)]
pub struct SessionHost {
    limits: HostLimits,
}

impl SessionHost {
    pub fn new(limits: HostLimits) -> Self {
        Self { limits }
    }

    pub fn limits(&self) -> &HostLimits {
        &self.limits
    }

    /// Run one container to completion.
    ///
    /// `on_output` sees every decoded record as it arrives. The returned
    /// outcome never represents a controller failure as an `Err`; spawn
    /// failures, crashes, and timeouts all resolve to `status: error`.
    pub async fn run<F>(&self, run: HostRun, input: &ContainerInput, mut on_output: F) -> RunOutcome
    where
        F: FnMut(&ContainerOutput) + Send,
    {
        let started = Instant::now();
        let group = run.group.as_str();
        let timeouts = self.limits.timeouts;
        let mut state = OutputState::new(self.limits.max_output_bytes);
        let stderr = Arc::new(Mutex::new(StderrCapture::default()));

        tracing::info!(
            group = %group,
            program = %run.launch.program,
            session_id = ?input.session_id,
            "Starting container"
        );

        let mut idle_closed = false;
        let ending = match Command::new(&run.launch.program)
            .args(&run.launch.args)
            .envs(run.launch.env.iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
        {
            Err(e) => {
                tracing::error!(group = %group, error = %e, program = %run.launch.program, "Failed to spawn container");
                metrics::record_error("container_spawn");
                Ending::SpawnFailed(format!("Failed to spawn {}: {}", run.launch.program, e))
            }
            Ok(mut child) => {
                metrics::record_container_started(group);
                self.feed_input(&mut child, group, input).await;

                let stderr_handle = child
                    .stderr
                    .take()
                    .map(|pipe| spawn_stderr_reader(pipe, group.to_string(), stderr.clone(), self.limits.max_output_bytes));

                let ending = self
                    .supervise(&mut child, &run, &mut state, &mut idle_closed, &mut on_output)
                    .await;

                if let Some(handle) = stderr_handle {
                    if tokio::time::timeout(STDERR_DRAIN_TIMEOUT, handle).await.is_err() {
                        tracing::debug!(group = %group, "Container stderr still open after exit");
                    }
                }
                ending
            }
        };

        let duration = started.elapsed();
        let stderr_lines = stderr
            .lock()
            .map(|capture| capture.lines())
            .unwrap_or_default();
        let output = resolve(&state, &ending, &stderr_lines, &timeouts);
        let forced_by = match &ending {
            Ending::Forced { expiry, .. } => Some(*expiry),
            _ => None,
        };

        let outcome = RunOutcome {
            output,
            records: state.records,
            exit_code: ending.exit_code(),
            forced_by,
            idle_closed,
            duration,
        };

        metrics::record_container_duration(
            duration.as_secs_f64(),
            match outcome.output.status {
                OutputStatus::Success => "success",
                OutputStatus::Error => "error",
                OutputStatus::Timeout => "timeout",
            },
        );
        tracing::info!(
            group = %group,
            status = ?outcome.output.status,
            records = outcome.records,
            exit_code = ?outcome.exit_code,
            forced_by = ?outcome.forced_by.map(|e| e.as_str()),
            duration_ms = duration.as_millis() as u64,
            "Container finished"
        );

        if let Some(dir) = &run.log_dir {
            let stderr_truncated = stderr.lock().map(|c| c.truncated).unwrap_or(false);
            let log = RunLog {
                group,
                launch: &run.launch,
                outcome: &outcome,
                stdout_bytes: state.bytes,
                stdout_overlong_lines: state.overlong_lines,
                stderr_truncated,
                stderr: &stderr_lines,
            };
            if let Err(e) = log.write(dir).await {
                tracing::warn!(group = %group, error = %e, "Failed to write container run log");
            }
        }

        outcome
    }

    async fn feed_input(&self, child: &mut Child, group: &str, input: &ContainerInput) {
        let Some(mut stdin) = child.stdin.take() else {
            return;
        };
        let payload = match serde_json::to_vec(input) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::error!(group = %group, error = %e, "Failed to serialize container input");
                return;
            }
        };
        if let Err(e) = stdin.write_all(&payload).await {
            tracing::warn!(group = %group, error = %e, "Failed to write container input");
        }
        if let Err(e) = stdin.shutdown().await {
            tracing::debug!(group = %group, error = %e, "Failed to close container stdin");
        }
    }

    async fn supervise<F>(
        &self,
        child: &mut Child,
        run: &HostRun,
        state: &mut OutputState,
        idle_closed: &mut bool,
        on_output: &mut F,
    ) -> Ending
    where
        F: FnMut(&ContainerOutput) + Send,
    {
        let group = run.group.as_str();
        let Some(stdout) = child.stdout.take() else {
            tracing::error!(group = %group, "Container stdout was not captured");
            let _ = child.start_kill();
            let code = child.wait().await.ok().and_then(|s| s.code());
            return Ending::Exited { code };
        };

        let mut lines = BoundedLines::new(BufReader::new(stdout), state.max_line_bytes);
        let mut deadlines = LivenessDeadlines::new(self.limits.timeouts, Instant::now());
        let mut tick = tokio::time::interval(deadlines.tick_interval());
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut stdout_open = true;

        loop {
            let step = tokio::select! {
                read = lines.next_line(), if stdout_open => HostStep::Read(read),
                status = child.wait(), if !stdout_open => HostStep::Exited(status),
                _ = tick.tick() => HostStep::Tick,
            };

            match step {
                HostStep::Read(Ok(LineRead::Eof)) => stdout_open = false,
                HostStep::Read(Ok(LineRead::Line(line))) => {
                    if let Some(record) = state.accept_line(group, &line) {
                        deadlines.record_activity(Instant::now());
                        tracing::debug!(group = %group, status = ?record.status, "Container output record");
                        on_output(&record);
                    }
                }
                HostStep::Read(Ok(LineRead::Overlong(len))) => state.skip_line(group, len),
                HostStep::Read(Err(e)) => {
                    tracing::warn!(group = %group, error = %e, "Failed reading container stdout");
                    stdout_open = false;
                }
                HostStep::Exited(status) => {
                    let code = match status {
                        Ok(status) => status.code(),
                        Err(e) => {
                            tracing::warn!(group = %group, error = %e, "Failed waiting for container");
                            None
                        }
                    };
                    return Ending::Exited { code };
                }
                HostStep::Tick => match deadlines.check(Instant::now()) {
                    None => {}
                    Some(Expiry::Idle) => {
                        tracing::info!(group = %group, "Container idle; requesting close");
                        metrics::record_container_timeout(Expiry::Idle.as_str());
                        if let Err(e) = Mailbox::for_ipc_root(&run.ipc_dir).request_close().await {
                            tracing::warn!(group = %group, error = %e, "Failed to write close sentinel");
                        }
                        deadlines.mark_close_requested(Instant::now());
                        *idle_closed = true;
                    }
                    Some(expiry) => {
                        tracing::warn!(group = %group, deadline = expiry.as_str(), "Container deadline passed; stopping it");
                        metrics::record_container_timeout(expiry.as_str());
                        let code = force_stop(child, run.launch.stop.as_ref(), group).await;
                        return Ending::Forced { expiry, code };
                    }
                },
            }
        }
    }
}

fn spawn_stderr_reader(
    pipe: tokio::process::ChildStderr,
    group: String,
    capture: Arc<Mutex<StderrCapture>>,
    max_bytes: usize,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut lines = BoundedLines::new(BufReader::new(pipe), max_bytes);
        loop {
            let raw = match lines.next_line().await {
                Ok(LineRead::Eof) | Err(_) => break,
                Ok(LineRead::Overlong(n)) => {
                    let mut capture = capture.lock().unwrap_or_else(|e| e.into_inner());
                    capture.bytes += n;
                    capture.truncated = true;
                    continue;
                }
                Ok(LineRead::Line(raw)) => raw,
            };
            let n = raw.len();
            let text = String::from_utf8_lossy(&raw);
            let line = text.trim_end();
            if line.is_empty() {
                continue;
            }
            tracing::debug!(group = %group, "container: {}", line);

            let mut capture = capture.lock().unwrap_or_else(|e| e.into_inner());
            capture.bytes += n;
            if capture.bytes > max_bytes {
                capture.truncated = true;
                continue;
            }
            if capture.tail.len() == STDERR_TAIL_LINES {
                capture.tail.pop_front();
            }
            capture.tail.push_back(line.to_string());
        }
    })
}

/// Ask the runtime to stop the container, then kill the local process
async fn force_stop(child: &mut Child, stop: Option<&StopCommand>, group: &str) -> Option<i32> {
    if let Some(stop) = stop {
        let result = tokio::time::timeout(
            STOP_TIMEOUT,
            Command::new(&stop.program)
                .args(&stop.args)
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status(),
        )
        .await;
        match result {
            Ok(Ok(status)) if status.success() => {}
            Ok(Ok(status)) => tracing::warn!(group = %group, ?status, "Container stop command failed"),
            Ok(Err(e)) => tracing::warn!(group = %group, error = %e, "Failed to run container stop command"),
            Err(_) => tracing::warn!(group = %group, "Container stop command timed out"),
        }
    }

    if let Err(e) = child.start_kill() {
        tracing::debug!(group = %group, error = %e, "Container process already gone");
    }
    match tokio::time::timeout(EXIT_WAIT_TIMEOUT, child.wait()).await {
        Ok(Ok(status)) => status.code(),
        Ok(Err(e)) => {
            tracing::warn!(group = %group, error = %e, "Failed waiting for stopped container");
            None
        }
        Err(_) => {
            tracing::error!(group = %group, "Container did not exit after kill");
            None
        }
    }
}

struct RunLog<'a> {
    group: &'a str,
    launch: &'a Launch,
    outcome: &'a RunOutcome,
    stdout_bytes: usize,
    stdout_overlong_lines: usize,
    stderr_truncated: bool,
    stderr: &'a [String],
}

impl RunLog<'_> {
    fn render(&self) -> String {
        let outcome = self.outcome;
        let mut lines = vec![
            "=== Container Run Log ===".to_string(),
            format!("Timestamp: {}", chrono::Utc::now().to_rfc3339()),
            format!("Group: {}", self.group),
            format!("Command: {} {}", self.launch.program, self.launch.args.join(" ")),
            format!("Duration: {}ms", outcome.duration.as_millis()),
            format!(
                "Exit code: {}",
                outcome
                    .exit_code
                    .map(|c| c.to_string())
                    .unwrap_or_else(|| "none".to_string())
            ),
            format!(
                "Stopped by deadline: {}",
                outcome.forced_by.map(|e| e.as_str()).unwrap_or("no")
            ),
            format!("Idle close requested: {}", outcome.idle_closed),
            format!("Output records: {}", outcome.records),
            format!("Status: {:?}", outcome.output.status),
            format!("Stdout bytes: {}", self.stdout_bytes),
            format!("Stdout lines skipped as oversized: {}", self.stdout_overlong_lines),
            format!("Stderr truncated: {}", self.stderr_truncated),
        ];
        if let Some(error) = &outcome.output.error {
            lines.push(format!("Error: {error}"));
        }
        lines.push(String::new());
        lines.push("=== Stderr (tail) ===".to_string());
        lines.extend(self.stderr.iter().cloned());
        lines.push(String::new());
        lines.join("\n")
    }

    async fn write(&self, dir: &Path) -> anyhow::Result<PathBuf> {
        use anyhow::Context;

        tokio::fs::create_dir_all(dir)
            .await
            .with_context(|| format!("Failed to create {}", dir.display()))?;
        let stamp = chrono::Utc::now().format("%Y%m%dT%H%M%S%.3fZ");
        let path = dir.join(format!("container-{stamp}.log"));
        tokio::fs::write(&path, self.render())
            .await
            .with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(path)
    }
}

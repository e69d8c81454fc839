//! Step execution service
//!
//! Runs one step's command as an OS process:
//! - Spawning `<shell> -c <command>` in its own process group
//! - Streaming stdout/stderr into an [`OutputSink`], one line per chunk;
//!   lines longer than [`MAX_CHUNK_BYTES`] are split
//! - Enforcing the step time limit and build cancellation
//! - Mapping the process result to a [`StepOutcome`]
//!
//! A stopped step's process group is sent SIGTERM, given a grace period, then
//! killed.

use async_trait::async_trait;
use std::io;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::time::Instant;
use tracing::{debug, warn};
use vortexia_core::domain::build::FailureKind;
use vortexia_core::domain::log::OutputStream;
use vortexia_core::domain::pipeline::StepDefinition;
use vortexia_core::state::StepOutcome;

use crate::config::EngineConfig;
use crate::repository::GatewayError;
use crate::service::cancel::CancelSignal;

/// Largest chunk handed to the sink; longer lines are delivered in pieces
pub const MAX_CHUNK_BYTES: usize = 64 * 1024;

/// Destination of a step's output
///
/// A write only returns once the chunk is durable, so a failed write means
/// the output can no longer be recorded.
#[async_trait]
pub trait OutputSink: Send + Sync {
    async fn write(&self, stream: OutputStream, data: String) -> Result<(), GatewayError>;
}

/// Service trait for running a single step
#[async_trait]
pub trait StepExecutor: Send + Sync {
    /// Runs a step to completion
    ///
    /// Never returns an error: every way a step can end is a [`StepOutcome`].
    async fn execute(
        &self,
        step: &StepDefinition,
        sink: &dyn OutputSink,
        cancel: CancelSignal,
    ) -> StepOutcome;
}

/// Executes steps through a local shell
pub struct ShellExecutor {
    shell: String,
    default_timeout: Option<Duration>,
    grace_period: Duration,
}

/// How the wait loop ended
enum Finish {
    Exited(ExitStatus),
    Stopped(FailureKind, String),
}

impl ShellExecutor {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            shell: config.shell.clone(),
            default_timeout: config.step_timeout,
            grace_period: config.kill_grace_period,
        }
    }

    fn command(&self, step: &StepDefinition) -> Command {
        let mut command = Command::new(&self.shell);
        command
            .arg("-c")
            .arg(&step.command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .process_group(0);

        command
    }

    /// Asks the step's process group to stop, then kills it after the grace period
    async fn terminate(&self, child: &mut Child) {
        if let Some(pid) = child.id() {
            let group = -(pid as libc::pid_t);

            // SAFETY: the child was spawned as leader of its own process group
            unsafe {
                libc::kill(group, libc::SIGTERM);
            }

            match tokio::time::timeout(self.grace_period, child.wait()).await {
                Ok(_) => debug!("Process group {} stopped after SIGTERM", pid),
                Err(_) => warn!(
                    "Process group {} still running after {:?}; killing",
                    pid, self.grace_period
                ),
            }

            // SAFETY: as above; also reaches children that outlived the leader
            unsafe {
                libc::kill(group, libc::SIGKILL);
            }
        }

        if let Err(e) = child.kill().await {
            debug!("Kill after termination failed: {}", e);
        }
    }

    async fn run(
        &self,
        step: &StepDefinition,
        sink: &dyn OutputSink,
        mut cancel: CancelSignal,
    ) -> StepOutcome {
        let mut child = match self.command(step).spawn() {
            Ok(child) => child,
            Err(e) => {
                let message = format!("failed to start command: {}", e);
                let _ = sink.write(OutputStream::System, format!("{}\n", message)).await;
                return StepOutcome::failed(FailureKind::Error, None, message);
            }
        };

        let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
            self.terminate(&mut child).await;
            return StepOutcome::failed(FailureKind::Error, None, "command output was not captured");
        };
        let mut stdout = OutputReader::new(stdout);
        let mut stderr = OutputReader::new(stderr);
        let (mut stdout_open, mut stderr_open) = (true, true);

        let limit = step
            .timeout_seconds
            .map(Duration::from_secs)
            .or(self.default_timeout);
        let deadline = tokio::time::sleep_until(
            limit.map_or_else(far_future, |limit| Instant::now() + limit),
        );
        tokio::pin!(deadline);

        // Once the process exits, pipes held open by its children get this long to close
        let drain = tokio::time::sleep(self.grace_period);
        tokio::pin!(drain);

        let mut status: Option<ExitStatus> = None;

        let finish = loop {
            if let (Some(status), false, false) = (status, stdout_open, stderr_open) {
                break Finish::Exited(status);
            }

            tokio::select! {
                chunk = stdout.next_chunk(), if stdout_open => match chunk {
                    Ok(Some(chunk)) => {
                        if let Err(e) = sink.write(OutputStream::Stdout, chunk).await {
                            break Finish::Stopped(FailureKind::Infrastructure, format!("failed to record output: {}", e));
                        }
                    }
                    Ok(None) => stdout_open = false,
                    Err(e) => {
                        warn!("Reading stdout of step '{}' failed: {}", step.name, e);
                        stdout_open = false;
                    }
                },
                chunk = stderr.next_chunk(), if stderr_open => match chunk {
                    Ok(Some(chunk)) => {
                        if let Err(e) = sink.write(OutputStream::Stderr, chunk).await {
                            break Finish::Stopped(FailureKind::Infrastructure, format!("failed to record output: {}", e));
                        }
                    }
                    Ok(None) => stderr_open = false,
                    Err(e) => {
                        warn!("Reading stderr of step '{}' failed: {}", step.name, e);
                        stderr_open = false;
                    }
                },
                result = child.wait(), if status.is_none() => match result {
                    Ok(exit) => {
                        status = Some(exit);
                        drain.as_mut().reset(Instant::now() + self.grace_period);
                    }
                    Err(e) => break Finish::Stopped(FailureKind::Error, format!("failed to wait for command: {}", e)),
                },
                _ = &mut drain, if status.is_some() => {
                    debug!("Output of step '{}' still open after exit; closing", step.name);
                    stdout_open = false;
                    stderr_open = false;
                }
                reason = cancel.cancelled() => {
                    break Finish::Stopped(reason.failure_kind(), reason.message().to_string());
                }
                _ = &mut deadline, if limit.is_some() => {
                    let seconds = limit.map_or(0, |l| l.as_secs());
                    break Finish::Stopped(FailureKind::TimedOut, format!("step exceeded its time limit of {}s", seconds));
                }
            }
        };

        match finish {
            Finish::Exited(exit) if exit.success() => StepOutcome::Success,
            Finish::Exited(exit) => {
                let message = match exit.code() {
                    Some(code) => format!("command exited with code {}", code),
                    None => format!("command terminated: {}", exit),
                };
                StepOutcome::failed(FailureKind::ExitCode, exit.code(), message)
            }
            Finish::Stopped(kind, message) => {
                if status.is_none() {
                    self.terminate(&mut child).await;
                }
                if kind != FailureKind::Infrastructure {
                    let _ = sink.write(OutputStream::System, format!("{}\n", message)).await;
                }
                StepOutcome::failed(kind, status.and_then(|s| s.code()), message)
            }
        }
    }
}

/// Splits a child's output stream into chunks
///
/// Bytes are read raw and decoded lossily, so output that is not UTF-8
/// never stops the pipe from draining.
struct OutputReader<R> {
    reader: BufReader<R>,
    pending: Vec<u8>,
}

impl<R: AsyncRead + Unpin> OutputReader<R> {
    fn new(inner: R) -> Self {
        Self {
            reader: BufReader::new(inner),
            pending: Vec::new(),
        }
    }

    /// Next line including its newline, or the next [`MAX_CHUNK_BYTES`] of a
    /// longer one. `None` at end of stream.
    ///
    /// Cancel safe: bytes already consumed stay in `pending`.
    async fn next_chunk(&mut self) -> io::Result<Option<String>> {
        loop {
            let available = self.reader.fill_buf().await?;
            if available.is_empty() {
                if self.pending.is_empty() {
                    return Ok(None);
                }
                return Ok(Some(decode(std::mem::take(&mut self.pending))));
            }

            let room = MAX_CHUNK_BYTES - self.pending.len();
            let window = &available[..available.len().min(room)];

            if let Some(end) = window.iter().position(|&b| b == b'\n') {
                self.pending.extend_from_slice(&window[..=end]);
                self.reader.consume(end + 1);
                return Ok(Some(decode(std::mem::take(&mut self.pending))));
            }

            let taken = window.len();
            self.pending.extend_from_slice(window);
            self.reader.consume(taken);

            if self.pending.len() >= MAX_CHUNK_BYTES {
                let tail = split_partial_char(&mut self.pending);
                return Ok(Some(decode(std::mem::replace(&mut self.pending, tail))));
            }
        }
    }
}

/// Detaches a multi-byte character cut off at the end of `bytes`
fn split_partial_char(bytes: &mut Vec<u8>) -> Vec<u8> {
    match std::str::from_utf8(bytes) {
        Err(e) if e.error_len().is_none() => bytes.split_off(e.valid_up_to()),
        _ => Vec::new(),
    }
}

/// Lossy UTF-8 decoding; NUL is replaced too, since text storage rejects it
fn decode(bytes: Vec<u8>) -> String {
    let text = match String::from_utf8(bytes) {
        Ok(text) => text,
        Err(e) => String::from_utf8_lossy(e.as_bytes()).into_owned(),
    };

    if text.contains('\0') {
        text.replace('\0', "\u{FFFD}")
    } else {
        text
    }
}

fn far_future() -> Instant {
    Instant::now() + Duration::from_secs(86400 * 365)
}

#[async_trait]
impl StepExecutor for ShellExecutor {
    async fn execute(
        &self,
        step: &StepDefinition,
        sink: &dyn OutputSink,
        cancel: CancelSignal,
    ) -> StepOutcome {
        if let Some(reason) = cancel.reason() {
            return StepOutcome::failed(reason.failure_kind(), None, reason.message());
        }

        debug!("Running step '{}': {}", step.name, step.command);
        self.run(step, sink, cancel).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::cancel::{CancelReason, cancel_pair};
    use std::sync::Mutex;
    use vortexia_core::state::ExitInfo;

    #[derive(Default)]
    struct RecordingSink {
        chunks: Mutex<Vec<(OutputStream, String)>>,
        fail: bool,
    }

    impl RecordingSink {
        fn failing() -> Self {
            Self {
                chunks: Mutex::new(Vec::new()),
                fail: true,
            }
        }

        fn text(&self, stream: OutputStream) -> String {
            self.chunks
                .lock()
                .unwrap()
                .iter()
                .filter(|(s, _)| *s == stream)
                .map(|(_, d)| d.as_str())
                .collect()
        }

        fn sizes(&self, stream: OutputStream) -> Vec<usize> {
            self.chunks
                .lock()
                .unwrap()
                .iter()
                .filter(|(s, _)| *s == stream)
                .map(|(_, d)| d.len())
                .collect()
        }
    }

    #[async_trait]
    impl OutputSink for RecordingSink {
        async fn write(&self, stream: OutputStream, data: String) -> Result<(), GatewayError> {
            if self.fail {
                return Err(GatewayError::Unavailable("disk full".to_string()));
            }
            self.chunks.lock().unwrap().push((stream, data));
            Ok(())
        }
    }

    fn executor() -> ShellExecutor {
        let mut config = EngineConfig::default();
        config.kill_grace_period = Duration::from_millis(500);
        ShellExecutor::new(&config)
    }

    fn step(command: &str) -> StepDefinition {
        StepDefinition {
            name: "test".to_string(),
            command: command.to_string(),
            ordinal: 0,
            timeout_seconds: None,
        }
    }

    fn failure(outcome: StepOutcome) -> ExitInfo {
        match outcome {
            StepOutcome::Failed(info) => info,
            StepOutcome::Success => panic!("expected a failed step"),
        }
    }

    #[tokio::test]
    async fn test_captures_stdout_and_stderr() {
        let sink = RecordingSink::default();
        let outcome = executor()
            .execute(
                &step("echo one; echo two; echo oops >&2"),
                &sink,
                CancelSignal::never(),
            )
            .await;

        assert_eq!(outcome, StepOutcome::Success);
        assert_eq!(sink.text(OutputStream::Stdout), "one\ntwo\n");
        assert_eq!(sink.text(OutputStream::Stderr), "oops\n");
    }

    #[tokio::test]
    async fn test_non_zero_exit() {
        let sink = RecordingSink::default();
        let outcome = executor()
            .execute(&step("echo partial; exit 3"), &sink, CancelSignal::never())
            .await;

        let info = failure(outcome);
        assert_eq!(info.kind, FailureKind::ExitCode);
        assert_eq!(info.exit_code, Some(3));
        assert_eq!(sink.text(OutputStream::Stdout), "partial\n");
    }

    #[tokio::test]
    async fn test_step_time_limit() {
        let sink = RecordingSink::default();
        let mut definition = step("sleep 30");
        definition.timeout_seconds = Some(1);

        let started = Instant::now();
        let outcome = executor()
            .execute(&definition, &sink, CancelSignal::never())
            .await;

        assert_eq!(failure(outcome).kind, FailureKind::TimedOut);
        assert!(started.elapsed() < Duration::from_secs(10));
        assert!(sink.text(OutputStream::System).contains("time limit"));
    }

    #[tokio::test]
    async fn test_cancel_stops_running_command() {
        let sink = RecordingSink::default();
        let (handle, signal) = cancel_pair();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            handle.cancel(CancelReason::Requested);
        });

        let started = Instant::now();
        let outcome = executor()
            .execute(&step("echo started; sleep 30"), &sink, signal)
            .await;

        let info = failure(outcome);
        assert_eq!(info.kind, FailureKind::Canceled);
        assert!(started.elapsed() < Duration::from_secs(10));
        assert_eq!(sink.text(OutputStream::Stdout), "started\n");
    }

    #[tokio::test]
    async fn test_already_canceled_does_not_spawn() {
        let sink = RecordingSink::default();
        let (handle, signal) = cancel_pair();
        handle.cancel(CancelReason::DeadlineExceeded);

        let outcome = executor()
            .execute(&step("echo should-not-run"), &sink, signal)
            .await;

        assert_eq!(failure(outcome).kind, FailureKind::DeadlineExceeded);
        assert_eq!(sink.text(OutputStream::Stdout), "");
    }

    #[tokio::test]
    async fn test_unwritable_output_is_infrastructure_failure() {
        let sink = RecordingSink::failing();
        let outcome = executor()
            .execute(&step("echo hello; sleep 30"), &sink, CancelSignal::never())
            .await;

        assert_eq!(failure(outcome).kind, FailureKind::Infrastructure);
    }

    #[tokio::test]
    async fn test_missing_shell_is_error() {
        let mut config = EngineConfig::default();
        config.shell = "/nonexistent/shell".to_string();
        let sink = RecordingSink::default();

        let outcome = ShellExecutor::new(&config)
            .execute(&step("true"), &sink, CancelSignal::never())
            .await;

        assert_eq!(failure(outcome).kind, FailureKind::Error);
    }

    #[tokio::test]
    async fn test_invalid_utf8_does_not_stall_output() {
        let sink = RecordingSink::default();
        let outcome = tokio::time::timeout(
            Duration::from_secs(30),
            executor().execute(
                &step("printf '\\377\\n'; seq 1 200000"),
                &sink,
                CancelSignal::never(),
            ),
        )
        .await
        .expect("step should finish");

        assert_eq!(outcome, StepOutcome::Success);
        let stdout = sink.text(OutputStream::Stdout);
        assert!(stdout.starts_with("\u{FFFD}\n1\n2\n"));
        assert!(stdout.ends_with("199999\n200000\n"));
    }

    #[tokio::test]
    async fn test_long_line_is_split_into_bounded_chunks() {
        let sink = RecordingSink::default();
        let outcome = executor()
            .execute(
                &step("head -c 5000000 /dev/zero | tr '\\0' a"),
                &sink,
                CancelSignal::never(),
            )
            .await;

        assert_eq!(outcome, StepOutcome::Success);
        let sizes = sink.sizes(OutputStream::Stdout);
        assert!(sizes.len() > 1);
        assert!(sizes.iter().all(|&size| size <= MAX_CHUNK_BYTES));
        assert_eq!(sizes.iter().sum::<usize>(), 5_000_000);
    }

    #[tokio::test]
    async fn test_reader_keeps_characters_whole() {
        let mut bytes = vec![b'a'; MAX_CHUNK_BYTES - 1];
        bytes.extend_from_slice("é\nlast".as_bytes());
        let mut reader = OutputReader::new(bytes.as_slice());

        let first = reader.next_chunk().await.unwrap().unwrap();
        assert_eq!(first.len(), MAX_CHUNK_BYTES - 1);
        assert!(first.bytes().all(|b| b == b'a'));

        assert_eq!(reader.next_chunk().await.unwrap().as_deref(), Some("é\n"));
        assert_eq!(reader.next_chunk().await.unwrap().as_deref(), Some("last"));
        assert_eq!(reader.next_chunk().await.unwrap(), None);
    }

    #[test]
    fn test_decode_replaces_nul_and_invalid_bytes() {
        assert_eq!(decode(b"a\0b\n".to_vec()), "a\u{FFFD}b\n");
        assert_eq!(decode(vec![b'x', 0xff, b'\n']), "x\u{FFFD}\n");
        assert_eq!(decode(b"plain\n".to_vec()), "plain\n");
    }
}

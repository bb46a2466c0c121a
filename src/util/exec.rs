//! Structured process execution with timeouts and cancellation.
//!
//! Everything the engine does to a checkout goes through [`ProcessRunner`], so
//! the cache manager and clone protocol can be driven by a fake in tests.

use std::ffi::{OsStr, OsString};
use std::fmt::Write as _;
use std::io::{self, Read};
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use thiserror::Error;
use wait_timeout::ChildExt;

/// How often a running child is checked for cancellation.
const POLL_SLICE: Duration = Duration::from_millis(50);

/// Failure to run a process to completion. A non-zero exit is not an error at
/// this layer; it is reported through [`ExecOutput::code`].
#[derive(Debug, Error)]
pub enum ExecError {
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("{program} timed out after {after:?}")]
    TimedOut { program: String, after: Duration },

    #[error("{program} was cancelled")]
    Cancelled { program: String },

    #[error("failed to wait for {program}: {source}")]
    Wait {
        program: String,
        #[source]
        source: io::Error,
    },
}

/// Runs one external command and captures its output.
pub trait ProcessRunner: Send + Sync {
    fn run(&self, request: ExecRequest) -> Result<ExecOutput, ExecError>;
}

/// The caller's context: a shared cancellation flag plus an optional deadline.
///
/// Cloning shares the flag, so `cancel()` on any clone stops in-flight
/// processes started with any other clone.
#[derive(Debug, Clone, Default)]
pub struct ExecContext {
    cancelled: Arc<AtomicBool>,
    deadline: Option<Instant>,
}

impl ExecContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// Execution window for a single process: `ceiling`, cut short by the deadline.
    pub fn bounded(&self, ceiling: Duration) -> Duration {
        match self.remaining() {
            Some(left) => left.min(ceiling),
            None => ceiling,
        }
    }
}

/// Spawns real processes; bounded with `wait-timeout`.
#[derive(Debug, Clone)]
pub struct ExecService {
    default_timeout: Duration,
}

impl ExecService {
    pub fn new(default_timeout: Duration) -> Self {
        Self { default_timeout }
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }
}

impl Default for ExecService {
    fn default() -> Self {
        Self::new(Duration::from_secs(60))
    }
}

impl ProcessRunner for ExecService {
    fn run(&self, request: ExecRequest) -> Result<ExecOutput, ExecError> {
        let program = request.program.to_string_lossy().into_owned();

        let mut timeout = request.timeout.unwrap_or(self.default_timeout);
        if let Some(ctx) = &request.context {
            if ctx.is_cancelled() {
                return Err(ExecError::Cancelled { program });
            }
            timeout = ctx.bounded(timeout);
        }
        if timeout.is_zero() {
            return Err(ExecError::TimedOut {
                program,
                after: timeout,
            });
        }

        let mut cmd = Command::new(&request.program);
        cmd.args(&request.args);
        if !request.inherit_env {
            cmd.env_clear();
        }
        for (key, value) in &request.env {
            cmd.env(key, value);
        }
        cmd.stdin(Stdio::null());
        if request.capture_output {
            cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
        } else {
            cmd.stdout(Stdio::null()).stderr(Stdio::null());
        }

        let mut child = cmd.spawn().map_err(|source| ExecError::Spawn {
            program: program.clone(),
            source,
        })?;

        // Drain both pipes concurrently so a chatty child cannot fill a pipe
        // buffer and stall before exiting.
        let stdout_reader = spawn_reader(child.stdout.take());
        let stderr_reader = spawn_reader(child.stderr.take());

        let started = Instant::now();
        let status = loop {
            let elapsed = started.elapsed();
            if elapsed >= timeout {
                kill_and_reap(&mut child);
                return Err(ExecError::TimedOut {
                    program,
                    after: timeout,
                });
            }
            let slice = POLL_SLICE.min(timeout - elapsed);
            match child.wait_timeout(slice) {
                Ok(Some(status)) => break status,
                Ok(None) => {
                    if request.context.as_ref().is_some_and(ExecContext::is_cancelled) {
                        kill_and_reap(&mut child);
                        return Err(ExecError::Cancelled { program });
                    }
                }
                Err(source) => {
                    kill_and_reap(&mut child);
                    return Err(ExecError::Wait { program, source });
                }
            }
        };

        Ok(ExecOutput {
            code: status.code(),
            duration: started.elapsed(),
            stdout: join_reader(stdout_reader),
            stderr: join_reader(stderr_reader),
        })
    }
}

fn kill_and_reap(child: &mut Child) {
    let _ = child.kill();
    let _ = child.wait();
}

fn spawn_reader<R>(stream: Option<R>) -> Option<JoinHandle<String>>
where
    R: Read + Send + 'static,
{
    stream.map(|mut reader| {
        std::thread::spawn(move || {
            let mut buf = Vec::new();
            let _ = reader.read_to_end(&mut buf);
            String::from_utf8_lossy(&buf).into_owned()
        })
    })
}

fn join_reader(handle: Option<JoinHandle<String>>) -> String {
    handle.and_then(|h| h.join().ok()).unwrap_or_default()
}

#[derive(Debug, Clone, Default)]
pub struct ExecRequest {
    program: OsString,
    args: Vec<OsString>,
    env: Vec<(OsString, OsString)>,
    inherit_env: bool,
    timeout: Option<Duration>,
    capture_output: bool,
    context: Option<ExecContext>,
}

impl ExecRequest {
    pub fn new(program: impl Into<OsString>) -> Self {
        Self {
            program: program.into(),
            inherit_env: false,
            ..Self::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<OsString>, value: impl Into<OsString>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn inherit_env(mut self, inherit: bool) -> Self {
        self.inherit_env = inherit;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn capture_output(mut self, capture: bool) -> Self {
        self.capture_output = capture;
        self
    }

    /// Tie the process to the caller's cancellation flag and deadline.
    pub fn context(mut self, ctx: &ExecContext) -> Self {
        self.context = Some(ctx.clone());
        self
    }

    pub fn get_program(&self) -> &OsStr {
        &self.program
    }

    pub fn get_args(&self) -> impl Iterator<Item = &OsStr> {
        self.args.iter().map(OsString::as_os_str)
    }

    pub fn get_envs(&self) -> &[(OsString, OsString)] {
        &self.env
    }

    /// Last value set for `key` in the overlay, if any.
    pub fn get_env(&self, key: &str) -> Option<&OsStr> {
        self.env
            .iter()
            .rev()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_os_str())
    }

    pub fn get_timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Program and arguments joined for logs and error text. The environment is
    /// deliberately left out; it may carry credential paths.
    pub fn display_command(&self) -> String {
        let mut out = self.program.to_string_lossy().into_owned();
        for a in &self.args {
            let _ = write!(out, " {}", a.to_string_lossy());
        }
        out
    }
}

#[derive(Debug, Clone, Default)]
pub struct ExecOutput {
    /// Exit code; `None` when the process was terminated by a signal.
    pub code: Option<i32>,
    pub duration: Duration,
    pub stdout: String,
    pub stderr: String,
}

impl ExecOutput {
    pub fn new(code: Option<i32>, stdout: impl Into<String>, stderr: impl Into<String>) -> Self {
        Self {
            code,
            duration: Duration::ZERO,
            stdout: stdout.into(),
            stderr: stderr.into(),
        }
    }

    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

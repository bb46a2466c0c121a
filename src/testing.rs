//! Scriptable [`ProcessRunner`] for unit tests.

use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use crate::util::{ExecError, ExecOutput, ExecRequest, ProcessRunner};

/// One recorded invocation.
#[derive(Debug, Clone)]
pub(crate) struct Call {
    /// Position among all calls made to this runner.
    pub seq: usize,
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub timeout: Option<Duration>,
    pub askpass: Option<PathBuf>,
    /// Whether the askpass script existed while the process "ran".
    pub askpass_existed: bool,
}

impl Call {
    /// Arguments after a leading `-C <dir>`.
    pub fn git_args(&self) -> &[String] {
        if self.args.first().map(String::as_str) == Some("-C") && self.args.len() >= 2 {
            &self.args[2..]
        } else {
            &self.args
        }
    }

    /// Directory passed with `-C`, if any.
    pub fn repo(&self) -> Option<PathBuf> {
        match self.args.first().map(String::as_str) {
            Some("-C") => self.args.get(1).map(PathBuf::from),
            _ => None,
        }
    }

    pub fn env(&self, key: &str) -> Option<&str> {
        self.env
            .iter()
            .rev()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

pub(crate) enum Reply {
    Output(ExecOutput),
    TimedOut,
}

impl Reply {
    pub fn ok(stdout: &str) -> Self {
        Reply::Output(ExecOutput::new(Some(0), stdout, ""))
    }

    pub fn fail(code: i32, stderr: &str) -> Self {
        Reply::Output(ExecOutput::new(Some(code), "", stderr))
    }
}

type Responder = Box<dyn Fn(&Call) -> Reply + Send + Sync>;

pub(crate) struct FakeRunner {
    responder: Responder,
    calls: Mutex<Vec<Call>>,
}

impl Default for FakeRunner {
    fn default() -> Self {
        Self::new(|_| Reply::ok(""))
    }
}

impl FakeRunner {
    pub fn new<F>(responder: F) -> Self
    where
        F: Fn(&Call) -> Reply + Send + Sync + 'static,
    {
        Self {
            responder: Box::new(responder),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().expect("calls lock").clone()
    }

    /// Number of calls whose git subcommand is `sub`.
    pub fn count(&self, sub: &str) -> usize {
        self.calls()
            .iter()
            .filter(|c| c.git_args().first().map(String::as_str) == Some(sub))
            .count()
    }
}

impl ProcessRunner for FakeRunner {
    fn run(&self, request: ExecRequest) -> Result<ExecOutput, ExecError> {
        let askpass = request.get_env("GIT_ASKPASS").map(PathBuf::from);
        let askpass_existed = askpass.as_ref().is_some_and(|p| p.exists());
        let program = request.get_program().to_string_lossy().into_owned();
        let call = {
            let calls = self.calls.lock().expect("calls lock");
            Call {
                seq: calls.len(),
                program: program.clone(),
                args: request
                    .get_args()
                    .map(|a| a.to_string_lossy().into_owned())
                    .collect(),
                env: request
                    .get_envs()
                    .iter()
                    .map(|(k, v)| (k.to_string_lossy().into_owned(), v.to_string_lossy().into_owned()))
                    .collect(),
                timeout: request.get_timeout(),
                askpass,
                askpass_existed,
            }
        };
        let reply = (self.responder)(&call);
        self.calls.lock().expect("calls lock").push(call);
        match reply {
            Reply::Output(out) => Ok(out),
            Reply::TimedOut => Err(ExecError::TimedOut {
                program,
                after: request.get_timeout().unwrap_or_default(),
            }),
        }
    }
}

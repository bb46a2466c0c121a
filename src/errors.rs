//! Error taxonomy for workspace synchronization.
//!
//! Low-level primitives return `Process`/`Timeout`/`Cancelled` carrying the raw
//! captured stderr. The clone protocol and cache manager wrap failures in
//! `Step` naming the operation, and fetch failures are upgraded into
//! `Authentication`, `RefNotFound` or `Certificate` when stderr matches a known
//! pattern. Use [`WorkspaceError::kind`] to branch; it sees through `Step`.
//!
//! Exit code mapping: 127 when the git binary cannot be spawned (not found),
//! 1 for everything else.
use std::io;
use std::time::Duration;

use thiserror::Error;

use crate::util::ExecError;

pub type Result<T, E = WorkspaceError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum WorkspaceError {
    /// Missing or invalid input; raised before any process is spawned.
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("unknown git provider: {0}")]
    UnknownProvider(String),

    /// Non-zero exit from a git invocation.
    #[error("{command} failed (exit {}): {}", display_code(.code), trim(.stderr))]
    Process {
        command: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("{command} timed out after {after:?}")]
    Timeout { command: String, after: Duration },

    #[error("{command} was cancelled")]
    Cancelled { command: String },

    #[error(
        "authentication failed for {provider} {label} #{number}: check that {env_var} holds a token with read access to the repository"
    )]
    Authentication {
        provider: String,
        label: String,
        number: u64,
        env_var: String,
        stderr: String,
    },

    #[error(
        "{provider} {label} #{number} not found: remote ref {reference} does not exist{}",
        hint_suffix(.hint)
    )]
    RefNotFound {
        provider: String,
        label: String,
        number: u64,
        reference: String,
        hint: Option<String>,
    },

    #[error(
        "TLS certificate verification failed for {provider} {label} #{number}: if the server uses a private or self-signed certificate, enable the insecure TLS bypass (--insecure or PR_WORKSPACE_INSECURE_SKIP_TLS=1)"
    )]
    Certificate {
        provider: String,
        label: String,
        number: u64,
        stderr: String,
    },

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },

    /// A named operation failed; `source` holds the cause.
    #[error("failed to {op}: {source}")]
    Step {
        op: String,
        #[source]
        source: Box<WorkspaceError>,
    },
}

/// Coarse classification of a [`WorkspaceError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Configuration,
    UnknownProvider,
    Process,
    Timeout,
    Cancelled,
    Authentication,
    RefNotFound,
    Certificate,
    Io,
}

fn display_code(code: &Option<i32>) -> String {
    code.map(|c| c.to_string())
        .unwrap_or_else(|| "signal".to_string())
}

fn trim(s: &str) -> &str {
    s.trim()
}

fn hint_suffix(hint: &Option<String>) -> String {
    hint.as_deref()
        .map(|h| format!(" (hint: {h})"))
        .unwrap_or_default()
}

impl WorkspaceError {
    pub fn io(context: impl Into<String>, source: io::Error) -> Self {
        WorkspaceError::Io {
            context: context.into(),
            source,
        }
    }

    /// Wrap `self` with the name of the operation that failed.
    pub fn during(self, op: impl Into<String>) -> Self {
        WorkspaceError::Step {
            op: op.into(),
            source: Box::new(self),
        }
    }

    /// Translate a runner failure for `command` into the taxonomy.
    pub fn from_exec(command: String, err: ExecError) -> Self {
        match err {
            ExecError::TimedOut { after, .. } => WorkspaceError::Timeout { command, after },
            ExecError::Cancelled { .. } => WorkspaceError::Cancelled { command },
            ExecError::Spawn { source, .. } => {
                WorkspaceError::io(format!("failed to spawn {command}"), source)
            }
            ExecError::Wait { source, .. } => {
                WorkspaceError::io(format!("failed to wait for {command}"), source)
            }
        }
    }

    /// The innermost error, skipping `Step` wrappers.
    pub fn root(&self) -> &WorkspaceError {
        let mut cur = self;
        while let WorkspaceError::Step { source, .. } = cur {
            cur = source.as_ref();
        }
        cur
    }

    pub fn kind(&self) -> ErrorKind {
        match self.root() {
            WorkspaceError::Configuration(_) => ErrorKind::Configuration,
            WorkspaceError::UnknownProvider(_) => ErrorKind::UnknownProvider,
            WorkspaceError::Process { .. } => ErrorKind::Process,
            WorkspaceError::Timeout { .. } => ErrorKind::Timeout,
            WorkspaceError::Cancelled { .. } => ErrorKind::Cancelled,
            WorkspaceError::Authentication { .. } => ErrorKind::Authentication,
            WorkspaceError::RefNotFound { .. } => ErrorKind::RefNotFound,
            WorkspaceError::Certificate { .. } => ErrorKind::Certificate,
            WorkspaceError::Io { .. } => ErrorKind::Io,
            WorkspaceError::Step { .. } => unreachable!("root() never returns Step"),
        }
    }

    /// Captured stderr of the underlying git process, when there is one.
    pub fn stderr(&self) -> Option<&str> {
        match self.root() {
            WorkspaceError::Process { stderr, .. }
            | WorkspaceError::Authentication { stderr, .. }
            | WorkspaceError::Certificate { stderr, .. } => Some(stderr),
            _ => None,
        }
    }
}

/// Map an io::Error to a process exit code, preserving current behavior:
/// - 127 for NotFound (command not found)
/// - 1 for all other errors
pub fn exit_code_for_io_error(e: &io::Error) -> u8 {
    if e.kind() == io::ErrorKind::NotFound {
        127
    } else {
        1
    }
}

/// Convert WorkspaceError to exit code (parity with io::Error mapping).
pub fn exit_code_for_error(e: &WorkspaceError) -> u8 {
    match e.root() {
        WorkspaceError::Io { source, .. } => exit_code_for_io_error(source),
        _ => 1,
    }
}

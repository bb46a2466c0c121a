//! Git primitives on an existing local checkout.
//!
//! Every operation spawns exactly one `git` process through the configured
//! [`ProcessRunner`] and blocks until it exits or its window closes. Fetch and
//! reset/clean use the long window (5 minutes by default); everything else
//! uses the runner default. Both are cut short by the caller's deadline.

use std::ffi::{OsStr, OsString};
use std::fs;
use std::io;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::credential::{AuthOptions, GitEnv};
use crate::errors::{Result, WorkspaceError};
use crate::util::{ExecContext, ExecOutput, ExecRequest, ProcessRunner};

pub const DEFAULT_GIT_PROGRAM: &str = "git";

/// Ceiling for fetch and reset/clean.
pub const LONG_OPERATION_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Local branch a PR is fetched into.
pub fn pr_branch_name(number: u64) -> String {
    format!("pr-{number}")
}

/// Handle on the git executable: which binary to run, through which runner.
#[derive(Clone)]
pub struct GitCli {
    runner: Arc<dyn ProcessRunner>,
    program: OsString,
    long_timeout: Duration,
}

impl std::fmt::Debug for GitCli {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GitCli")
            .field("program", &self.program)
            .field("long_timeout", &self.long_timeout)
            .finish_non_exhaustive()
    }
}

impl GitCli {
    pub fn new(runner: Arc<dyn ProcessRunner>) -> Self {
        Self {
            runner,
            program: OsString::from(DEFAULT_GIT_PROGRAM),
            long_timeout: LONG_OPERATION_TIMEOUT,
        }
    }

    pub fn with_program(mut self, program: impl Into<OsString>) -> Self {
        self.program = program.into();
        self
    }

    pub fn with_long_timeout(mut self, timeout: Duration) -> Self {
        self.long_timeout = timeout;
        self
    }

    pub fn program(&self) -> &OsStr {
        &self.program
    }

    pub fn long_timeout(&self) -> Duration {
        self.long_timeout
    }

    /// Base request for `git [-C <repo>] <args...>` with prompts disabled.
    pub fn request(&self, repo: Option<&Path>, args: &[&str]) -> ExecRequest {
        let mut req = ExecRequest::new(&self.program);
        if let Some(r) = repo {
            req = req.arg("-C").arg(r);
        }
        req.args(args)
            .inherit_env(true)
            .capture_output(true)
            .env("GIT_TERMINAL_PROMPT", "0")
    }

    /// Run `request`; a non-zero exit becomes [`WorkspaceError::Process`].
    pub fn execute(&self, request: ExecRequest) -> Result<ExecOutput> {
        let command = request.display_command();
        debug!(%command, "running git");
        let output = self
            .runner
            .run(request)
            .map_err(|e| WorkspaceError::from_exec(command.clone(), e))?;
        if output.success() {
            Ok(output)
        } else {
            debug!(%command, code = ?output.code, stderr = %output.stderr.trim(), "git failed");
            Err(WorkspaceError::Process {
                command,
                code: output.code,
                stderr: output.stderr,
            })
        }
    }
}

/// True when stderr says the update of a local ref was refused as non-fast-forward.
pub fn is_non_fast_forward(err: &WorkspaceError) -> bool {
    match err {
        WorkspaceError::Process { stderr, .. } => {
            let s = stderr.to_ascii_lowercase();
            s.contains("non-fast-forward") || s.contains("[rejected]")
        }
        _ => false,
    }
}

fn is_branch_not_found(err: &WorkspaceError) -> bool {
    match err {
        WorkspaceError::Process { stderr, .. } => stderr.to_ascii_lowercase().contains("not found"),
        _ => false,
    }
}

/// An existing local checkout.
pub struct Workspace<'a> {
    git: &'a GitCli,
    ctx: &'a ExecContext,
    path: &'a Path,
}

impl<'a> Workspace<'a> {
    pub fn new(git: &'a GitCli, ctx: &'a ExecContext, path: &'a Path) -> Self {
        Self { git, ctx, path }
    }

    pub fn path(&self) -> &Path {
        self.path
    }

    fn request(&self, args: &[&str]) -> ExecRequest {
        self.git.request(Some(self.path), args).context(self.ctx)
    }

    fn long_request(&self, args: &[&str]) -> ExecRequest {
        self.request(args).timeout(self.git.long_timeout())
    }

    /// Commit hash HEAD points at.
    pub fn local_head_sha(&self) -> Result<String> {
        let out = self.git.execute(self.request(&["rev-parse", "HEAD"]))?;
        let sha = out.stdout.trim().to_string();
        if sha.is_empty() {
            return Err(WorkspaceError::Process {
                command: "git rev-parse HEAD".to_string(),
                code: out.code,
                stderr: "empty output".to_string(),
            });
        }
        Ok(sha)
    }

    /// Detach HEAD so the PR branch can be fetched into while "checked out".
    pub fn checkout_detached(&self) -> Result<()> {
        self.git.execute(self.request(&["checkout", "--detach"]))?;
        Ok(())
    }

    /// Fetch `reference` into `local_branch`. A non-fast-forward rejection
    /// (force-pushed PR) deletes the branch and retries exactly once.
    pub fn fetch_ref(&self, reference: &str, local_branch: &str, auth: &AuthOptions) -> Result<()> {
        match self.fetch_once(reference, local_branch, auth) {
            Ok(()) => Ok(()),
            Err(e) if is_non_fast_forward(&e) => {
                warn!(
                    branch = local_branch,
                    %reference,
                    "fetch rejected as non-fast-forward; recreating branch"
                );
                self.delete_local_branch(local_branch)?;
                self.fetch_once(reference, local_branch, auth)
            }
            Err(e) => Err(e),
        }
    }

    fn fetch_once(&self, reference: &str, local_branch: &str, auth: &AuthOptions) -> Result<()> {
        // One script per invocation, retries included.
        let env = GitEnv::prepare(auth)?;
        let refspec = format!("{reference}:{local_branch}");
        let req = env.apply(self.long_request(&["fetch", "--no-tags", "origin", &refspec]));
        self.git.execute(req)?;
        drop(env);
        Ok(())
    }

    pub fn checkout_branch(&self, name: &str) -> Result<()> {
        self.git.execute(self.request(&["checkout", name]))?;
        Ok(())
    }

    /// Force-delete `name`; a branch that does not exist is not an error.
    pub fn delete_local_branch(&self, name: &str) -> Result<()> {
        match self.git.execute(self.request(&["branch", "-D", name])) {
            Ok(_) => Ok(()),
            Err(e) if is_branch_not_found(&e) => {
                debug!(branch = name, "branch already absent");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Remove a stale `.git/index.lock`. Assumes no other git process is
    /// working in this checkout. Returns whether a lock was removed.
    pub fn cleanup_git_lock(&self) -> Result<bool> {
        let lock = self.path.join(".git").join("index.lock");
        match fs::remove_file(&lock) {
            Ok(()) => {
                info!(lock = %lock.display(), "removed stale git lock");
                Ok(true)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(WorkspaceError::io(
                format!("failed to remove {}", lock.display()),
                e,
            )),
        }
    }

    /// Discard tracked changes and untracked files/directories.
    pub fn reset_and_clean(&self) -> Result<()> {
        self.git.execute(self.long_request(&["reset", "--hard"]))?;
        self.git.execute(self.long_request(&["clean", "-fd"]))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credential::Secret;
    use crate::errors::ErrorKind;
    use crate::testing::{FakeRunner, Reply};
    use std::path::PathBuf;

    fn cli(runner: &Arc<FakeRunner>) -> GitCli {
        GitCli::new(runner.clone())
    }

    #[test]
    fn pr_branch_name_format() {
        assert_eq!(pr_branch_name(7), "pr-7");
    }

    #[test]
    fn request_runs_in_repo_with_prompts_disabled() {
        let runner = Arc::new(FakeRunner::default());
        let req = cli(&runner).request(Some(Path::new("/w/repo")), &["status"]);
        assert_eq!(req.display_command(), "git -C /w/repo status");
        assert_eq!(req.get_env("GIT_TERMINAL_PROMPT"), Some(OsStr::new("0")));
    }

    #[test]
    fn local_head_sha_trims_output() {
        let runner = Arc::new(FakeRunner::new(|call| {
            assert_eq!(call.git_args(), ["rev-parse", "HEAD"]);
            Reply::ok("deadbeef\n")
        }));
        let git = cli(&runner);
        let ctx = ExecContext::new();
        let ws = Workspace::new(&git, &ctx, Path::new("/w/repo"));
        assert_eq!(ws.local_head_sha().unwrap(), "deadbeef");
    }

    #[test]
    fn local_head_sha_errors_outside_repository() {
        let runner = Arc::new(FakeRunner::new(|_| {
            Reply::fail(128, "fatal: not a git repository")
        }));
        let git = cli(&runner);
        let ctx = ExecContext::new();
        let ws = Workspace::new(&git, &ctx, Path::new("/w/repo"));
        let err = ws.local_head_sha().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Process);
    }

    #[test]
    fn fetch_uses_refspec_no_tags_and_long_timeout() {
        let runner = Arc::new(FakeRunner::new(|_| Reply::ok("")));
        let git = cli(&runner);
        let ctx = ExecContext::new();
        let ws = Workspace::new(&git, &ctx, Path::new("/w/repo"));
        ws.fetch_ref("refs/pull/7/head", "pr-7", &AuthOptions::default())
            .unwrap();
        let calls = runner.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(
            calls[0].git_args(),
            ["fetch", "--no-tags", "origin", "refs/pull/7/head:pr-7"]
        );
        assert_eq!(calls[0].timeout, Some(LONG_OPERATION_TIMEOUT));
    }

    #[test]
    fn fetch_non_fast_forward_deletes_branch_and_retries_once() {
        let runner = Arc::new(FakeRunner::new(|call| match call.git_args()[0].as_str() {
            "fetch" if call.seq == 0 => Reply::fail(
                1,
                " ! [rejected]        refs/pull/7/head -> pr-7  (non-fast-forward)",
            ),
            _ => Reply::ok(""),
        }));
        let git = cli(&runner);
        let ctx = ExecContext::new();
        let ws = Workspace::new(&git, &ctx, Path::new("/w/repo"));
        ws.fetch_ref("refs/pull/7/head", "pr-7", &AuthOptions::default())
            .unwrap();
        let subs: Vec<String> = runner.calls().iter().map(|c| c.git_args().join(" ")).collect();
        assert_eq!(
            subs,
            [
                "fetch --no-tags origin refs/pull/7/head:pr-7",
                "branch -D pr-7",
                "fetch --no-tags origin refs/pull/7/head:pr-7",
            ]
        );
    }

    #[test]
    fn fetch_second_non_fast_forward_is_surfaced() {
        let runner = Arc::new(FakeRunner::new(|call| match call.git_args()[0].as_str() {
            "fetch" => Reply::fail(1, "! [rejected] (non-fast-forward)"),
            _ => Reply::ok(""),
        }));
        let git = cli(&runner);
        let ctx = ExecContext::new();
        let ws = Workspace::new(&git, &ctx, Path::new("/w/repo"));
        let err = ws
            .fetch_ref("refs/pull/7/head", "pr-7", &AuthOptions::default())
            .unwrap_err();
        assert!(is_non_fast_forward(&err));
        assert_eq!(runner.count("fetch"), 2);
        assert_eq!(runner.count("branch"), 1);
    }

    #[test]
    fn fetch_other_failure_is_not_retried() {
        let runner = Arc::new(FakeRunner::new(|_| {
            Reply::fail(128, "fatal: couldn't find remote ref refs/pull/7/head")
        }));
        let git = cli(&runner);
        let ctx = ExecContext::new();
        let ws = Workspace::new(&git, &ctx, Path::new("/w/repo"));
        assert!(ws
            .fetch_ref("refs/pull/7/head", "pr-7", &AuthOptions::default())
            .is_err());
        assert_eq!(runner.calls().len(), 1);
    }

    #[test]
    fn fetch_with_token_uses_fresh_script_per_attempt_and_removes_them() {
        let runner = Arc::new(FakeRunner::new(|call| match call.git_args()[0].as_str() {
            "fetch" if call.seq == 0 => Reply::fail(1, "(non-fast-forward)"),
            _ => Reply::ok(""),
        }));
        let git = cli(&runner);
        let ctx = ExecContext::new();
        let ws = Workspace::new(&git, &ctx, Path::new("/w/repo"));
        let auth = AuthOptions::new(Some(Secret::new("tok-fetch-123")), "x-access-token", false);
        ws.fetch_ref("refs/pull/7/head", "pr-7", &auth).unwrap();

        let calls = runner.calls();
        let fetches: Vec<_> = calls.iter().filter(|c| c.git_args()[0] == "fetch").collect();
        assert_eq!(fetches.len(), 2);
        let scripts: Vec<PathBuf> = fetches
            .iter()
            .map(|c| c.askpass.clone().expect("askpass set"))
            .collect();
        assert!(fetches.iter().all(|c| c.askpass_existed));
        assert_ne!(scripts[0], scripts[1], "each attempt gets its own script");
        assert!(scripts.iter().all(|p| !p.exists()));
        assert!(calls
            .iter()
            .all(|c| c.args.iter().all(|a| !a.contains("tok-fetch-123"))));
        // branch -D does not need credentials
        let delete = calls.iter().find(|c| c.git_args()[0] == "branch").unwrap();
        assert!(delete.askpass.is_none());
    }

    #[test]
    fn delete_missing_branch_is_ok() {
        let runner = Arc::new(FakeRunner::new(|_| {
            Reply::fail(1, "error: branch 'pr-7' not found.")
        }));
        let git = cli(&runner);
        let ctx = ExecContext::new();
        let ws = Workspace::new(&git, &ctx, Path::new("/w/repo"));
        ws.delete_local_branch("pr-7").unwrap();
    }

    #[test]
    fn delete_branch_other_failure_is_error() {
        let runner = Arc::new(FakeRunner::new(|_| {
            Reply::fail(1, "error: Cannot delete branch 'pr-7' checked out at '/w/repo'")
        }));
        let git = cli(&runner);
        let ctx = ExecContext::new();
        let ws = Workspace::new(&git, &ctx, Path::new("/w/repo"));
        assert!(ws.delete_local_branch("pr-7").is_err());
    }

    #[test]
    fn cleanup_git_lock_removes_stale_lock() {
        let td = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(td.path().join(".git")).unwrap();
        std::fs::write(td.path().join(".git/index.lock"), "").unwrap();
        let runner = Arc::new(FakeRunner::default());
        let git = cli(&runner);
        let ctx = ExecContext::new();
        let ws = Workspace::new(&git, &ctx, td.path());
        assert!(ws.cleanup_git_lock().unwrap());
        assert!(!td.path().join(".git/index.lock").exists());
        assert!(!ws.cleanup_git_lock().unwrap(), "second call is a no-op");
        assert!(runner.calls().is_empty(), "lock cleanup spawns nothing");
    }

    #[test]
    fn reset_and_clean_runs_both_commands() {
        let runner = Arc::new(FakeRunner::new(|_| Reply::ok("")));
        let git = cli(&runner).with_long_timeout(Duration::from_secs(42));
        let ctx = ExecContext::new();
        let ws = Workspace::new(&git, &ctx, Path::new("/w/repo"));
        ws.reset_and_clean().unwrap();
        let calls = runner.calls();
        let subs: Vec<String> = calls.iter().map(|c| c.git_args().join(" ")).collect();
        assert_eq!(subs, ["reset --hard", "clean -fd"]);
        assert!(calls.iter().all(|c| c.timeout == Some(Duration::from_secs(42))));
    }

    #[test]
    fn timeout_from_runner_is_distinguishable() {
        let runner = Arc::new(FakeRunner::new(|_| Reply::TimedOut));
        let git = cli(&runner);
        let ctx = ExecContext::new();
        let ws = Workspace::new(&git, &ctx, Path::new("/w/repo"));
        let err = ws.reset_and_clean().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);
    }
}

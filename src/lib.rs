//! pr-workspace: turn (provider, owner, repo, PR number, head commit) into a
//! ready local checkout, reusing and repairing prior checkouts.
//!
//! - [`cache::RepositoryCache::ensure_repository`] is the entry point.
//! - [`provider`] holds the per-host differences behind [`GitProvider`].
//! - [`clone`] and [`git`] drive the `git` CLI through a [`ProcessRunner`].
//! - [`credential`] hands tokens to git through short-lived scripts so they
//!   never reach argv or `.git/config`.

pub mod cache;
pub mod clone;
pub mod config;
pub mod credential;
pub mod errors;
pub mod git;
pub mod provider;
pub mod telemetry;
pub mod util;

#[cfg(test)]
mod testing;

pub use cache::{
    CacheOptions, RepositoryCache, RepositoryRequest, WorkspaceKey, WorkspaceLock,
    WorkspaceLockMode,
};
pub use clone::{clone_pr_with_refs, ClonePrParams};
pub use config::EngineConfig;
pub use credential::{
    create_credential_helper, AuthOptions, CredentialScript, GitEnv, ScriptFlavor, Secret,
};
pub use errors::{exit_code_for_error, exit_code_for_io_error, ErrorKind, Result, WorkspaceError};
pub use git::{pr_branch_name, GitCli, Workspace};
pub use provider::{CloneOptions, GitHub, GitLab, GitProvider, Gitea, ProviderRegistry};
pub use util::{ExecContext, ExecError, ExecOutput, ExecRequest, ExecService, ProcessRunner};

//! Repository cache: maps a PR request to a ready local checkout.
//!
//! A checkout lives at `{workspace_root}/{provider}-{owner}-{repo}` and is
//! reused across calls. It is only ever torn down whole: a directory without
//! `.git` is removed and cloned again. An existing checkout whose HEAD differs
//! from the requested commit is brought up to date by [`UPDATE_PLAN`].
//!
//! The engine assumes one writer per workspace key. [`WorkspaceLockMode::Advisory`]
//! enforces that with an exclusive `fs2` lock for the duration of the call.

use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use fs2::FileExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::clone::{classify_fetch_failure, FailureHints};
use crate::credential::{AuthOptions, Secret};
use crate::errors::{Result, WorkspaceError};
use crate::git::{pr_branch_name, GitCli, Workspace};
use crate::provider::{CloneOptions, GitProvider, ProviderRegistry};
use crate::util::ExecContext;

/// Directory name of a checkout: `{provider}-{owner}-{repo}` with path
/// separators flattened to `-`.
///
/// Flattening is lossy: `a/b` + `c` and `a` + `b/c` share a key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WorkspaceKey(String);

impl WorkspaceKey {
    pub fn new(provider: &str, owner: &str, repo: &str) -> Self {
        let raw = format!("{provider}-{owner}-{repo}");
        Self(raw.replace(['/', '\\'], "-"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WorkspaceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Everything needed to materialize one PR at one commit.
#[derive(Debug, Clone)]
pub struct RepositoryRequest {
    /// Registry name of the provider.
    pub provider: String,
    /// May contain `/` for nested namespaces.
    pub owner: String,
    pub repo: String,
    pub pr_number: u64,
    pub head_sha: String,
    pub workspace_root: PathBuf,
    pub token: Option<Secret>,
    pub insecure_skip_tls: bool,
}

impl RepositoryRequest {
    pub fn key(&self) -> WorkspaceKey {
        WorkspaceKey::new(&self.provider, &self.owner, &self.repo)
    }

    pub fn workspace_path(&self) -> PathBuf {
        self.workspace_root.join(self.key().as_str())
    }

    fn validate(&self) -> Result<()> {
        let missing = [
            ("provider", self.provider.trim().is_empty()),
            ("owner", self.owner.trim().is_empty()),
            ("repo", self.repo.trim().is_empty()),
            ("head commit", self.head_sha.trim().is_empty()),
            ("workspace root", self.workspace_root.as_os_str().is_empty()),
        ];
        if let Some((field, _)) = missing.iter().find(|(_, empty)| *empty) {
            return Err(WorkspaceError::Configuration(format!(
                "repository request is missing the {field}"
            )));
        }
        if self.pr_number == 0 {
            return Err(WorkspaceError::Configuration(
                "PR number must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkspaceLockMode {
    /// Callers guarantee a single writer per key.
    #[default]
    None,
    /// Hold an exclusive advisory lock per key while ensuring.
    Advisory,
}

impl FromStr for WorkspaceLockMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "none" | "off" | "0" => Ok(WorkspaceLockMode::None),
            "advisory" | "on" | "1" => Ok(WorkspaceLockMode::Advisory),
            other => Err(format!("invalid lock mode '{other}' (expected none or advisory)")),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CacheOptions {
    pub lock: WorkspaceLockMode,
}

/// Exclusive lock on `{workspace_root}/.{key}.lock`; unlocked on drop.
///
/// The file itself stays behind. Unlinking it would let a caller that opened
/// the old inode and a caller that created a new one both hold the lock.
#[derive(Debug)]
pub struct WorkspaceLock {
    file: File,
    path: PathBuf,
}

impl WorkspaceLock {
    /// Non-blocking: a lock held elsewhere is an error, not a wait.
    pub fn acquire(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(true)
            .open(path)
            .map_err(|e| WorkspaceError::io(format!("failed to open {}", path.display()), e))?;
        match file.try_lock_exclusive() {
            Ok(()) => Ok(Self {
                file,
                path: path.to_path_buf(),
            }),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Err(WorkspaceError::io(
                format!(
                    "workspace lock {} is held by another process; try again later",
                    path.display()
                ),
                e,
            )),
            Err(e) => Err(WorkspaceError::io(
                format!("failed to lock {}", path.display()),
                e,
            )),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for WorkspaceLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}

/// State shared by the steps of one update.
struct UpdateContext<'a> {
    workspace: Workspace<'a>,
    provider: &'a dyn GitProvider,
    number: u64,
    reference: String,
    branch: String,
    auth: AuthOptions,
}

type StepAction = fn(&UpdateContext<'_>) -> Result<()>;

/// One step of bringing a stale checkout to the requested commit. A failing
/// critical step aborts the update; any other failure is logged and skipped.
pub struct UpdateStep {
    pub name: &'static str,
    pub critical: bool,
    action: StepAction,
}

impl fmt::Debug for UpdateStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpdateStep")
            .field("name", &self.name)
            .field("critical", &self.critical)
            .finish_non_exhaustive()
    }
}

fn step_cleanup_lock(u: &UpdateContext<'_>) -> Result<()> {
    u.workspace.cleanup_git_lock().map(|_| ())
}

fn step_reset_and_clean(u: &UpdateContext<'_>) -> Result<()> {
    u.workspace.reset_and_clean()
}

fn step_detach(u: &UpdateContext<'_>) -> Result<()> {
    u.workspace.checkout_detached()
}

fn step_fetch(u: &UpdateContext<'_>) -> Result<()> {
    u.workspace
        .fetch_ref(&u.reference, &u.branch, &u.auth)
        .map_err(|e| classify_fetch_failure(&FailureHints::of(u.provider), u.number, &u.reference, e))
}

fn step_checkout(u: &UpdateContext<'_>) -> Result<()> {
    u.workspace.checkout_branch(&u.branch)
}

pub const UPDATE_PLAN: &[UpdateStep] = &[
    UpdateStep {
        name: "clean up stale git lock",
        critical: false,
        action: step_cleanup_lock,
    },
    UpdateStep {
        name: "reset and clean working tree",
        critical: false,
        action: step_reset_and_clean,
    },
    UpdateStep {
        name: "detach HEAD",
        critical: false,
        action: step_detach,
    },
    UpdateStep {
        name: "fetch PR code",
        critical: true,
        action: step_fetch,
    },
    UpdateStep {
        name: "checkout PR branch",
        critical: true,
        action: step_checkout,
    },
    UpdateStep {
        name: "reset and clean working tree",
        critical: false,
        action: step_reset_and_clean,
    },
];

/// Entry point for callers. Cheap to clone; holds no per-repository state.
#[derive(Debug, Clone)]
pub struct RepositoryCache {
    registry: Arc<ProviderRegistry>,
    git: GitCli,
    options: CacheOptions,
}

impl RepositoryCache {
    pub fn new(registry: Arc<ProviderRegistry>, git: GitCli) -> Self {
        Self {
            registry,
            git,
            options: CacheOptions::default(),
        }
    }

    pub fn with_options(mut self, options: CacheOptions) -> Self {
        self.options = options;
        self
    }

    pub fn registry(&self) -> &ProviderRegistry {
        &self.registry
    }

    pub fn git(&self) -> &GitCli {
        &self.git
    }

    /// Return a checkout of `request` at its head commit, cloning or updating
    /// as needed.
    pub fn ensure_repository(
        &self,
        ctx: &ExecContext,
        request: &RepositoryRequest,
    ) -> Result<PathBuf> {
        request.validate()?;
        let provider = self
            .registry
            .get(&request.provider)
            .ok_or_else(|| WorkspaceError::UnknownProvider(request.provider.clone()))?;

        let root = &request.workspace_root;
        fs::create_dir_all(root).map_err(|e| {
            WorkspaceError::io(
                format!("failed to create workspace root {}", root.display()),
                e,
            )
        })?;

        let key = request.key();
        let _lock = match self.options.lock {
            WorkspaceLockMode::None => None,
            WorkspaceLockMode::Advisory => {
                Some(WorkspaceLock::acquire(&root.join(format!(".{key}.lock")))?)
            }
        };

        let path = root.join(key.as_str());
        if prepare_path(&path)? {
            self.clone_fresh(ctx, provider.as_ref(), request, &path)?;
            return Ok(path);
        }

        let workspace = Workspace::new(&self.git, ctx, &path);
        let local_head = match workspace.local_head_sha() {
            Ok(sha) => Some(sha),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "could not read local head; treating as stale");
                None
            }
        };
        if local_head
            .as_deref()
            .is_some_and(|sha| same_commit(sha, &request.head_sha))
        {
            info!(%key, head = %request.head_sha, "workspace already at requested head");
            return Ok(path);
        }

        info!(
            %key,
            number = request.pr_number,
            from = local_head.as_deref().unwrap_or("unknown"),
            to = %request.head_sha,
            "updating workspace"
        );
        let update = UpdateContext {
            workspace,
            provider: provider.as_ref(),
            number: request.pr_number,
            reference: provider.pr_ref(request.pr_number),
            branch: pr_branch_name(request.pr_number),
            auth: AuthOptions::new(
                request.token.clone(),
                provider.token_username(),
                request.insecure_skip_tls,
            ),
        };
        run_plan(UPDATE_PLAN, &update)?;

        match update.workspace.local_head_sha() {
            Ok(sha) if same_commit(&sha, &request.head_sha) => {}
            Ok(sha) => warn!(
                %key,
                requested = %request.head_sha,
                actual = %sha,
                "PR ref has moved past the requested head"
            ),
            Err(e) => warn!(%key, error = %e, "could not verify head after update"),
        }
        Ok(path)
    }

    fn clone_fresh(
        &self,
        ctx: &ExecContext,
        provider: &dyn GitProvider,
        request: &RepositoryRequest,
        path: &Path,
    ) -> Result<()> {
        let opts = CloneOptions {
            token: request.token.clone(),
            insecure_skip_tls: request.insecure_skip_tls,
        };
        provider
            .clone_pr(
                &self.git,
                ctx,
                &request.owner,
                &request.repo,
                request.pr_number,
                path,
                &opts,
            )
            .map_err(|e| {
                e.during(format!(
                    "clone {} {} #{}",
                    provider.name(),
                    provider.change_label(),
                    request.pr_number
                ))
            })
    }
}

/// Decide whether `path` needs a fresh clone, removing a directory that has
/// no `.git` so the clone starts from nothing.
fn prepare_path(path: &Path) -> Result<bool> {
    match fs::symlink_metadata(path) {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(true),
        Err(e) => Err(WorkspaceError::io(
            format!("failed to stat {}", path.display()),
            e,
        )),
        Ok(_) if path.join(".git").exists() => Ok(false),
        Ok(meta) => {
            warn!(path = %path.display(), "workspace has no .git; removing and cloning again");
            let removed = if meta.is_dir() {
                fs::remove_dir_all(path)
            } else {
                fs::remove_file(path)
            };
            removed.map_err(|e| {
                WorkspaceError::io(format!("failed to remove {}", path.display()), e)
            })?;
            Ok(true)
        }
    }
}

fn same_commit(a: &str, b: &str) -> bool {
    a.trim().eq_ignore_ascii_case(b.trim())
}

fn run_plan(plan: &[UpdateStep], update: &UpdateContext<'_>) -> Result<()> {
    for step in plan {
        debug!(step = step.name, critical = step.critical, "update step");
        match (step.action)(update) {
            Ok(()) => {}
            Err(e) if step.critical => return Err(e.during(step.name)),
            Err(e) => warn!(step = step.name, error = %e, "best-effort step failed; continuing"),
        }
    }
    Ok(())
}

//! Git hosting providers and the registry the engine resolves them from.
//!
//! A provider contributes only what differs between hosts: the ref a PR is
//! exposed under, how to build the remote URL, and the hints used when a fetch
//! fails. The clone protocol itself is shared.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use crate::clone::{clone_pr_with_refs, ClonePrParams, FailureHints};
use crate::credential::{Secret, DEFAULT_TOKEN_USERNAME};
use crate::errors::Result;
use crate::git::GitCli;
use crate::util::ExecContext;

/// Per-call options for [`GitProvider::clone_pr`].
#[derive(Debug, Clone, Default)]
pub struct CloneOptions {
    pub token: Option<Secret>,
    pub insecure_skip_tls: bool,
}

pub trait GitProvider: Send + Sync {
    /// Short name used in workspace keys and error text.
    fn name(&self) -> &str;

    /// Ref the host exposes PR/MR `number` under.
    fn pr_ref(&self, number: u64) -> String;

    /// Remote URL for `owner/repo`, never carrying credentials.
    fn remote_url(&self, owner: &str, repo: &str) -> String;

    /// Environment variable the token for this host is expected in.
    fn token_env_var(&self) -> &str;

    /// "PR" or "MR", for messages.
    fn change_label(&self) -> &'static str {
        "PR"
    }

    /// Extra advice when the PR ref does not exist on the remote.
    fn ref_not_found_hint(&self) -> Option<&str> {
        None
    }

    /// Username sent alongside the token.
    fn token_username(&self) -> &str {
        DEFAULT_TOKEN_USERNAME
    }

    /// Materialize PR `number` of `owner/repo` into `dest` for the first time.
    #[allow(clippy::too_many_arguments)]
    fn clone_pr(
        &self,
        git: &GitCli,
        ctx: &ExecContext,
        owner: &str,
        repo: &str,
        number: u64,
        dest: &Path,
        opts: &CloneOptions,
    ) -> Result<()> {
        let params = ClonePrParams {
            hints: FailureHints::of(self),
            remote_url: self.remote_url(owner, repo),
            token: opts.token.clone(),
            username: self.token_username(),
            ref_path: self.pr_ref(number),
            pr_number: number,
            dest,
            insecure_skip_tls: opts.insecure_skip_tls,
        };
        clone_pr_with_refs(git, ctx, Some(&params))
    }
}

fn join_url(base: &str, owner: &str, repo: &str) -> String {
    format!("{}/{}/{}.git", base.trim_end_matches('/'), owner, repo)
}

macro_rules! provider_builders {
    ($ty:ident) => {
        impl $ty {
            pub fn with_name(mut self, name: impl Into<String>) -> Self {
                self.name = name.into();
                self
            }

            pub fn with_token_env(mut self, var: impl Into<String>) -> Self {
                self.token_env = var.into();
                self
            }

            pub fn base_url(&self) -> &str {
                &self.base_url
            }
        }
    };
}

/// github.com or GitHub Enterprise.
#[derive(Debug, Clone)]
pub struct GitHub {
    name: String,
    base_url: String,
    token_env: String,
}

impl GitHub {
    pub const DEFAULT_BASE_URL: &'static str = "https://github.com";

    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            name: "github".to_string(),
            base_url: base_url.into(),
            token_env: "GITHUB_TOKEN".to_string(),
        }
    }
}

impl Default for GitHub {
    fn default() -> Self {
        Self::new(Self::DEFAULT_BASE_URL)
    }
}

provider_builders!(GitHub);

impl GitProvider for GitHub {
    fn name(&self) -> &str {
        &self.name
    }

    fn pr_ref(&self, number: u64) -> String {
        format!("refs/pull/{number}/head")
    }

    fn remote_url(&self, owner: &str, repo: &str) -> String {
        join_url(&self.base_url, owner, repo)
    }

    fn token_env_var(&self) -> &str {
        &self.token_env
    }
}

/// gitlab.com or a self-managed GitLab. Owners may be nested groups
/// (`org/team/project`).
#[derive(Debug, Clone)]
pub struct GitLab {
    name: String,
    base_url: String,
    token_env: String,
}

impl GitLab {
    pub const DEFAULT_BASE_URL: &'static str = "https://gitlab.com";

    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            name: "gitlab".to_string(),
            base_url: base_url.into(),
            token_env: "GITLAB_TOKEN".to_string(),
        }
    }
}

impl Default for GitLab {
    fn default() -> Self {
        Self::new(Self::DEFAULT_BASE_URL)
    }
}

provider_builders!(GitLab);

impl GitProvider for GitLab {
    fn name(&self) -> &str {
        &self.name
    }

    fn pr_ref(&self, number: u64) -> String {
        format!("refs/merge-requests/{number}/head")
    }

    fn remote_url(&self, owner: &str, repo: &str) -> String {
        join_url(&self.base_url, owner, repo)
    }

    fn token_env_var(&self) -> &str {
        &self.token_env
    }

    fn change_label(&self) -> &'static str {
        "MR"
    }

    fn ref_not_found_hint(&self) -> Option<&str> {
        Some(
            "GitLab only serves refs/merge-requests/* when the server setting that exposes merge request refs to git clients is enabled; ask the instance administrator to enable it",
        )
    }

    fn token_username(&self) -> &str {
        "oauth2"
    }
}

/// Gitea or Forgejo.
#[derive(Debug, Clone)]
pub struct Gitea {
    name: String,
    base_url: String,
    token_env: String,
}

impl Gitea {
    pub const DEFAULT_BASE_URL: &'static str = "https://gitea.com";

    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            name: "gitea".to_string(),
            base_url: base_url.into(),
            token_env: "GITEA_TOKEN".to_string(),
        }
    }
}

impl Default for Gitea {
    fn default() -> Self {
        Self::new(Self::DEFAULT_BASE_URL)
    }
}

provider_builders!(Gitea);

impl GitProvider for Gitea {
    fn name(&self) -> &str {
        &self.name
    }

    fn pr_ref(&self, number: u64) -> String {
        format!("refs/pull/{number}/head")
    }

    fn remote_url(&self, owner: &str, repo: &str) -> String {
        join_url(&self.base_url, owner, repo)
    }

    fn token_env_var(&self) -> &str {
        &self.token_env
    }
}

/// Providers by name. Built once at startup and shared with the engine.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    providers: BTreeMap<String, Arc<dyn GitProvider>>,
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("providers", &self.providers.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// github.com, gitlab.com and gitea.com.
    pub fn with_defaults() -> Self {
        let mut reg = Self::new();
        reg.register(GitHub::default());
        reg.register(GitLab::default());
        reg.register(Gitea::default());
        reg
    }

    /// Add `provider` under its name, replacing any previous entry.
    pub fn register<P: GitProvider + 'static>(&mut self, provider: P) -> &mut Self {
        self.register_arc(Arc::new(provider))
    }

    pub fn register_arc(&mut self, provider: Arc<dyn GitProvider>) -> &mut Self {
        self.providers.insert(provider.name().to_string(), provider);
        self
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn GitProvider>> {
        self.providers.get(name).cloned()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.providers.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }
}

//! Engine configuration: built-in defaults, an optional YAML file, then
//! `PR_WORKSPACE_*` environment overrides.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::cache::{CacheOptions, RepositoryCache, WorkspaceLockMode};
use crate::errors::{Result, WorkspaceError};
use crate::git::{GitCli, DEFAULT_GIT_PROGRAM, LONG_OPERATION_TIMEOUT};
use crate::provider::{GitHub, GitLab, Gitea, ProviderRegistry};
use crate::util::ExecService;

pub const ENV_ROOT: &str = "PR_WORKSPACE_ROOT";
pub const ENV_GIT: &str = "PR_WORKSPACE_GIT";
pub const ENV_COMMAND_TIMEOUT: &str = "PR_WORKSPACE_COMMAND_TIMEOUT_SECS";
pub const ENV_FETCH_TIMEOUT: &str = "PR_WORKSPACE_FETCH_TIMEOUT_SECS";
pub const ENV_INSECURE: &str = "PR_WORKSPACE_INSECURE_SKIP_TLS";
pub const ENV_LOCK: &str = "PR_WORKSPACE_LOCK";

const DEFAULT_COMMAND_TIMEOUT_SECS: u64 = 60;

/// `$HOME/.cache/pr-workspace/repos`, or under the temp dir without a home.
pub fn default_workspace_root() -> PathBuf {
    home::home_dir()
        .map(|h| h.join(".cache"))
        .unwrap_or_else(env::temp_dir)
        .join("pr-workspace")
        .join("repos")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Github,
    Gitlab,
    Gitea,
}

/// A provider entry; `name` defaults to the kind, so a self-hosted instance
/// can either replace the public host or sit beside it under another name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProviderConfig {
    pub kind: ProviderKind,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub token_env: Option<String>,
}

/// Build a provider of type `$ty` from a [`ProviderConfig`].
macro_rules! configured {
    ($ty:ident, $cfg:expr) => {{
        let cfg: &ProviderConfig = $cfg;
        let mut provider = $ty::new(cfg.base_url.as_deref().unwrap_or($ty::DEFAULT_BASE_URL));
        if let Some(name) = &cfg.name {
            provider = provider.with_name(name.trim());
        }
        if let Some(var) = &cfg.token_env {
            provider = provider.with_token_env(var.as_str());
        }
        provider
    }};
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    pub workspace_root: PathBuf,
    pub git: String,
    /// Window for short git commands (rev-parse, checkout, branch, remote).
    pub command_timeout_secs: u64,
    /// Window for fetch and reset/clean.
    pub fetch_timeout_secs: u64,
    pub insecure_skip_tls: bool,
    pub lock: WorkspaceLockMode,
    /// Registered on top of github, gitlab and gitea.
    pub providers: Vec<ProviderConfig>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workspace_root: default_workspace_root(),
            git: DEFAULT_GIT_PROGRAM.to_string(),
            command_timeout_secs: DEFAULT_COMMAND_TIMEOUT_SECS,
            fetch_timeout_secs: LONG_OPERATION_TIMEOUT.as_secs(),
            insecure_skip_tls: false,
            lock: WorkspaceLockMode::None,
            providers: Vec::new(),
        }
    }
}

impl EngineConfig {
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(text)
            .map_err(|e| WorkspaceError::Configuration(format!("invalid config: {e}")))
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path).map_err(|e| {
            WorkspaceError::io(format!("failed to read config {}", path.display()), e)
        })?;
        Self::from_yaml_str(&text).map_err(|e| e.during(format!("load {}", path.display())))
    }

    /// Defaults or `path`, then the process environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut cfg = match path {
            Some(p) => Self::from_file(p)?,
            None => Self::default(),
        };
        cfg.apply_env(|k| env::var(k).ok())?;
        Ok(cfg)
    }

    /// Apply `PR_WORKSPACE_*` overrides read through `lookup`. Empty values
    /// are ignored.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        if let Some(v) = get(ENV_ROOT) {
            self.workspace_root = PathBuf::from(v);
        }
        if let Some(v) = get(ENV_GIT) {
            self.git = v;
        }
        if let Some(v) = get(ENV_COMMAND_TIMEOUT) {
            self.command_timeout_secs = parse_secs(ENV_COMMAND_TIMEOUT, &v)?;
        }
        if let Some(v) = get(ENV_FETCH_TIMEOUT) {
            self.fetch_timeout_secs = parse_secs(ENV_FETCH_TIMEOUT, &v)?;
        }
        if let Some(v) = get(ENV_INSECURE) {
            self.insecure_skip_tls = parse_bool(ENV_INSECURE, &v)?;
        }
        if let Some(v) = get(ENV_LOCK) {
            self.lock = v
                .parse::<WorkspaceLockMode>()
                .map_err(|e| WorkspaceError::Configuration(format!("{ENV_LOCK}: {e}")))?;
        }
        Ok(())
    }

    pub fn registry(&self) -> Result<ProviderRegistry> {
        let mut reg = ProviderRegistry::with_defaults();
        for p in &self.providers {
            if p.name.as_deref().is_some_and(|n| n.trim().is_empty()) {
                return Err(WorkspaceError::Configuration(
                    "provider name must not be empty".to_string(),
                ));
            }
            match p.kind {
                ProviderKind::Github => reg.register(configured!(GitHub, p)),
                ProviderKind::Gitlab => reg.register(configured!(GitLab, p)),
                ProviderKind::Gitea => reg.register(configured!(Gitea, p)),
            };
        }
        Ok(reg)
    }

    pub fn exec_service(&self) -> ExecService {
        ExecService::new(Duration::from_secs(self.command_timeout_secs))
    }

    pub fn git_cli(&self) -> GitCli {
        GitCli::new(Arc::new(self.exec_service()))
            .with_program(&self.git)
            .with_long_timeout(Duration::from_secs(self.fetch_timeout_secs))
    }

    pub fn cache(&self) -> Result<RepositoryCache> {
        Ok(
            RepositoryCache::new(Arc::new(self.registry()?), self.git_cli()).with_options(
                CacheOptions { lock: self.lock },
            ),
        )
    }
}

fn parse_secs(key: &str, value: &str) -> Result<u64> {
    match value.parse::<u64>() {
        Ok(0) | Err(_) => Err(WorkspaceError::Configuration(format!(
            "{key} must be a positive number of seconds, got '{value}'"
        ))),
        Ok(n) => Ok(n),
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(WorkspaceError::Configuration(format!(
            "{key} must be a boolean, got '{value}'"
        ))),
    }
}

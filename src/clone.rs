//! First-time materialization of a PR: init, point `origin` at the remote,
//! fetch the PR ref into `pr-<n>`, check it out.

use std::path::Path;

use tracing::{debug, info};
use url::Url;

use crate::credential::{AuthOptions, GitEnv, Secret};
use crate::errors::{Result, WorkspaceError};
use crate::git::{pr_branch_name, GitCli};
use crate::provider::GitProvider;
use crate::util::ExecContext;

/// What a provider contributes to fetch error messages.
#[derive(Debug, Clone, Copy)]
pub struct FailureHints<'a> {
    pub provider: &'a str,
    pub label: &'a str,
    pub token_env_var: &'a str,
    pub ref_not_found_hint: Option<&'a str>,
}

impl<'a> FailureHints<'a> {
    pub fn of<P: GitProvider + ?Sized>(provider: &'a P) -> Self {
        Self {
            provider: provider.name(),
            label: provider.change_label(),
            token_env_var: provider.token_env_var(),
            ref_not_found_hint: provider.ref_not_found_hint(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClonePrParams<'a> {
    pub hints: FailureHints<'a>,
    /// Remote URL without embedded credentials.
    pub remote_url: String,
    pub token: Option<Secret>,
    pub username: &'a str,
    /// e.g. `refs/pull/7/head` or `refs/merge-requests/7/head`.
    pub ref_path: String,
    pub pr_number: u64,
    pub dest: &'a Path,
    pub insecure_skip_tls: bool,
}

/// Run the four-step clone protocol. `None` params is a configuration error
/// raised before anything is spawned.
pub fn clone_pr_with_refs(
    git: &GitCli,
    ctx: &ExecContext,
    params: Option<&ClonePrParams<'_>>,
) -> Result<()> {
    let params = params.ok_or_else(|| {
        WorkspaceError::Configuration("clone parameters are required".to_string())
    })?;
    reject_credentials_in_url(&params.remote_url)?;

    let auth = AuthOptions::new(
        params.token.clone(),
        params.username,
        params.insecure_skip_tls,
    );
    // Lives until the end of the protocol; dropping it removes the script.
    let env = GitEnv::prepare(&auth)?;
    let dest = params.dest;
    let branch = pr_branch_name(params.pr_number);

    info!(
        provider = params.hints.provider,
        number = params.pr_number,
        dest = %dest.display(),
        "cloning PR into fresh workspace"
    );

    let init = git.request(None, &["init", "-q"]).arg(dest).context(ctx);
    git.execute(env.apply(init))
        .map_err(|e| e.during("initialize repository"))?;

    configure_origin(git, ctx, &env, dest, &params.remote_url)
        .map_err(|e| e.during("configure remote"))?;

    let refspec = format!("{}:{}", params.ref_path, branch);
    let fetch = git
        .request(Some(dest), &["fetch", "--no-tags", "origin", &refspec])
        .context(ctx)
        .timeout(git.long_timeout());
    git.execute(env.apply(fetch))
        .map_err(|e| classify_fetch_failure(&params.hints, params.pr_number, &params.ref_path, e))?;

    git.execute(env.apply(git.request(Some(dest), &["checkout", &branch]).context(ctx)))
        .map_err(|e| e.during("checkout PR branch"))?;

    drop(env);
    Ok(())
}

/// `remote set-url`, falling back to `remote add` when there is no origin yet.
fn configure_origin(
    git: &GitCli,
    ctx: &ExecContext,
    env: &GitEnv,
    dest: &Path,
    url: &str,
) -> Result<()> {
    let set = git
        .request(Some(dest), &["remote", "set-url", "origin", url])
        .context(ctx);
    match git.execute(env.apply(set)) {
        Ok(_) => Ok(()),
        Err(e) => {
            debug!(error = %e, "origin missing; adding it");
            let add = git
                .request(Some(dest), &["remote", "add", "origin", url])
                .context(ctx);
            git.execute(env.apply(add)).map(|_| ())
        }
    }
}

fn reject_credentials_in_url(remote_url: &str) -> Result<()> {
    if let Ok(url) = Url::parse(remote_url) {
        if url.password().is_some() {
            return Err(WorkspaceError::Configuration(
                "remote URL must not embed credentials; pass the token separately".to_string(),
            ));
        }
    }
    Ok(())
}

const REF_NOT_FOUND_PATTERNS: &[&str] = &["couldn't find remote ref", "could not find remote ref"];

const AUTH_PATTERNS: &[&str] = &[
    "authentication failed",
    "could not read username",
    "could not read password",
    "invalid username or password",
    "http basic: access denied",
    "the requested url returned error: 401",
    "the requested url returned error: 403",
];

const CERT_PATTERNS: &[&str] = &[
    "ssl certificate problem",
    "certificate verify failed",
    "server certificate verification failed",
    "unable to get local issuer certificate",
    "self signed certificate",
    "self-signed certificate",
];

/// Upgrade a failed fetch of `reference` into an actionable error using its
/// stderr. Anything unrecognized becomes "failed to fetch PR #n".
pub fn classify_fetch_failure(
    hints: &FailureHints<'_>,
    number: u64,
    reference: &str,
    err: WorkspaceError,
) -> WorkspaceError {
    if !matches!(err, WorkspaceError::Process { .. }) {
        return err.during(format!("fetch {} #{}", hints.label, number));
    }
    let stderr = err.stderr().unwrap_or_default().to_ascii_lowercase();
    let matches = |patterns: &[&str]| patterns.iter().any(|p| stderr.contains(p));

    if matches(REF_NOT_FOUND_PATTERNS) {
        WorkspaceError::RefNotFound {
            provider: hints.provider.to_string(),
            label: hints.label.to_string(),
            number,
            reference: reference.to_string(),
            hint: hints.ref_not_found_hint.map(str::to_string),
        }
    } else if matches(AUTH_PATTERNS) {
        WorkspaceError::Authentication {
            provider: hints.provider.to_string(),
            label: hints.label.to_string(),
            number,
            env_var: hints.token_env_var.to_string(),
            stderr: err.stderr().unwrap_or_default().to_string(),
        }
    } else if matches(CERT_PATTERNS) {
        WorkspaceError::Certificate {
            provider: hints.provider.to_string(),
            label: hints.label.to_string(),
            number,
            stderr: err.stderr().unwrap_or_default().to_string(),
        }
    } else {
        err.during(format!("fetch {} #{}", hints.label, number))
    }
}

//! Ephemeral credential scripts and the per-invocation git environment.
//!
//! A token is handed to git through a throwaway script that prints
//! `password=<token>`. The script is registered both as a git credential
//! helper (whose protocol consumes `key=value` lines) and as `GIT_ASKPASS`, and
//! lives exactly as long as the [`GitEnv`] that owns it. The token never
//! appears in argv or in a remote URL written to `.git/config`.

use std::fmt;
use std::io::{self, Write};
use std::path::Path;

use once_cell::sync::Lazy;
use tempfile::TempPath;
use tracing::debug;

use crate::errors::{Result, WorkspaceError};
use crate::util::{batch_escape, mask_secret, reject_newlines, shell_escape, ExecRequest, ShellFile};

/// File name prefix of every credential script.
pub const SCRIPT_PREFIX: &str = "pr-workspace-askpass-";

/// Username paired with a token when the provider does not name one.
pub const DEFAULT_TOKEN_USERNAME: &str = "x-access-token";

/// A token or password. `Debug` and `Display` only ever show a masked form.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Secret({})", mask_secret(&self.0))
    }
}

impl fmt::Display for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&mask_secret(&self.0))
    }
}

impl From<String> for Secret {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for Secret {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Which kind of script the host can execute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptFlavor {
    Posix,
    Batch,
}

static HOST_FLAVOR: Lazy<ScriptFlavor> = Lazy::new(|| {
    if cfg!(windows) {
        ScriptFlavor::Batch
    } else {
        ScriptFlavor::Posix
    }
});

impl ScriptFlavor {
    /// Flavor for this process, decided once from the host OS.
    pub fn host() -> Self {
        *HOST_FLAVOR
    }

    pub fn suffix(self) -> &'static str {
        match self {
            ScriptFlavor::Posix => ".sh",
            ScriptFlavor::Batch => ".bat",
        }
    }

    /// `credential.helper` value for the script at `path`. Git hands an
    /// absolute helper path to a shell with the action appended, so the path
    /// is quoted for that shell.
    pub fn helper_command(self, path: &Path) -> String {
        let path = path.display().to_string();
        match self {
            ScriptFlavor::Posix => shell_escape(&path),
            ScriptFlavor::Batch => format!("\"{}\"", path.replace('"', "")),
        }
    }

    /// Script body answering git with `password=<token>`.
    ///
    /// As a credential helper git passes `get`/`store`/`erase`; only `get`
    /// (or an askpass prompt) produces output.
    pub fn render(self, token: &str) -> io::Result<String> {
        let mut file = ShellFile::new();
        match self {
            ScriptFlavor::Posix => {
                file.push("#!/bin/sh")
                    .push("case \"$1\" in")
                    .push("  store|erase) exit 0 ;;")
                    .push("esac")
                    .push(format!(
                        "printf '%s\\n' {}",
                        shell_escape(&format!("password={token}"))
                    ));
                file.build()
            }
            ScriptFlavor::Batch => {
                file.push("@echo off")
                    .push("if \"%~1\"==\"store\" exit /b 0")
                    .push("if \"%~1\"==\"erase\" exit /b 0")
                    .push(format!("echo password={}", batch_escape(token)));
                file.build_crlf()
            }
        }
    }
}

/// A credential script on disk; deleted when dropped.
pub struct CredentialScript {
    path: TempPath,
}

impl CredentialScript {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Delete now and report failure instead of ignoring it on drop.
    pub fn close(self) -> io::Result<()> {
        self.path.close()
    }
}

impl fmt::Debug for CredentialScript {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialScript")
            .field("path", &self.path.display())
            .finish()
    }
}

/// Write a credential script for `token` using the host flavor.
pub fn create_credential_helper(token: &Secret) -> io::Result<CredentialScript> {
    create_credential_helper_with(token, ScriptFlavor::host())
}

pub fn create_credential_helper_with(
    token: &Secret,
    flavor: ScriptFlavor,
) -> io::Result<CredentialScript> {
    reject_newlines(token.expose(), "credential token")
        .map_err(|msg| io::Error::new(io::ErrorKind::InvalidInput, msg))?;
    let body = flavor.render(token.expose())?;

    let mut file = tempfile::Builder::new()
        .prefix(SCRIPT_PREFIX)
        .suffix(flavor.suffix())
        .tempfile()?;
    file.write_all(body.as_bytes())?;
    file.as_file().sync_all()?;
    // Close the handle before anything executes the file (ETXTBSY on Linux).
    let path = file.into_temp_path();
    restrict_permissions(&path)?;

    debug!(
        script = %path.display(),
        token = %token,
        "created credential script"
    );
    Ok(CredentialScript { path })
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o700))
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) -> io::Result<()> {
    Ok(())
}

/// Authentication and transport settings for one git invocation.
#[derive(Debug, Clone)]
pub struct AuthOptions {
    pub token: Option<Secret>,
    /// Placeholder username sent alongside the token.
    pub username: String,
    pub insecure_skip_tls: bool,
}

impl Default for AuthOptions {
    fn default() -> Self {
        Self {
            token: None,
            username: DEFAULT_TOKEN_USERNAME.to_string(),
            insecure_skip_tls: false,
        }
    }
}

impl AuthOptions {
    pub fn new(token: Option<Secret>, username: impl Into<String>, insecure_skip_tls: bool) -> Self {
        Self {
            token: token.filter(|t| !t.is_empty()),
            username: username.into(),
            insecure_skip_tls,
        }
    }
}

/// Environment overlay for a git invocation, owning the credential script (if
/// any) so the script is removed when the overlay goes away.
#[derive(Debug)]
pub struct GitEnv {
    vars: Vec<(String, String)>,
    script: Option<CredentialScript>,
}

impl GitEnv {
    /// Build the overlay. Creating the credential script happens here, before
    /// any process is spawned; failure aborts the caller's operation.
    pub fn prepare(auth: &AuthOptions) -> Result<Self> {
        let mut vars = vec![("GIT_TERMINAL_PROMPT".to_string(), "0".to_string())];
        if auth.insecure_skip_tls {
            vars.push(("GIT_SSL_NO_VERIFY".to_string(), "true".to_string()));
        }

        let script = match &auth.token {
            Some(token) => {
                let script = create_credential_helper(token)
                    .map_err(|e| WorkspaceError::io("failed to create credential helper", e))?;
                let script_path = script.path().display().to_string();
                vars.push(("GIT_ASKPASS".to_string(), script_path));
                // An empty credential.helper resets inherited helpers so the
                // token cannot be stored by a user-level helper.
                let config = [
                    ("credential.helper", String::new()),
                    (
                        "credential.helper",
                        ScriptFlavor::host().helper_command(script.path()),
                    ),
                    ("credential.username", auth.username.clone()),
                ];
                vars.push(("GIT_CONFIG_COUNT".to_string(), config.len().to_string()));
                for (i, (key, value)) in config.into_iter().enumerate() {
                    vars.push((format!("GIT_CONFIG_KEY_{i}"), key.to_string()));
                    vars.push((format!("GIT_CONFIG_VALUE_{i}"), value));
                }
                Some(script)
            }
            None => None,
        };

        Ok(Self { vars, script })
    }

    pub fn vars(&self) -> &[(String, String)] {
        &self.vars
    }

    pub fn script_path(&self) -> Option<&Path> {
        self.script.as_ref().map(CredentialScript::path)
    }

    pub fn apply(&self, mut request: ExecRequest) -> ExecRequest {
        for (k, v) in &self.vars {
            request = request.env(k, v);
        }
        request
    }
}

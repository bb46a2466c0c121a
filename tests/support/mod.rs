/*!
Test support helpers shared across integration tests.

- have_git(): check git availability on PATH
- init_repo_with_default_user(dir): initialize a git repo with default user.name/email
- commit_file(dir, name, content): commit one file and return the new commit hash
- set_pr_ref(dir, number, sha): point refs/pull/<number>/head at a commit
- head_of(dir): current HEAD commit hash

These helpers do not print skip messages themselves so tests can preserve their
existing "skipping: ..." outputs verbatim.
*/

use std::io;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

/// Return true if `git` is available on PATH.
#[allow(dead_code)]
pub fn have_git() -> bool {
    Command::new("git")
        .arg("--version")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

/// Run git in `dir` and return trimmed stdout; panics on failure.
#[allow(dead_code)]
pub fn git(dir: &Path, args: &[&str]) -> String {
    let out = Command::new("git")
        .args(["-c", "commit.gpgsign=false"])
        .args(args)
        .current_dir(dir)
        .stdin(Stdio::null())
        .output()
        .expect("spawn git");
    assert!(
        out.status.success(),
        "git {:?} failed in {}: {}",
        args,
        dir.display(),
        String::from_utf8_lossy(&out.stderr)
    );
    String::from_utf8_lossy(&out.stdout).trim().to_string()
}

/// Initialize a git repository at `dir` and set a default user identity.
/// Idempotent: safe to call when repo already exists.
#[allow(dead_code)]
pub fn init_repo_with_default_user(dir: &Path) -> io::Result<()> {
    std::fs::create_dir_all(dir)?;
    let _ = Command::new("git")
        .args(["init", "-q"])
        .current_dir(dir)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status();
    let _ = Command::new("git")
        .args(["config", "user.name", "PR Workspace Test"])
        .current_dir(dir)
        .status();
    let _ = Command::new("git")
        .args(["config", "user.email", "pr-workspace@example.com"])
        .current_dir(dir)
        .status();
    Ok(())
}

/// Write `name` with `content`, commit it, and return the commit hash.
#[allow(dead_code)]
pub fn commit_file(dir: &Path, name: &str, content: &str) -> String {
    std::fs::write(dir.join(name), content).expect("write file");
    git(dir, &["add", "-A"]);
    git(dir, &["commit", "-q", "-m", &format!("update {name}")]);
    head_of(dir)
}

/// Point `refs/pull/<number>/head` at `sha`, the way a host exposes a PR.
#[allow(dead_code)]
pub fn set_pr_ref(dir: &Path, number: u64, sha: &str) {
    git(dir, &["update-ref", &format!("refs/pull/{number}/head"), sha]);
}

#[allow(dead_code)]
pub fn head_of(dir: &Path) -> String {
    git(dir, &["rev-parse", "HEAD"])
}

/// An upstream repository laid out so that `{base}/{owner}/{repo}.git` is
/// its path; `base` can be used as a provider base URL.
#[allow(dead_code)]
pub struct Upstream {
    pub base: PathBuf,
    pub dir: PathBuf,
}

#[allow(dead_code)]
impl Upstream {
    pub fn create(root: &Path, owner: &str, repo: &str) -> Self {
        let base = root.join("remotes");
        let dir = base.join(owner).join(format!("{repo}.git"));
        init_repo_with_default_user(&dir).expect("init upstream");
        Upstream { base, dir }
    }

    pub fn base_url(&self) -> String {
        self.base.display().to_string()
    }
}

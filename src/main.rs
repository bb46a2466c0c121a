use std::env;
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde_json::json;

use pr_workspace::{
    exit_code_for_error, telemetry, EngineConfig, ExecContext, ExecRequest, ProcessRunner,
    RepositoryRequest, Secret, WorkspaceError, WorkspaceKey,
};

#[derive(Parser, Debug)]
#[command(
    name = "pr-workspace",
    version,
    about = "Materialize pull/merge-request checkouts on disk, reusing cached clones."
)]
struct Cli {
    /// YAML config file (defaults plus PR_WORKSPACE_* env overrides when unset)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log every git invocation
    #[arg(long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug, Clone)]
enum Command {
    /// Ensure a checkout of a PR at a given head commit and print its path
    Ensure {
        /// Registered provider name (github, gitlab, gitea, or a configured one)
        #[arg(long)]
        provider: String,
        /// Owner or namespace; may contain '/' for nested groups
        #[arg(long)]
        owner: String,
        #[arg(long)]
        repo: String,
        /// PR/MR number
        #[arg(long = "pr")]
        pr: u64,
        /// Desired head commit hash
        #[arg(long)]
        head: String,
        /// Workspace root (overrides config)
        #[arg(long)]
        root: Option<PathBuf>,
        /// Skip TLS certificate verification
        #[arg(long)]
        insecure: bool,
        /// Print a JSON object instead of the bare path
        #[arg(long)]
        json: bool,
    },
    /// Print the workspace directory name for a repository
    Key {
        #[arg(long)]
        provider: String,
        #[arg(long)]
        owner: String,
        #[arg(long)]
        repo: String,
    },
    /// Run diagnostics to check environment and configuration
    Doctor,
}

fn main() -> ExitCode {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    telemetry::init_logging(cli.verbose);

    match run(cli) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("pr-workspace: {e:#}");
            let code = e
                .downcast_ref::<WorkspaceError>()
                .map(exit_code_for_error)
                .unwrap_or(1);
            ExitCode::from(code)
        }
    }
}

fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    let cfg = EngineConfig::load(cli.config.as_deref()).context("failed to load configuration")?;

    match cli.command {
        Command::Key {
            provider,
            owner,
            repo,
        } => {
            println!("{}", WorkspaceKey::new(&provider, &owner, &repo));
            Ok(ExitCode::SUCCESS)
        }
        Command::Doctor => {
            run_doctor(&cfg)?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Ensure {
            provider,
            owner,
            repo,
            pr,
            head,
            root,
            insecure,
            json,
        } => {
            let cache = cfg.cache()?;
            let token = cache
                .registry()
                .get(&provider)
                .and_then(|p| env::var(p.token_env_var()).ok())
                .filter(|t| !t.trim().is_empty())
                .map(Secret::from);
            let request = RepositoryRequest {
                provider,
                owner,
                repo,
                pr_number: pr,
                head_sha: head,
                workspace_root: root.unwrap_or_else(|| cfg.workspace_root.clone()),
                token,
                insecure_skip_tls: insecure || cfg.insecure_skip_tls,
            };
            let path = cache.ensure_repository(&ExecContext::new(), &request)?;
            if json {
                let out = json!({
                    "path": path.display().to_string(),
                    "key": request.key().to_string(),
                    "provider": request.provider,
                    "number": request.pr_number,
                    "head": request.head_sha,
                });
                println!("{}", serde_json::to_string_pretty(&out)?);
            } else {
                println!("{}", path.display());
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn run_doctor(cfg: &EngineConfig) -> anyhow::Result<()> {
    eprintln!("pr-workspace doctor");
    eprintln!("  version: v{}", env!("CARGO_PKG_VERSION"));
    eprintln!(
        "  build: {} ({}, {})",
        env!("PR_WORKSPACE_BUILD_DATE"),
        env!("PR_WORKSPACE_BUILD_TARGET"),
        env!("PR_WORKSPACE_BUILD_PROFILE")
    );
    eprintln!("  host: {} / {}", env::consts::OS, env::consts::ARCH);

    match which::which(&cfg.git) {
        Ok(p) => {
            eprintln!("  git: {}", p.display());
            let req = ExecRequest::new(&p)
                .arg("--version")
                .inherit_env(true)
                .capture_output(true);
            match cfg.exec_service().run(req) {
                Ok(out) if out.success() => eprintln!("  git --version: {}", out.stdout.trim()),
                Ok(out) => eprintln!("  git --version: failed ({})", out.stderr.trim()),
                Err(e) => eprintln!("  git --version: {e}"),
            }
        }
        Err(e) => eprintln!("  git: not found ({e})"),
    }

    let root = &cfg.workspace_root;
    let state = if root.is_dir() { "exists" } else { "will be created" };
    eprintln!("  workspace root: {} ({state})", root.display());
    eprintln!("  fetch timeout: {}s", cfg.fetch_timeout_secs);
    eprintln!("  workspace lock: {:?}", cfg.lock);
    eprintln!(
        "  insecure TLS: {}",
        if cfg.insecure_skip_tls { "yes" } else { "no" }
    );

    let registry = cfg.registry().context("invalid provider configuration")?;
    for name in registry.names() {
        if let Some(p) = registry.get(name) {
            let token = if env::var(p.token_env_var()).is_ok_and(|v| !v.trim().is_empty()) {
                "set"
            } else {
                "unset"
            };
            eprintln!(
                "  provider {name}: {} (token {} {token})",
                p.remote_url("{owner}", "{repo}"),
                p.token_env_var()
            );
        }
    }

    eprintln!("doctor: completed diagnostics.");
    Ok(())
}

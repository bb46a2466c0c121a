use std::env;

use once_cell::sync::OnceCell;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

/// Filter directives read before `RUST_LOG`.
pub const LOG_ENV: &str = "PR_WORKSPACE_LOG";

static INIT: OnceCell<()> = OnceCell::new();

/// Filter used when neither environment variable is set. `verbose` raises the
/// crate to debug so every git invocation is logged.
fn default_directives(verbose: bool) -> &'static str {
    if verbose {
        "info,pr_workspace=debug"
    } else {
        "info"
    }
}

fn directives_from_env(verbose: bool) -> String {
    [LOG_ENV, "RUST_LOG"]
        .iter()
        .filter_map(|k| env::var(k).ok())
        .map(|s| s.trim().to_string())
        .find(|s| !s.is_empty())
        .unwrap_or_else(|| default_directives(verbose).to_string())
}

/// Install the global fmt subscriber writing to stderr. Safe to call more than
/// once; only the first call has an effect.
pub fn init_logging(verbose: bool) {
    if INIT.get().is_some() {
        return;
    }

    let directives = directives_from_env(verbose);
    let filter = EnvFilter::try_new(&directives).unwrap_or_else(|e| {
        eprintln!("pr-workspace: invalid log filter '{directives}' ({e}); using info");
        EnvFilter::new("info")
    });
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false);

    if tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .try_init()
        .is_err()
    {
        eprintln!("pr-workspace: logging init skipped (global subscriber already set)");
    }
    let _ = INIT.set(());
}

use std::process::Command;

#[test]
fn test_cli_doctor_exits_zero() {
    let bin = env!("CARGO_BIN_EXE_pr-workspace");
    let td = tempfile::tempdir().expect("tmpdir");
    let out = Command::new(bin)
        .arg("doctor")
        .env("PR_WORKSPACE_ROOT", td.path())
        .output()
        .expect("failed to run pr-workspace doctor");
    assert!(
        out.status.success(),
        "pr-workspace doctor exited non-zero: {:?}\nstdout:\n{}\nstderr:\n{}",
        out.status.code(),
        String::from_utf8_lossy(&out.stdout),
        String::from_utf8_lossy(&out.stderr)
    );
    let err = String::from_utf8_lossy(&out.stderr);
    assert!(err.contains("workspace root:"), "stderr:\n{err}");
    assert!(err.contains("provider github:"), "stderr:\n{err}");
    assert!(err.contains("provider gitlab:"), "stderr:\n{err}");
}

#[test]
fn test_cli_doctor_rejects_bad_env_override() {
    let bin = env!("CARGO_BIN_EXE_pr-workspace");
    let out = Command::new(bin)
        .arg("doctor")
        .env("PR_WORKSPACE_LOCK", "sometimes")
        .output()
        .expect("failed to run pr-workspace doctor");
    assert_eq!(out.status.code(), Some(1));
    let err = String::from_utf8_lossy(&out.stderr);
    assert!(err.contains("PR_WORKSPACE_LOCK"), "stderr:\n{err}");
}

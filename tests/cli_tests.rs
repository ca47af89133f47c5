//! Integration tests for the tmaprobe command line

use predicates::prelude::*;

#[test]
fn test_pid_flag_exists() {
    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("tmaprobe");
    cmd.arg("--help");

    cmd.assert()
        .success()
        .stdout(predicate::str::contains("-p, --pid <PID>"))
        .stdout(predicate::str::contains("--format <FORMAT>"))
        .stdout(predicate::str::contains("TMA_FUNCTION"));
}

#[test]
fn test_pid_and_command_mutual_exclusion() {
    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("tmaprobe");
    cmd.arg("-p").arg("1234").arg("--").arg("echo").arg("test");

    cmd.assert()
        .failure()
        .stderr(predicate::str::contains("Cannot specify both"));
}

#[test]
fn test_no_command_no_pid() {
    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("tmaprobe");

    cmd.assert().failure().stderr(predicate::str::contains(
        "Must specify either -p PID or command",
    ));
}

#[test]
fn test_invalid_pid() {
    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("tmaprobe");
    cmd.arg("-p").arg("not_a_number");

    cmd.assert()
        .failure()
        .stderr(predicate::str::contains("invalid digit found in string"));
}

#[test]
fn test_nonexistent_pid() {
    // PID 99999999 is above the kernel's pid_max
    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("tmaprobe");
    cmd.arg("-p").arg("99999999");

    cmd.assert()
        .failure()
        .stderr(predicate::str::contains("Failed to attach"));
}

#[test]
fn test_invalid_format() {
    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("tmaprobe");
    cmd.args(["--format", "xml", "-p", "1"]);

    cmd.assert().failure().stderr(predicate::str::contains("xml"));
}

#[test]
fn test_unlaunchable_command_fails() {
    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("tmaprobe");
    cmd.args(["--", "/nonexistent/tmaprobe-target"]);

    cmd.assert().failure();
}

#[test]
fn test_binary_is_gated_like_the_ptrace_backend() {
    let gate = r#"all(target_os = "linux", target_arch = "x86_64")"#;
    let lib = include_str!("../src/lib.rs");
    let main = include_str!("../src/main.rs");
    assert!(lib.contains(&format!("#[cfg({gate})]\npub mod ptrace_backend;")));
    assert!(main.starts_with(&format!("#[cfg(not({gate}))]\ncompile_error!")));
}

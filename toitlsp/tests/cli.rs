//! CLI smoke tests.

use assert_cmd::Command;
use predicates::prelude::*;

fn toitlsp() -> Command {
    Command::cargo_bin("toitlsp").unwrap()
}

#[test]
fn shows_help() {
    toitlsp()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("serve"))
        .stdout(predicate::str::contains("analyze"))
        .stdout(predicate::str::contains("repro"));
}

#[test]
fn shows_version() {
    toitlsp()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains(env!("CARGO_PKG_VERSION")));
}

#[test]
fn analyze_requires_files() {
    toitlsp()
        .args(["analyze", "--toitc", "/nonexistent/toitc"])
        .assert()
        .failure();
}

#[test]
fn analyze_with_a_missing_compiler_exits_nonzero() {
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("main.toit");
    std::fs::write(&file, "main:").unwrap();
    toitlsp()
        .args(["analyze", "--toitc", "/nonexistent/toitc"])
        .arg(&file)
        .assert()
        .failure();
}

#[test]
fn repro_serve_rejects_a_missing_archive() {
    toitlsp()
        .args(["repro", "serve", "/nonexistent/archive.tar"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("failed to open"));
}

//! Black-box tests against the compiled binary, covering only the parts of
//! the CLI surface that never touch the network: argument parsing and the
//! fail-fast path when required environment state is absent.

use assert_cmd::Command;
use predicates::str::contains;

fn cmd() -> Command {
    Command::cargo_bin("gitops-promotion").unwrap()
}

#[test]
fn help_lists_every_verb() {
    cmd()
        .arg("--help")
        .assert()
        .success()
        .stdout(contains("new"))
        .stdout(contains("promote"))
        .stdout(contains("status"))
        .stdout(contains("feature"))
        .stdout(contains("feature-delete-stale"));
}

#[test]
fn missing_provider_flag_is_a_usage_error() {
    cmd()
        .arg("promote")
        .assert()
        .failure()
        .stderr(contains("--provider"));
}

#[test]
fn missing_remote_url_env_var_fails_before_any_network_call() {
    cmd()
        .env_remove("AZDO_URL")
        .args(["--provider", "azdo", "promote"])
        .assert()
        .failure()
        .code(1)
        .stderr(contains("Application failed with error"))
        .stderr(contains("AZDO_URL"));
}

use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;

#[test]
fn test_help_shows_all_commands() {
    cargo_bin_cmd!("adbrief")
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("chat"))
        .stdout(predicate::str::contains("proxy"))
        .stdout(predicate::str::contains("docs"))
        .stdout(predicate::str::contains("--config"));
}

#[test]
fn test_docs_help_shows_subcommands() {
    cargo_bin_cmd!("adbrief")
        .args(["docs", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("show"))
        .stdout(predicate::str::contains("lock"))
        .stdout(predicate::str::contains("unlock"));
}

#[test]
fn test_proxy_help_shows_target() {
    cargo_bin_cmd!("adbrief")
        .args(["proxy", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("--target"));
}

#[test]
fn test_version_flag() {
    cargo_bin_cmd!("adbrief")
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("0.1"));
}

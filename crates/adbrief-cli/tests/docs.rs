use std::fs;

use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use tempfile::tempdir;

#[test]
fn test_docs_lock_then_show() {
    let dir = tempdir().unwrap();
    fs::write(
        dir.path().join("documents.json"),
        r#"{"brief": {"fields": {"objective": "Drive trial"}, "locked": false}}"#,
    )
    .unwrap();

    cargo_bin_cmd!("adbrief")
        .env("ADBRIEF_HOME", dir.path())
        .env_remove("ADBRIEF_CONFIG")
        .args(["docs", "lock", "brief"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Locked section 'brief'"));

    cargo_bin_cmd!("adbrief")
        .env("ADBRIEF_HOME", dir.path())
        .env_remove("ADBRIEF_CONFIG")
        .args(["docs", "show", "brief"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"locked\": true"))
        .stdout(predicate::str::contains("Drive trial"));
}

#[test]
fn test_docs_show_unknown_section_fails() {
    let dir = tempdir().unwrap();

    cargo_bin_cmd!("adbrief")
        .env("ADBRIEF_HOME", dir.path())
        .env_remove("ADBRIEF_CONFIG")
        .args(["docs", "show", "missing"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("not found"));
}

#[test]
fn test_docs_show_empty_store() {
    let dir = tempdir().unwrap();

    cargo_bin_cmd!("adbrief")
        .env("ADBRIEF_HOME", dir.path())
        .env_remove("ADBRIEF_CONFIG")
        .args(["docs", "show"])
        .assert()
        .success()
        .stdout(predicate::str::contains("{}"));
}

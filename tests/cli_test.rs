//! End-to-end CLI tests against the real binary

mod common;

use assert_cmd::Command;
use common::FixtureRepo;
use predicates::prelude::*;

fn codectx() -> Command {
    Command::cargo_bin("codectx").expect("binary builds")
}

#[test]
fn test_help_lists_subcommands() {
    codectx()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("index"))
        .stdout(predicate::str::contains("query"))
        .stdout(predicate::str::contains("stats"))
        .stdout(predicate::str::contains("clear"));
}

#[test]
fn test_index_then_query_end_to_end() {
    let repo = FixtureRepo::new();

    codectx()
        .args(["--root"])
        .arg(repo.root())
        .args(["--quiet", "index", "--mode", "full"])
        .assert()
        .success()
        .stdout(predicate::str::contains("indexed:"));

    let output = codectx()
        .args(["--root"])
        .arg(repo.root())
        .args(["--quiet", "query", "how is the checksum computed?", "--json"])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();

    let response: serde_json::Value = serde_json::from_slice(&output).expect("valid JSON");
    let selected = response["package"]["selected_chunks"]
        .as_array()
        .expect("selected_chunks array");
    assert!(!selected.is_empty(), "query returned context");
    assert!(response["package"]["total_tokens"].as_u64().unwrap() > 0);
}

#[test]
fn test_query_honours_named_file() {
    let repo = FixtureRepo::new();

    codectx()
        .args(["--root"])
        .arg(repo.root())
        .args(["--quiet", "index", "--mode", "full"])
        .assert()
        .success();

    let output = codectx()
        .args(["--root"])
        .arg(repo.root())
        .args(["--quiet", "query", "what does beta.rs do?", "--json"])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();

    let response: serde_json::Value = serde_json::from_slice(&output).expect("valid JSON");
    let files: Vec<&str> = response["package"]["selected_chunks"]
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|c| c["file_path"].as_str())
        .collect();
    assert!(
        files.contains(&"beta.rs"),
        "critical file included, got {files:?}"
    );
}

#[test]
fn test_stats_json_shape() {
    let repo = FixtureRepo::new();

    codectx()
        .args(["--root"])
        .arg(repo.root())
        .args(["--quiet", "index", "--mode", "full"])
        .assert()
        .success();

    let output = codectx()
        .args(["--root"])
        .arg(repo.root())
        .args(["stats", "--json"])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();

    let stats: serde_json::Value = serde_json::from_slice(&output).expect("valid JSON");
    assert!(stats["chunks"].as_u64().unwrap() > 0);
    assert_eq!(stats["files"].as_u64().unwrap(), 3);
    assert_eq!(stats["dimension"].as_u64().unwrap(), 384);
}

#[test]
fn test_clear_removes_index() {
    let repo = FixtureRepo::new();

    codectx()
        .args(["--root"])
        .arg(repo.root())
        .args(["--quiet", "index", "--mode", "full"])
        .assert()
        .success();

    codectx()
        .args(["--root"])
        .arg(repo.root())
        .arg("clear")
        .assert()
        .success();

    // Querying an empty index is a user-visible failure, not a crash
    codectx()
        .args(["--root"])
        .arg(repo.root())
        .args(["query", "anything"])
        .assert()
        .failure();
}

#[test]
fn test_invalid_config_exits_with_code_2() {
    let repo = FixtureRepo::new();
    repo.write(".codectx.toml", "[pool]\nmax_fraction = 2.5\n");

    codectx()
        .args(["--root"])
        .arg(repo.root())
        .args(["index", "--mode", "full"])
        .assert()
        .code(2);
}

#[test]
fn test_invalid_mode_fails() {
    let repo = FixtureRepo::new();
    codectx()
        .args(["--root"])
        .arg(repo.root())
        .args(["index", "--mode", "sideways"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("invalid --mode"));
}

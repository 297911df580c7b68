//! Binary-level CLI tests against the real `section-loop` executable
//! (spec §6): exit codes and stderr for missing/invalid arguments, where
//! no scheduler run (and therefore no agent subprocess) is ever reached.

use assert_cmd::Command;
use predicates::prelude::*;

#[test]
fn missing_required_args_exits_one() {
    Command::cargo_bin("section-loop")
        .unwrap()
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("required arguments were not provided"));
}

#[test]
fn nonexistent_planspace_exits_one() {
    let dir = tempfile::tempdir().unwrap();
    let codespace = dir.path().join("codespace");
    std::fs::create_dir(&codespace).unwrap();
    let proposal = dir.path().join("proposal.md");
    let alignment = dir.path().join("alignment.md");
    std::fs::write(&proposal, "proposal").unwrap();
    std::fs::write(&alignment, "alignment").unwrap();

    Command::cargo_bin("section-loop")
        .unwrap()
        .current_dir(dir.path())
        .args([
            "missing-planspace",
            "codespace",
            "--global-proposal",
            proposal.to_str().unwrap(),
            "--global-alignment",
            alignment.to_str().unwrap(),
        ])
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("is not a directory"));
}

#[test]
fn event_log_subcommand_forwards_to_the_embedded_store() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("run.db");

    Command::cargo_bin("section-loop")
        .unwrap()
        .args(["event-log", "--db", db.to_str().unwrap(), "init"])
        .assert()
        .success()
        .stdout(predicate::str::contains("initialized"));
}

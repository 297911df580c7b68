//! Binary-level CLI tests: exercises the real `eventlog` executable
//! against a throwaway db file, not the library in-process.

use assert_cmd::Command;
use predicates::prelude::*;

fn eventlog(db: &std::path::Path) -> Command {
    let mut cmd = Command::cargo_bin("eventlog").unwrap();
    cmd.arg("--db").arg(db);
    cmd
}

#[test]
fn init_register_send_recv_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("run.db");

    eventlog(&db).arg("init").assert().success().stdout(predicate::str::contains("initialized"));
    eventlog(&db).args(["register", "section-01"]).assert().success();
    eventlog(&db).args(["send", "section-01", "--from", "scheduler", "hello"]).assert().success();
    eventlog(&db)
        .args(["recv", "section-01", "--timeout", "1"])
        .assert()
        .success()
        .stdout(predicate::str::contains("hello"));
}

#[test]
fn recv_times_out_with_exit_code_one() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("run.db");

    eventlog(&db).args(["register", "empty"]).assert().success();
    eventlog(&db)
        .args(["recv", "empty", "--timeout", "1"])
        .assert()
        .failure()
        .code(1)
        .stdout(predicate::str::contains("TIMEOUT"));
}

#[test]
fn drain_returns_pending_messages_then_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("run.db");

    eventlog(&db).args(["send", "box", "a"]).assert().success();
    eventlog(&db).args(["send", "box", "b"]).assert().success();
    eventlog(&db)
        .args(["drain", "box"])
        .assert()
        .success()
        .stdout(predicate::str::diff("a\nb\n"));
    eventlog(&db).args(["drain", "box"]).assert().success().stdout(predicate::str::diff(""));
}

#[test]
fn log_then_query_reports_the_tagged_event() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("run.db");

    eventlog(&db).args(["log", "summary", "--tag", "proposal:01", "wrote integration proposal"]).assert().success();
    eventlog(&db)
        .args(["query", "--kind", "summary", "--tag", "proposal:01"])
        .assert()
        .success()
        .stdout(predicate::str::contains("wrote integration proposal"));
}

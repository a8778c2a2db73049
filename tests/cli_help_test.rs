// CLI surface tests for the workflow-orchestrator binary

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

fn orchestrator(dir: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("workflow-orchestrator").unwrap();
    cmd.current_dir(dir.path()).env("RUST_LOG", "off");
    cmd
}

#[test]
fn test_help_lists_subcommands() {
    let dir = TempDir::new().unwrap();
    orchestrator(&dir)
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("config"))
        .stdout(predicate::str::contains("approval"))
        .stdout(predicate::str::contains("timer"))
        .stdout(predicate::str::contains("serve"));
}

#[test]
fn test_config_show_prints_default_deadlines() {
    let dir = TempDir::new().unwrap();
    orchestrator(&dir)
        .args(["config", "show"])
        .assert()
        .success()
        .stdout(predicate::str::contains("process_deadline_seconds = 86400"))
        .stdout(predicate::str::contains("task_deadline_seconds = 259200"));
}

#[test]
fn test_config_init_refuses_to_overwrite() {
    let dir = TempDir::new().unwrap();
    orchestrator(&dir)
        .args(["config", "init"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Wrote default configuration"));
    assert!(dir.path().join("workflow-orchestrator.toml").exists());

    orchestrator(&dir)
        .args(["config", "init"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("already exists"));

    orchestrator(&dir)
        .args(["config", "init", "--force"])
        .assert()
        .success();
}

#[test]
fn test_approval_simulate_reports_outcome() {
    let dir = TempDir::new().unwrap();
    orchestrator(&dir)
        .args([
            "approval",
            "simulate",
            "--approver",
            "alice",
            "--approver",
            "bob",
            "--require-all",
            "--vote",
            "alice=approve:fine by me",
            "--vote",
            "bob=approve",
        ])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"status\": \"approved\""))
        .stdout(predicate::str::contains("fine by me"));
}

#[test]
fn test_approval_simulate_rejects_bad_vote() {
    let dir = TempDir::new().unwrap();
    orchestrator(&dir)
        .args(["approval", "simulate", "--approver", "alice", "--vote", "alice=perhaps"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("unknown decision"));
}

#[test]
fn test_serve_runs_commands_and_cancels_runs_at_end_of_input() {
    let dir = TempDir::new().unwrap();
    let input = [
        r#"{"op":"deploy_definition","id":1,"key":"order"}"#,
        r#"{"op":"start_process","process_definition_key":"order","start_user_id":"dana"}"#,
        r#"{"op":"suspend"}"#,
        "",
    ]
    .join("\n");

    orchestrator(&dir)
        .arg("serve")
        .write_stdin(input)
        .assert()
        .success()
        .stdout(predicate::str::contains(r#""ok":true"#))
        .stdout(predicate::str::contains(r#""kind":"validation""#))
        .stdout(predicate::str::contains(r#""report":"process_run""#))
        .stdout(predicate::str::contains(r#""status":"cancelled""#));
}

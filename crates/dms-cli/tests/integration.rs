#![allow(deprecated)]
use assert_cmd::Command;
use predicates::prelude::*;
use std::path::Path;
use tempfile::TempDir;

const OWNER: &str = "owner@example.com";
const START: &str = "2024-01-01T00:00:00+00:00";

/// `START` plus `hours`, in the form `--now` and git both accept.
fn at(hours: u32) -> String {
    let day = 1 + hours / 24;
    let hour = hours % 24;
    assert!(day <= 31, "keep test times inside January");
    format!("2024-01-{day:02}T{hour:02}:00:00+00:00")
}

fn git(dir: &Path, args: &[&str], date: &str) {
    let status = std::process::Command::new("git")
        .args(args)
        .current_dir(dir)
        .env("GIT_CONFIG_NOSYSTEM", "1")
        .env("HOME", dir)
        .env("GIT_AUTHOR_NAME", "Owner")
        .env("GIT_AUTHOR_EMAIL", OWNER)
        .env("GIT_COMMITTER_NAME", "Owner")
        .env("GIT_COMMITTER_EMAIL", OWNER)
        .env("GIT_AUTHOR_DATE", date)
        .env("GIT_COMMITTER_DATE", date)
        .status()
        .unwrap();
    assert!(status.success(), "git {args:?} failed");
}

fn heartbeat(dir: &Path, date: &str) {
    git(
        dir,
        &[
            "-c",
            "commit.gpgsign=false",
            "commit",
            "--allow-empty",
            "-q",
            "-m",
            "heartbeat",
        ],
        date,
    );
}

/// A repository whose only commit is an owner heartbeat at `START`.
fn init_repo() -> TempDir {
    let dir = TempDir::new().unwrap();
    git(dir.path(), &["init", "-q"], START);
    heartbeat(dir.path(), START);
    dir
}

fn write_final(dir: &Path, name: &str, content: &str) {
    let emails = dir.join("emails");
    std::fs::create_dir_all(&emails).unwrap();
    std::fs::write(emails.join(name), content).unwrap();
}

fn dms(dir: &TempDir, now: &str) -> Command {
    let mut cmd = Command::cargo_bin("dead-mans-switch").unwrap();
    cmd.current_dir(dir.path())
        .env("DMS_ROOT", dir.path())
        .env("DMS_NOW", now)
        .env("HOME", dir.path())
        .env("GIT_CONFIG_NOSYSTEM", "1")
        .env("MY_EMAIL", OWNER)
        .env_remove("MY_PASSWORD")
        .env_remove("DMS_HEARTBEAT_INTERVAL_HOURS")
        .env_remove("DMS_WARNING_COUNT")
        .env_remove("DMS_ARMED")
        .env_remove("DMS_OUTBOX_DIR")
        .env_remove("GITHUB_REPOSITORY");
    cmd
}

fn marker_count(dir: &Path) -> usize {
    let out = std::process::Command::new("git")
        .args(["log", "--format=%an"])
        .current_dir(dir)
        .output()
        .unwrap();
    String::from_utf8_lossy(&out.stdout)
        .lines()
        .filter(|author| *author == "dms_bot")
        .count()
}

fn outbox_files(dir: &Path) -> Vec<String> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut files: Vec<String> = entries
        .filter_map(|e| e.ok())
        .filter(|e| e.path().extension().is_some_and(|ext| ext == "eml"))
        .map(|e| std::fs::read_to_string(e.path()).unwrap())
        .collect();
    files.sort();
    files
}

// ---------------------------------------------------------------------------
// Evaluation
// ---------------------------------------------------------------------------

#[test]
fn quiet_repository_does_nothing() {
    let dir = init_repo();
    dms(&dir, &at(10))
        .args(["168", "2", "--armed", "--json"])
        .assert()
        .success()
        .stdout(predicate::str::contains(r#""action": "none""#))
        .stdout(predicate::str::contains(r#""previous": "active""#));
    assert_eq!(marker_count(dir.path()), 0);
}

#[test]
fn human_output_shows_state_and_action() {
    let dir = init_repo();
    dms(&dir, &at(10))
        .args(["168", "2"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Mode:"))
        .stdout(predicate::str::contains("test"))
        .stdout(predicate::str::contains("active -> active"))
        .stdout(predicate::str::contains("168 hours inactive"));
}

#[test]
fn interval_below_a_day_is_rejected() {
    let dir = init_repo();
    dms(&dir, &at(10))
        .args(["12", "2"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("at least 24 hours"));
}

#[test]
fn bad_environment_value_is_rejected() {
    let dir = init_repo();
    dms(&dir, &at(10))
        .env("DMS_WARNING_COUNT", "two")
        .assert()
        .failure()
        .stderr(predicate::str::contains("DMS_WARNING_COUNT"));
}

#[test]
fn config_file_supplies_defaults() {
    let dir = init_repo();
    std::fs::create_dir_all(dir.path().join(".dms")).unwrap();
    std::fs::write(
        dir.path().join(".dms/config.yaml"),
        "heartbeat_interval_hours: 24\nwarning_count: 1\n",
    )
    .unwrap();
    dms(&dir, &at(30))
        .args(["--dry-run", "--json"])
        .assert()
        .success()
        .stdout(predicate::str::contains(r#""action": "send-warning""#))
        .stdout(predicate::str::contains(r#""heartbeat_interval_hours": 24"#));
}

#[test]
fn directory_without_history_fails() {
    let dir = TempDir::new().unwrap();
    git(dir.path(), &["init", "-q"], START);
    dms(&dir, &at(10))
        .args(["168", "2"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("has no commits"));
}

// ---------------------------------------------------------------------------
// Escalation
// ---------------------------------------------------------------------------

#[test]
fn ladder_writes_one_marker_per_step() {
    let dir = init_repo();
    let outbox = TempDir::new().unwrap();
    write_final(
        dir.path(),
        "friend.txt",
        "To: friend@example.com\nSubject: Goodbye\n\nThank you for everything.\n",
    );

    let steps = [
        (170, "send-warning", 1),
        (200, "none", 1),
        (340, "send-warning", 2),
        (510, "send-final", 3),
        (600, "none", 3),
    ];
    for (hours, action, markers) in steps {
        dms(&dir, &at(hours))
            .args(["168", "2", "--armed", "--json", "--outbox"])
            .arg(outbox.path())
            .assert()
            .success()
            .stdout(predicate::str::contains(format!(r#""action": "{action}""#)));
        assert_eq!(marker_count(dir.path()), markers, "after hour {hours}");
    }

    let sent = outbox_files(outbox.path());
    assert_eq!(sent.len(), 3);
    assert_eq!(sent.iter().filter(|m| m.contains("To: owner@example.com")).count(), 2);
    assert_eq!(sent.iter().filter(|m| m.contains("To: friend@example.com")).count(), 1);
}

#[test]
fn heartbeat_after_warning_resets() {
    let dir = init_repo();
    let outbox = TempDir::new().unwrap();
    dms(&dir, &at(170))
        .args(["168", "2", "--armed", "--outbox"])
        .arg(outbox.path())
        .assert()
        .success();
    assert_eq!(marker_count(dir.path()), 1);

    heartbeat(dir.path(), &at(200));
    dms(&dir, &at(300))
        .args(["168", "2", "--armed", "--json", "--outbox"])
        .arg(outbox.path())
        .assert()
        .success()
        .stdout(predicate::str::contains(r#""reset": true"#))
        .stdout(predicate::str::contains(r#""action": "none""#));
    assert_eq!(marker_count(dir.path()), 1);
}

#[test]
fn test_mode_only_mails_the_operator() {
    let dir = init_repo();
    let outbox = TempDir::new().unwrap();
    write_final(
        dir.path(),
        "friend.txt",
        "To: friend@example.com\nSubject: Goodbye\n\nBye.\n",
    );
    write_final(
        dir.path(),
        "sample.example.txt",
        "To: sample@example.com\nSubject: Sample\n\nNever sent.\n",
    );

    dms(&dir, &at(30))
        .args(["24", "0", "--outbox"])
        .arg(outbox.path())
        .assert()
        .success();

    let sent = outbox_files(outbox.path());
    assert_eq!(sent.len(), 1);
    assert!(sent[0].contains("To: owner@example.com"));
    assert!(sent[0].contains("Test Email"));
    assert!(!sent[0].contains("friend@example.com"));
    assert_eq!(marker_count(dir.path()), 1);
}

#[test]
fn dry_run_sends_and_records_nothing() {
    let dir = init_repo();
    let outbox = TempDir::new().unwrap();
    dms(&dir, &at(170))
        .args(["168", "2", "--armed", "--dry-run", "--outbox"])
        .arg(outbox.path())
        .assert()
        .success()
        .stdout(predicate::str::contains("dry run"))
        .stdout(predicate::str::contains(OWNER));
    assert_eq!(marker_count(dir.path()), 0);
    assert!(outbox_files(outbox.path()).is_empty());
}

#[test]
fn final_step_without_templates_fails_without_marker() {
    let dir = init_repo();
    let outbox = TempDir::new().unwrap();
    dms(&dir, &at(30))
        .args(["24", "0", "--armed", "--outbox"])
        .arg(outbox.path())
        .assert()
        .failure()
        .stderr(predicate::str::contains("no messages rendered"));
    assert_eq!(marker_count(dir.path()), 0);
}

#[test]
fn undeliverable_recipient_fails_run_without_marker() {
    let dir = init_repo();
    let outbox = TempDir::new().unwrap();
    write_final(
        dir.path(),
        "a-friend.txt",
        "To: friend@example.com\nSubject: Goodbye\n\nBye.\n",
    );
    write_final(
        dir.path(),
        "b-typo.txt",
        "To: typo@example..com\nSubject: Goodbye\n\nBye.\n",
    );

    dms(&dir, &at(30))
        .args(["24", "0", "--armed", "--outbox"])
        .arg(outbox.path())
        .assert()
        .failure()
        .stderr(predicate::str::contains("1 of 2 deliveries failed"));
    assert_eq!(marker_count(dir.path()), 0);
    assert_eq!(outbox_files(outbox.path()).len(), 1);
}

#[test]
fn manual_dispatch_is_recorded_on_the_marker() {
    let dir = init_repo();
    let outbox = TempDir::new().unwrap();
    dms(&dir, &at(170))
        .args(["168", "2", "--armed", "--manual-dispatch", "--outbox"])
        .arg(outbox.path())
        .assert()
        .success();

    let out = std::process::Command::new("git")
        .args(["log", "-1", "--format=%B"])
        .current_dir(dir.path())
        .output()
        .unwrap();
    let message = String::from_utf8_lossy(&out.stdout);
    assert!(message.contains("Dms-Trigger: manual"), "{message}");
}

use std::path::{Path, PathBuf};

use assert_cmd::Command;
use predicates::prelude::*;

fn opsd(config: &Path) -> Command {
    let mut cmd = Command::cargo_bin("opsd").unwrap();
    cmd.env_remove("DATABASE_URL")
        .env_remove("SLACK_BOT_TOKEN")
        .env_remove("RUST_LOG")
        .arg("--config")
        .arg(config);
    cmd
}

fn write_config(dir: &Path, extra: &str) -> PathBuf {
    let root = dir.display();
    let path = dir.join("config.toml");
    let body = format!(
        "database_url = \"sqlite:///{root}/missing.db\"\n\
         backup_dir = \"{root}/backups\"\n\
         log_dir = \"{root}/logs\"\n\
         feedback_store_dir = \"{root}/feedback\"\n\
         {extra}\n"
    );
    std::fs::write(&path, body).unwrap();
    path
}

#[test]
fn once_with_unknown_job_lists_known_jobs() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = write_config(dir.path(), "");
    opsd(&cfg)
        .args(["--once", "reindex"])
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("unknown job \"reindex\""))
        .stderr(predicate::str::contains("health_check, db_backup, feedback_check"));
}

#[test]
fn once_with_failing_job_exits_one() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = write_config(dir.path(), "");
    opsd(&cfg)
        .args(["--once", "db_backup"])
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("source database not found"));
    assert!(!dir.path().join("backups").join(".backup.lock").exists());
}

#[test]
fn once_with_healthy_job_exits_zero() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = write_config(dir.path(), "");
    opsd(&cfg).args(["--once", "feedback_check"]).assert().success();
    assert!(dir.path().join("logs").is_dir());
}

#[test]
fn invalid_config_exits_before_running() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = write_config(dir.path(), "monitor_interval_minutes = 0");
    opsd(&cfg)
        .args(["--once", "feedback_check"])
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("invalid configuration"));
}

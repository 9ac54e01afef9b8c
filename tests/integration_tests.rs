//! CLI integration tests for uplift.

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use std::fs;
use tempfile::TempDir;

/// An uplift command with secrets and overrides scrubbed from the environment.
fn uplift() -> Command {
    let mut cmd = cargo_bin_cmd!("uplift");
    for var in [
        "GITHUB_TOKEN",
        "GROQ_API_KEY",
        "UPLIFT_REWRITE_API_KEY",
        "UPLIFT_REWRITE_API_URL",
        "UPLIFT_REWRITE_MODEL",
        "UPLIFT_DETECTOR_COMMAND",
        "UPLIFT_PORT",
        "RUST_LOG",
    ] {
        cmd.env_remove(var);
    }
    cmd
}

fn init_project(dir: &TempDir) {
    uplift()
        .current_dir(dir.path())
        .arg("init")
        .assert()
        .success();
}

mod cli_basics {
    use super::*;

    #[test]
    fn test_help_lists_subcommands() {
        uplift()
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("update"))
            .stdout(predicate::str::contains("serve"))
            .stdout(predicate::str::contains("history"));
    }

    #[test]
    fn test_version() {
        uplift()
            .arg("--version")
            .assert()
            .success()
            .stdout(predicate::str::contains("uplift"));
    }

    #[test]
    fn test_unknown_subcommand_fails() {
        uplift().arg("frobnicate").assert().failure();
    }
}

mod init {
    use super::*;

    #[test]
    fn test_init_creates_config_and_database() {
        let dir = TempDir::new().unwrap();

        uplift()
            .current_dir(dir.path())
            .arg("init")
            .assert()
            .success()
            .stdout(predicate::str::contains("Wrote default config"))
            .stdout(predicate::str::contains("Status database initialized"));

        assert!(dir.path().join(".uplift/uplift.toml").exists());
        assert!(dir.path().join(".uplift/uplift.db").exists());

        let config = fs::read_to_string(dir.path().join(".uplift/uplift.toml")).unwrap();
        assert!(config.contains("[publish]"));
        assert!(config.contains("base_branch = \"main\""));
    }

    #[test]
    fn test_init_is_idempotent() {
        let dir = TempDir::new().unwrap();
        init_project(&dir);

        uplift()
            .current_dir(dir.path())
            .arg("init")
            .assert()
            .success()
            .stdout(predicate::str::contains("Config already exists"));
    }

    #[test]
    fn test_init_custom_db_path() {
        let dir = TempDir::new().unwrap();
        uplift()
            .current_dir(dir.path())
            .args(["init", "--db-path", "data/runs.db"])
            .assert()
            .success();
        assert!(dir.path().join("data/runs.db").exists());
    }
}

mod history {
    use super::*;

    #[test]
    fn test_history_without_database() {
        let dir = TempDir::new().unwrap();
        uplift()
            .current_dir(dir.path())
            .arg("history")
            .assert()
            .success()
            .stdout(predicate::str::contains("No runs recorded yet"));
    }

    #[test]
    fn test_history_after_init_is_empty() {
        let dir = TempDir::new().unwrap();
        init_project(&dir);
        uplift()
            .current_dir(dir.path())
            .arg("history")
            .assert()
            .success()
            .stdout(predicate::str::contains("No runs recorded yet."));
    }

    #[test]
    fn test_history_unknown_run_fails() {
        let dir = TempDir::new().unwrap();
        init_project(&dir);
        uplift()
            .current_dir(dir.path())
            .args(["history", "--run", "does-not-exist"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("not found"));
    }
}

mod config {
    use super::*;

    #[test]
    fn test_config_prints_effective_values_with_secrets_redacted() {
        let dir = TempDir::new().unwrap();
        uplift()
            .current_dir(dir.path())
            .env("GITHUB_TOKEN", "ghp_supersecret")
            .arg("config")
            .assert()
            .success()
            .stdout(predicate::str::contains("[server]"))
            .stdout(predicate::str::contains("port = 5000"))
            .stdout(predicate::str::contains("github.token    = <redacted>"))
            .stdout(predicate::str::contains("rewrite.api_key = <unset>"))
            .stdout(predicate::str::contains("ghp_supersecret").not());
    }

    #[test]
    fn test_config_reads_explicit_file() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("custom.toml"), "[server]\nport = 6123\n").unwrap();
        uplift()
            .current_dir(dir.path())
            .args(["--config", "custom.toml", "config"])
            .assert()
            .success()
            .stdout(predicate::str::contains("port = 6123"));
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("bad.toml"), "[publish]\npr_attempts = 0\n").unwrap();
        uplift()
            .current_dir(dir.path())
            .args(["--config", "bad.toml", "config"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("pr_attempts"));
    }
}

mod update {
    use super::*;

    #[test]
    fn test_update_requires_owner_for_non_github_urls() {
        let dir = TempDir::new().unwrap();
        uplift()
            .current_dir(dir.path())
            .args(["update", "/srv/git/site.git"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("--owner"));
    }
}

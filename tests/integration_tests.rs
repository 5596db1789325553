//! Integration tests for the berth CLI.

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use std::fs;
use tempfile::TempDir;

/// A berth command isolated from the caller's environment.
fn berth(dir: &TempDir) -> Command {
    let mut cmd = cargo_bin_cmd!("berth");
    cmd.current_dir(dir.path())
        .env_remove("BERTH_CONFIG")
        .env_remove("BERTH_BIND")
        .env_remove("BERTH_STORAGE_ROOT")
        .env_remove("BERTH_IMAGE")
        .env_remove("BERTH_INTERNAL_PORT")
        .env_remove("BERTH_MEMORY")
        .env_remove("BERTH_CPUS")
        .env_remove("BERTH_LOG_LEVEL");
    cmd
}

mod cli_basics {
    use super::*;

    #[test]
    fn test_help_lists_commands() {
        let dir = TempDir::new().unwrap();
        berth(&dir)
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("serve"))
            .stdout(predicate::str::contains("config"))
            .stdout(predicate::str::contains("token"));
    }

    #[test]
    fn test_version() {
        let dir = TempDir::new().unwrap();
        berth(&dir).arg("--version").assert().success();
    }

    #[test]
    fn test_unknown_command_fails() {
        let dir = TempDir::new().unwrap();
        berth(&dir).arg("launch").assert().failure();
    }
}

mod token {
    use super::*;

    #[test]
    fn test_token_hash_prints_sha256_hex() {
        let dir = TempDir::new().unwrap();
        berth(&dir)
            .args(["token", "hash", "test"])
            .assert()
            .success()
            .stdout(
                "9f86d081884c7d659a2feaa0c55ad015a3bf4f1b2b0b822cd15d6c15b0f00a08\n",
            );
    }
}

mod config {
    use super::*;

    #[test]
    fn test_config_init_writes_defaults() {
        let dir = TempDir::new().unwrap();
        berth(&dir)
            .args(["config", "init"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Wrote default configuration"));

        let content = fs::read_to_string(dir.path().join("berth.toml")).unwrap();
        assert!(content.contains("[server]"));
        assert!(content.contains("127.0.0.1:7420"));
    }

    #[test]
    fn test_config_init_refuses_to_overwrite() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("berth.toml"), "# mine\n").unwrap();
        berth(&dir)
            .args(["config", "init"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("already exists"));
        assert_eq!(
            fs::read_to_string(dir.path().join("berth.toml")).unwrap(),
            "# mine\n"
        );

        berth(&dir).args(["config", "init", "--force"]).assert().success();
        let content = fs::read_to_string(dir.path().join("berth.toml")).unwrap();
        assert!(content.contains("[server]"));
    }

    #[test]
    fn test_config_validate_default_file() {
        let dir = TempDir::new().unwrap();
        berth(&dir).args(["config", "init"]).assert().success();
        berth(&dir)
            .args(["config", "validate"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Configuration is valid"));
    }

    #[test]
    fn test_config_validate_reports_problems() {
        let dir = TempDir::new().unwrap();
        fs::write(
            dir.path().join("berth.toml"),
            r#"
[server]
bind = "nowhere"

[container]
memory = "lots"
"#,
        )
        .unwrap();
        berth(&dir)
            .args(["config", "validate"])
            .assert()
            .failure()
            .stdout(predicate::str::contains("server.bind"))
            .stdout(predicate::str::contains("container.memory"));
    }

    #[test]
    fn test_config_validate_rejects_bad_toml() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("berth.toml"), "[server\n").unwrap();
        berth(&dir).args(["config", "validate"]).assert().failure();
    }

    #[test]
    fn test_config_show_redacts_repo_tokens() {
        let dir = TempDir::new().unwrap();
        fs::write(
            dir.path().join("custom.toml"),
            r#"
[[workspaces]]
id = "w1"
repo_url = "https://example.com/repo.git"
repo_token = "secret-value"
"#,
        )
        .unwrap();
        berth(&dir)
            .args(["--config", "custom.toml", "config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("custom.toml"))
            .stdout(predicate::str::contains("w1"))
            .stdout(predicate::str::contains("secret-value").not());
    }

    #[test]
    fn test_config_show_applies_env_overrides() {
        let dir = TempDir::new().unwrap();
        berth(&dir)
            .env("BERTH_IMAGE", "registry.local/dev:42")
            .args(["config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("No config file"))
            .stdout(predicate::str::contains("registry.local/dev:42"));
    }

    #[test]
    fn test_config_path_from_env() {
        let dir = TempDir::new().unwrap();
        berth(&dir)
            .env("BERTH_CONFIG", "nested/berth.toml")
            .args(["config", "init"])
            .assert()
            .success();
        assert!(dir.path().join("nested/berth.toml").exists());
    }
}

mod serve {
    use super::*;

    #[test]
    fn test_serve_rejects_bad_bind() {
        let dir = TempDir::new().unwrap();
        berth(&dir)
            .args(["serve", "--bind", "not-an-address"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Invalid bind address"));
    }
}

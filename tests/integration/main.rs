//! Integration tests for conbuilder
//!
//! None of these need root: they stop before anything is mounted or run in
//! a container.

mod cli_tests {
    use assert_cmd::{cargo::cargo_bin_cmd, Command};
    use predicates::prelude::*;
    use std::path::{Path, PathBuf};
    use tempfile::TempDir;

    fn conbuilder() -> Command {
        cargo_bin_cmd!("conbuilder")
    }

    /// Config file pointing the cache into `dir`
    fn config_in(dir: &Path) -> PathBuf {
        let path = dir.join("config.toml");
        let content = format!(
            "[store]\ncache_dir = \"{}\"\n\n[build]\nexport_dir = \"{}\"\n",
            dir.join("cache").display(),
            dir.join("out").display()
        );
        std::fs::write(&path, content).unwrap();
        path
    }

    fn with_config(dir: &Path) -> Command {
        let mut cmd = conbuilder();
        cmd.env("CONBUILDER_CONFIG", config_in(dir)).env("CI", "1");
        cmd
    }

    #[test]
    fn help_displays() {
        conbuilder()
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("cached overlay layers"))
            .stdout(predicate::str::contains("purge"));
    }

    #[test]
    fn version_displays() {
        conbuilder()
            .arg("--version")
            .assert()
            .success()
            .stdout(predicate::str::contains("conbuilder"));
    }

    #[test]
    fn config_path_honours_flag() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("custom.toml");
        conbuilder()
            .args(["config", "path", "--config"])
            .arg(&path)
            .assert()
            .success()
            .stdout(predicate::str::contains("custom.toml"));
    }

    #[test]
    fn config_init_then_show() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("nested").join("config.toml");

        conbuilder()
            .env("CONBUILDER_CONFIG", &path)
            .env("CI", "1")
            .args(["config", "init"])
            .assert()
            .success();
        assert!(path.exists());

        conbuilder()
            .env("CONBUILDER_CONFIG", &path)
            .args(["config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("[environment]"))
            .stdout(predicate::str::contains("codename = \"sid\""));
    }

    #[test]
    fn config_set_persists() {
        let temp = TempDir::new().unwrap();
        with_config(temp.path())
            .args(["config", "set", "eviction.build.max_count", "3"])
            .assert()
            .success();

        let content = std::fs::read_to_string(temp.path().join("config.toml")).unwrap();
        assert!(content.contains("max_count = 3"));
    }

    #[test]
    fn config_set_unknown_key_fails() {
        let temp = TempDir::new().unwrap();
        with_config(temp.path())
            .args(["config", "set", "container.image", "debian"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Unknown config key"));
    }

    #[test]
    fn invalid_cache_dir_is_rejected() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("config.toml");
        std::fs::write(&path, "[store]\ncache_dir = \"/\"\n").unwrap();

        conbuilder()
            .env("CONBUILDER_CONFIG", &path)
            .arg("show")
            .assert()
            .failure()
            .stderr(predicate::str::contains("Invalid configuration"))
            .stderr(predicate::str::contains("cache_dir"));
    }

    #[test]
    fn empty_codename_is_rejected() {
        let temp = TempDir::new().unwrap();
        with_config(temp.path())
            .args(["show", "--codename", " "])
            .assert()
            .failure()
            .stderr(predicate::str::contains("codename"));
    }

    #[test]
    fn show_empty_store() {
        let temp = TempDir::new().unwrap();
        with_config(temp.path())
            .arg("show")
            .assert()
            .success()
            .stdout(predicate::str::contains("No layers found"));
        assert!(temp.path().join("cache").join("layers").is_dir());
    }

    #[test]
    fn show_json_is_parseable() {
        let temp = TempDir::new().unwrap();
        let output = with_config(temp.path())
            .args(["show", "--format", "json"])
            .output()
            .unwrap();
        assert!(output.status.success());

        let report: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
        assert_eq!(report["layers"].as_array().unwrap().len(), 0);
        assert_eq!(report["mounts"].as_array().unwrap().len(), 0);
    }

    #[test]
    fn purge_empty_store() {
        let temp = TempDir::new().unwrap();
        with_config(temp.path())
            .args(["purge", "--dry-run"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Nothing to purge"));
    }

    #[test]
    fn build_rejects_unknown_capability() {
        let temp = TempDir::new().unwrap();
        with_config(temp.path())
            .args(["build", "--source"])
            .arg(temp.path())
            .args(["--allow-cap", "CAP_TIME_TRAVEL"])
            .assert()
            .failure()
            .code(1)
            .stderr(predicate::str::contains("unknown capability"));
    }

    #[test]
    fn install_missing_package_fails() {
        let temp = TempDir::new().unwrap();
        with_config(temp.path())
            .args(["install", "does-not-exist.deb"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Path not found"));
    }

    #[test]
    fn install_requires_packages() {
        conbuilder()
            .arg("install")
            .assert()
            .failure()
            .stderr(predicate::str::contains("Usage"));
    }
}

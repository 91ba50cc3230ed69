//! Config command - show or edit configuration

use crate::cli::args::{ConfigAction, ConfigArgs};
use crate::config::{Config, ConfigManager};
use crate::error::{ConbuilderError, ConbuilderResult};
use crate::ui::{self, UiContext};
use std::path::PathBuf;

const VALID_KEYS: &[&str] = &[
    "general.log_format",
    "store.cache_dir",
    "store.unmount_retries",
    "store.unmount_retry_delay_ms",
    "environment.codename",
    "environment.mirror",
    "environment.include",
    "build.export_dir",
    "build.output_dir",
    "build.artifact_extensions",
    "build.auto_evict",
    "eviction.build.max_age_days",
    "eviction.build.max_count",
    "eviction.dependencies.max_age_days",
    "eviction.dependencies.max_count",
    "sandbox.network",
    "sandbox.allow_capabilities",
    "sandbox.syscall_allow",
    "sandbox.syscall_deny",
];

/// Execute the config command.
///
/// Runs before the configuration is loaded, so `path` and `init` work even
/// when the file on disk is broken.
pub async fn execute(args: ConfigArgs, manager: &ConfigManager) -> ConbuilderResult<()> {
    match args.action {
        None | Some(ConfigAction::Show) => show_config(&manager.load().await?)?,
        Some(ConfigAction::Path) => println!("{}", manager.path().display()),
        Some(ConfigAction::Init { force }) => init_config(manager, force).await?,
        Some(ConfigAction::Set { key, value }) => set_value(manager, &key, &value).await?,
    }

    Ok(())
}

fn show_config(config: &Config) -> ConbuilderResult<()> {
    println!("{}", toml::to_string_pretty(config)?);
    Ok(())
}

async fn init_config(manager: &ConfigManager, force: bool) -> ConbuilderResult<()> {
    let ctx = UiContext::detect();
    let path = manager.path();

    if path.exists() && !force {
        ui::step_warn_hint(
            &ctx,
            &format!("Config already exists at {}", path.display()),
            "Use --force to overwrite",
        );
        return Ok(());
    }

    manager.save(&Config::default()).await?;
    ui::step_ok_detail(
        &ctx,
        "Configuration initialized",
        &path.display().to_string(),
    );
    Ok(())
}

async fn set_value(manager: &ConfigManager, key: &str, value: &str) -> ConbuilderResult<()> {
    let ctx = UiContext::detect();
    let mut config = manager.load().await?;

    if let Err(e) = apply_value(&mut config, key, value) {
        if matches!(e, ConbuilderError::User(_)) && !VALID_KEYS.contains(&key) {
            ui::remark(&ctx, "Valid keys:");
            for valid in VALID_KEYS {
                eprintln!("  {}", valid);
            }
        }
        return Err(e);
    }

    manager.save(&config).await?;
    ui::step_ok(&ctx, &format!("Set {} = {}", key, value));
    Ok(())
}

/// Set one dot-separated key on `config`
fn apply_value(config: &mut Config, key: &str, value: &str) -> ConbuilderResult<()> {
    let parts: Vec<&str> = key.split('.').collect();

    match parts.as_slice() {
        ["general", "log_format"] => config.general.log_format = value.to_string(),

        ["store", "cache_dir"] => config.store.cache_dir = PathBuf::from(value),
        ["store", "unmount_retries"] => config.store.unmount_retries = parse_number(value)?,
        ["store", "unmount_retry_delay_ms"] => {
            config.store.unmount_retry_delay_ms = parse_number(value)?
        }

        ["environment", "codename"] => config.environment.codename = value.to_string(),
        ["environment", "mirror"] => config.environment.mirror = value.to_string(),
        ["environment", "include"] => config.environment.include = parse_list(value),

        ["build", "export_dir"] => config.build.export_dir = PathBuf::from(value),
        ["build", "output_dir"] => config.build.output_dir = value.to_string(),
        ["build", "artifact_extensions"] => config.build.artifact_extensions = parse_list(value),
        ["build", "auto_evict"] => config.build.auto_evict = parse_bool(value)?,

        ["eviction", "build", "max_age_days"] => {
            config.eviction.build.max_age_days = parse_number(value)?
        }
        ["eviction", "build", "max_count"] => {
            config.eviction.build.max_count = parse_number(value)?
        }
        ["eviction", "dependencies", "max_age_days"] => {
            config.eviction.dependencies.max_age_days = parse_number(value)?
        }
        ["eviction", "dependencies", "max_count"] => {
            config.eviction.dependencies.max_count = parse_number(value)?
        }

        ["sandbox", "network"] => config.sandbox.network = parse_bool(value)?,
        ["sandbox", "allow_capabilities"] => {
            config.sandbox.allow_capabilities = parse_list(value)
        }
        ["sandbox", "syscall_allow"] => config.sandbox.syscall_allow = parse_list(value),
        ["sandbox", "syscall_deny"] => config.sandbox.syscall_deny = parse_list(value),

        _ => return Err(ConbuilderError::User(format!("Unknown config key: {}", key))),
    }

    Ok(())
}

fn parse_bool(value: &str) -> ConbuilderResult<bool> {
    match value.to_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" => Ok(false),
        _ => Err(ConbuilderError::User(format!(
            "Invalid boolean value: {}. Use true/false",
            value
        ))),
    }
}

fn parse_number<T: std::str::FromStr>(value: &str) -> ConbuilderResult<T> {
    value
        .trim()
        .parse()
        .map_err(|_| ConbuilderError::User(format!("Invalid number: {}", value)))
}

/// Comma separated list, empty items dropped
fn parse_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn apply_sets_nested_keys() {
        let mut config = Config::default();
        apply_value(&mut config, "environment.codename", "bookworm").unwrap();
        apply_value(&mut config, "eviction.dependencies.max_count", "4").unwrap();
        apply_value(&mut config, "sandbox.allow_capabilities", "CAP_CHOWN, CAP_SETUID,").unwrap();
        apply_value(&mut config, "build.auto_evict", "no").unwrap();

        assert_eq!(config.environment.codename, "bookworm");
        assert_eq!(config.eviction.dependencies.max_count, 4);
        assert_eq!(
            config.sandbox.allow_capabilities,
            vec!["CAP_CHOWN", "CAP_SETUID"]
        );
        assert!(!config.build.auto_evict);
    }

    #[test]
    fn apply_rejects_bad_values() {
        let mut config = Config::default();
        assert!(apply_value(&mut config, "store.unmount_retries", "many").is_err());
        assert!(apply_value(&mut config, "sandbox.network", "maybe").is_err());
        assert!(apply_value(&mut config, "vm.name", "x").is_err());
    }

    #[test]
    fn every_listed_key_is_settable() {
        for key in VALID_KEYS {
            let mut config = Config::default();
            let value = if key.ends_with("network") || key.ends_with("auto_evict") {
                "true"
            } else if key.contains("max_") || key.contains("unmount_") {
                "7"
            } else {
                "/tmp/value"
            };
            apply_value(&mut config, key, value)
                .unwrap_or_else(|e| panic!("{} rejected: {}", key, e));
        }
    }

    #[tokio::test]
    async fn set_persists_and_validates() {
        let temp = TempDir::new().unwrap();
        let manager = ConfigManager::with_path(temp.path().join("config.toml"));

        set_value(&manager, "environment.mirror", "http://mirror.local/debian")
            .await
            .unwrap();
        let loaded = manager.load().await.unwrap();
        assert_eq!(loaded.environment.mirror, "http://mirror.local/debian");

        // '/' fails validation on save and leaves the file untouched
        assert!(set_value(&manager, "store.cache_dir", "/").await.is_err());
        let loaded = manager.load().await.unwrap();
        assert_eq!(loaded.store.cache_dir, Config::default().store.cache_dir);
    }

    #[tokio::test]
    async fn init_does_not_overwrite_without_force() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("config.toml");
        let manager = ConfigManager::with_path(path.clone());

        init_config(&manager, false).await.unwrap();
        std::fs::write(&path, "[environment]\ncodename = \"trixie\"\n").unwrap();

        init_config(&manager, false).await.unwrap();
        assert_eq!(manager.load().await.unwrap().environment.codename, "trixie");

        init_config(&manager, true).await.unwrap();
        assert_eq!(manager.load().await.unwrap().environment.codename, "sid");
    }
}

//! Base layer population
//!
//! A base layer is either bootstrapped from a package mirror or produced by
//! upgrading a copy of the current base in place.

use crate::config::EnvironmentConfig;
use crate::error::{ConbuilderError, ConbuilderResult};
use crate::layer::fingerprint::FingerprintBuilder;
use crate::layer::{Fingerprint, Layer, LayerBuilder, LayerContext};
use crate::orchestrator::artifacts::copy_tree;
use crate::orchestrator::{machine_name, OutputSink};
use crate::sandbox::{run_child, CancelToken, Invocation, SandboxLauncher, SandboxSpec};
use async_trait::async_trait;
use std::path::Path;
use tokio::process::Command;
use tracing::{debug, info};

const DEBOOTSTRAP: &str = "debootstrap";

/// Cache key fingerprint of a base layer. `generation` distinguishes
/// successive bases of the same environment.
pub fn base_fingerprint(env: &EnvironmentConfig, generation: &str) -> Fingerprint {
    FingerprintBuilder::new()
        .field("codename", &env.codename)
        .field("mirror", &env.mirror)
        .field("include", env.include.join(","))
        .field("generation", generation)
        .finish()
}

/// Populates an empty directory with a root filesystem
#[async_trait]
pub trait Bootstrapper: Send + Sync {
    async fn bootstrap(
        &self,
        env: &EnvironmentConfig,
        target: &Path,
        cancel: &CancelToken,
        on_output: OutputSink<'_>,
    ) -> ConbuilderResult<()>;

    /// Human-readable name for display
    fn name(&self) -> &'static str;
}

/// Bootstrapper using debootstrap(8)
pub struct Debootstrap;

impl Debootstrap {
    pub fn new() -> Self {
        Self
    }

    pub fn args(&self, env: &EnvironmentConfig, target: &Path) -> Vec<String> {
        let mut args = Vec::new();
        if !env.include.is_empty() {
            args.push(format!("--include={}", env.include.join(",")));
        }
        args.push("--force-check-gpg".to_string());
        args.push(env.codename.clone());
        args.push(target.display().to_string());
        args.push(env.mirror.clone());
        args
    }
}

impl Default for Debootstrap {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Bootstrapper for Debootstrap {
    async fn bootstrap(
        &self,
        env: &EnvironmentConfig,
        target: &Path,
        cancel: &CancelToken,
        on_output: OutputSink<'_>,
    ) -> ConbuilderResult<()> {
        let args = self.args(env, target);
        debug!("Executing: {} {}", DEBOOTSTRAP, args.join(" "));

        let mut command = Command::new(DEBOOTSTRAP);
        command.args(&args);
        run_child(command, DEBOOTSTRAP, cancel, on_output)
            .await?
            .check(DEBOOTSTRAP)?;

        verify_root(target)
    }

    fn name(&self) -> &'static str {
        "debootstrap"
    }
}

/// A bootstrapped tree must at least have /etc and apt
pub(crate) fn verify_root(root: &Path) -> ConbuilderResult<()> {
    for (path, dir) in [("etc", true), ("usr/bin/apt", false)] {
        let full = root.join(path);
        let ok = if dir { full.is_dir() } else { full.is_file() };
        if !ok {
            return Err(ConbuilderError::command_exec(
                DEBOOTSTRAP,
                format!("no /{} in bootstrapped tree {}", path, root.display()),
            ));
        }
    }
    Ok(())
}

/// Builds a base layer from scratch
pub struct BootstrapBuilder<'a> {
    pub bootstrapper: &'a dyn Bootstrapper,
    pub environment: &'a EnvironmentConfig,
    pub cancel: &'a CancelToken,
    pub on_output: OutputSink<'a>,
}

#[async_trait]
impl LayerBuilder for BootstrapBuilder<'_> {
    async fn build(&self, ctx: &LayerContext) -> ConbuilderResult<()> {
        info!(
            codename = %self.environment.codename,
            "[L1] Bootstrapping with {}",
            self.bootstrapper.name()
        );
        self.bootstrapper
            .bootstrap(self.environment, &ctx.root, self.cancel, self.on_output)
            .await
    }

    fn describe(&self) -> Vec<String> {
        vec![
            format!(
                "{} {} {}",
                self.bootstrapper.name(),
                self.environment.codename,
                self.environment.mirror
            ),
            format!("include: {}", self.environment.include.join(", ")),
        ]
    }
}

/// Builds a new base layer by upgrading a copy of an existing one
pub struct UpgradeBuilder<'a> {
    pub previous: &'a Layer,
    pub launcher: &'a dyn SandboxLauncher,
    pub spec: SandboxSpec,
    pub cancel: &'a CancelToken,
    pub on_output: OutputSink<'a>,
}

#[async_trait]
impl LayerBuilder for UpgradeBuilder<'_> {
    async fn build(&self, ctx: &LayerContext) -> ConbuilderResult<()> {
        info!(from = %self.previous.id, "[L1] Upgrading base layer");
        copy_tree(&self.previous.mount_path, &ctx.root, self.cancel).await?;

        let steps: [&[&str]; 2] = [
            &["/usr/bin/apt-get", "-y", "update"],
            &["/usr/bin/apt-get", "-y", "dist-upgrade"],
        ];
        for step in steps {
            let mut invocation = Invocation::new(machine_name(), &ctx.root, self.spec.clone())
                .command(step.iter().copied())
                .env("DEBIAN_FRONTEND", "noninteractive");
            invocation.workdir = "/".to_string();
            self.launcher
                .run(&invocation, self.cancel, self.on_output)
                .await?
                .check(&invocation.display_command())?;
        }

        verify_root(&ctx.root)
    }

    fn describe(&self) -> Vec<String> {
        vec![
            format!("upgrade of {}", self.previous.id),
            "apt-get update && apt-get dist-upgrade".to_string(),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn debootstrap_args_follow_environment() {
        let env = EnvironmentConfig::default();
        let args = Debootstrap::new().args(&env, Path::new("/cache/staging/x/fs"));
        assert_eq!(
            args,
            vec![
                "--include=apt",
                "--force-check-gpg",
                "sid",
                "/cache/staging/x/fs",
                "http://deb.debian.org/debian",
            ]
        );
    }

    #[test]
    fn debootstrap_args_without_include() {
        let env = EnvironmentConfig {
            include: vec![],
            ..EnvironmentConfig::default()
        };
        let args = Debootstrap::new().args(&env, Path::new("/t"));
        assert_eq!(args[0], "--force-check-gpg");
    }

    #[test]
    fn base_fingerprint_tracks_generation_and_environment() {
        let env = EnvironmentConfig::default();
        let first = base_fingerprint(&env, "2026-01-01T00:00:00Z");
        assert_eq!(first, base_fingerprint(&env, "2026-01-01T00:00:00Z"));
        assert_ne!(first, base_fingerprint(&env, "2026-02-01T00:00:00Z"));

        let other = EnvironmentConfig {
            codename: "bookworm".to_string(),
            ..EnvironmentConfig::default()
        };
        assert_ne!(first, base_fingerprint(&other, "2026-01-01T00:00:00Z"));
    }

    #[test]
    fn verify_root_requires_apt() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("etc")).unwrap();
        assert!(verify_root(dir.path()).is_err());

        std::fs::create_dir_all(dir.path().join("usr/bin")).unwrap();
        std::fs::write(dir.path().join("usr/bin/apt"), b"").unwrap();
        verify_root(dir.path()).unwrap();
    }
}

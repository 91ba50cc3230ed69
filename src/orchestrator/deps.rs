//! Build dependency resolution and installation

use crate::error::{ConbuilderError, ConbuilderResult};
use crate::layer::{
    DependencySet, Disposition, Layer, LayerBuilder, LayerContext, LayerStore, MountPurpose,
};
use crate::orchestrator::{machine_name, OutputSink};
use crate::sandbox::{BindMode, CancelToken, Invocation, SandboxLauncher, SandboxSpec};
use async_trait::async_trait;
use std::path::Path;
use tokio::fs;
use tracing::{debug, error, info};

/// Written into every dependencies layer, listing `name:version` per line
pub const DEPS_MANIFEST: &str = ".deps.conbuilder";

const SOURCE_MOUNT: &str = "/srv";

/// Ask the package manager, inside a throwaway view of `base`, which build
/// dependencies the package in `source_dir` needs.
///
/// Nothing is written to the base: the root is read-only and the source tree
/// is overlaid so its writes vanish with the container.
pub async fn resolve_dependencies(
    store: &LayerStore,
    launcher: &dyn SandboxLauncher,
    spec: &SandboxSpec,
    base: &Layer,
    source_dir: &Path,
    cancel: &CancelToken,
) -> ConbuilderResult<DependencySet> {
    let mount = store.mount_ephemeral(base, MountPurpose::Inspection).await?;

    let invocation = Invocation::new(machine_name(), mount.merged(), spec.clone())
        .command(["/usr/bin/apt-get", "build-dep", "-s", "."])
        .bind(source_dir, SOURCE_MOUNT, BindMode::Overlay)
        .read_only();
    debug!("Simulating: {}", invocation.display_command());

    let result = match launcher.run(&invocation, cancel, &|_| {}).await {
        Ok(outcome) => outcome
            .check(&invocation.display_command())
            .and_then(|lines| DependencySet::from_simulation(&lines)),
        Err(e) => Err(e),
    };

    if let Err(teardown) = store.release(mount, Disposition::Discard).await {
        if let Err(e) = &result {
            error!("Dependency resolution failed: {}", e);
        }
        return Err(teardown);
    }

    let deps = result?;
    info!(packages = deps.len(), "[L2] Resolved build dependencies");
    Ok(deps)
}

/// Installs exactly the resolved (or declared) dependency set on top of a
/// base layer, pinned to the listed versions
pub struct DependencyInstaller<'a> {
    pub source_dir: &'a Path,
    pub dependencies: &'a DependencySet,
    pub launcher: &'a dyn SandboxLauncher,
    pub spec: SandboxSpec,
    pub cancel: &'a CancelToken,
    pub on_output: OutputSink<'a>,
}

impl DependencyInstaller<'_> {
    fn invocation<I, S>(&self, root: &Path, command: I) -> Invocation
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Invocation::new(machine_name(), root, self.spec.clone())
            .command(command)
            .bind(self.source_dir, SOURCE_MOUNT, BindMode::Overlay)
            .env("DEBIAN_FRONTEND", "noninteractive")
    }

    async fn run(&self, invocation: Invocation) -> ConbuilderResult<()> {
        self.launcher
            .run(&invocation, self.cancel, self.on_output)
            .await?
            .check(&invocation.display_command())?;
        Ok(())
    }
}

#[async_trait]
impl LayerBuilder for DependencyInstaller<'_> {
    async fn build(&self, ctx: &LayerContext) -> ConbuilderResult<()> {
        if self.dependencies.is_empty() {
            info!("[L2] No build dependencies to install");
        } else {
            info!(
                packages = self.dependencies.len(),
                "[L2] Installing build dependencies"
            );
            let command = ["/usr/bin/apt-get", "install", "-y", "--no-install-recommends"]
                .into_iter()
                .map(String::from)
                .chain(self.dependencies.install_pins());
            self.run(self.invocation(&ctx.root, command)).await?;
        }

        self.run(self.invocation(&ctx.root, ["/usr/bin/apt-get", "clean"]))
            .await?;

        let manifest = ctx.root.join(DEPS_MANIFEST);
        let mut content = self.dependencies.entries().join("\n");
        content.push('\n');
        fs::write(&manifest, content).await.map_err(|e| {
            ConbuilderError::io(format!("writing {}", manifest.display()), e)
        })?;
        Ok(())
    }

    fn describe(&self) -> Vec<String> {
        self.dependencies.entries()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layer::{Fingerprint, LayerKey, UnmountPolicy};
    use crate::sandbox::{HostSupport, SandboxPolicy, SandboxProfile};
    use crate::testing::{CountingBuilder, FakeLauncher, FakeOverlay};
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::TempDir;

    const SIMULATION: &[&str] = &[
        "Reading package lists...",
        "Inst gettext (0.21-12 Debian:unstable [amd64]) []",
        "Inst debhelper (13.11 Debian:unstable [all])",
        "Conf gettext (0.21-12 Debian:unstable [amd64])",
    ];

    fn spec() -> SandboxSpec {
        SandboxPolicy::new(HostSupport::full())
            .compile(&SandboxProfile::construction())
            .unwrap()
    }

    async fn setup(dir: &TempDir) -> (LayerStore, Layer, Arc<FakeOverlay>) {
        let overlay = Arc::new(FakeOverlay::new());
        let policy = UnmountPolicy {
            retries: 0,
            delay: Duration::from_millis(1),
        };
        let store = LayerStore::open(dir.path().join("cache"), overlay.clone(), policy).unwrap();
        let base = store
            .find_or_create(
                &LayerKey::base("sid", Fingerprint::new("sid")),
                &CountingBuilder::new("usr/bin/apt"),
            )
            .await
            .unwrap();
        (store, base, overlay)
    }

    #[tokio::test]
    async fn resolve_parses_simulation_and_releases() {
        let dir = TempDir::new().unwrap();
        let (store, base, overlay) = setup(&dir).await;
        let launcher = FakeLauncher::new().with_output(SIMULATION);

        let deps = resolve_dependencies(
            &store,
            &launcher,
            &spec(),
            &base,
            dir.path(),
            &CancelToken::never(),
        )
        .await
        .unwrap();

        assert_eq!(
            deps.entries(),
            vec!["debhelper:13.11", "gettext:0.21-12"]
        );
        assert_eq!(overlay.active(), 0);
        assert!(store.active_mounts().unwrap().is_empty());

        let invocations = launcher.invocations();
        assert_eq!(invocations.len(), 1);
        assert!(invocations[0].read_only);
        assert_eq!(invocations[0].binds[0].mode, BindMode::Overlay);
        assert_eq!(invocations[0].binds[0].target, "/srv");
    }

    #[tokio::test]
    async fn resolve_failure_still_releases() {
        let dir = TempDir::new().unwrap();
        let (store, base, overlay) = setup(&dir).await;
        let launcher = FakeLauncher::new().with_exit_code(100);

        let result = resolve_dependencies(
            &store,
            &launcher,
            &spec(),
            &base,
            dir.path(),
            &CancelToken::never(),
        )
        .await;

        assert!(result.is_err());
        assert_eq!(overlay.active(), 0);
        assert!(store.active_mounts().unwrap().is_empty());
    }

    #[tokio::test]
    async fn installer_writes_manifest() {
        let dir = TempDir::new().unwrap();
        let (store, base, _overlay) = setup(&dir).await;
        let launcher = FakeLauncher::new();
        let deps = DependencySet::from_simulation(SIMULATION).unwrap();
        let cancel = CancelToken::never();

        let installer = DependencyInstaller {
            source_dir: dir.path(),
            dependencies: &deps,
            launcher: &launcher,
            spec: spec(),
            cancel: &cancel,
            on_output: &|_| {},
        };
        let key = LayerKey::child_of(&base, deps.fingerprint()).unwrap();
        let layer = store.find_or_create(&key, &installer).await.unwrap();

        let manifest = std::fs::read_to_string(layer.mount_path.join(DEPS_MANIFEST)).unwrap();
        assert_eq!(manifest, "debhelper:13.11\ngettext:0.21-12\n");
        assert_eq!(layer.inputs, deps.entries());

        let commands: Vec<String> = launcher
            .invocations()
            .iter()
            .map(|i| i.display_command())
            .collect();
        assert_eq!(
            commands,
            vec![
                "/usr/bin/apt-get install -y --no-install-recommends debhelper=13.11 gettext=0.21-12",
                "/usr/bin/apt-get clean",
            ]
        );
    }

    #[tokio::test]
    async fn installer_installs_declared_set_not_control_file() {
        let dir = TempDir::new().unwrap();
        let (store, base, _overlay) = setup(&dir).await;
        let launcher = FakeLauncher::new();
        let deps = DependencySet::new(vec![("libfoo-dev".to_string(), "2.0-1".to_string())]);
        let cancel = CancelToken::never();

        let installer = DependencyInstaller {
            source_dir: dir.path(),
            dependencies: &deps,
            launcher: &launcher,
            spec: spec(),
            cancel: &cancel,
            on_output: &|_| {},
        };
        let key = LayerKey::child_of(&base, deps.fingerprint()).unwrap();
        let layer = store.find_or_create(&key, &installer).await.unwrap();

        let install = &launcher.invocations()[0];
        assert_eq!(install.command.last().map(String::as_str), Some("libfoo-dev=2.0-1"));
        assert!(!install.command.iter().any(|arg| arg == "build-dep"));
        assert_eq!(layer.inputs, vec!["libfoo-dev:2.0-1"]);
    }

    #[tokio::test]
    async fn installer_skips_install_for_empty_set() {
        let dir = TempDir::new().unwrap();
        let (store, base, _overlay) = setup(&dir).await;
        let launcher = FakeLauncher::new();
        let deps = DependencySet::default();
        let cancel = CancelToken::never();

        let installer = DependencyInstaller {
            source_dir: dir.path(),
            dependencies: &deps,
            launcher: &launcher,
            spec: spec(),
            cancel: &cancel,
            on_output: &|_| {},
        };
        let key = LayerKey::child_of(&base, deps.fingerprint()).unwrap();
        store.find_or_create(&key, &installer).await.unwrap();

        assert_eq!(launcher.invocations().len(), 1);
    }
}

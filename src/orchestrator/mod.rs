//! Build orchestration
//!
//! Composes the layer store, the sandbox policy and a launcher into the
//! package build flow:
//!
//! ```text
//! Pending -> LayerReady -> SandboxPrepared -> Running -> Succeeded -> Finalized
//!                                                    \-> Failed    -/
//! ```
//!
//! The ephemeral build overlay is always torn down, whatever the outcome.

pub mod artifacts;
pub mod bootstrap;
pub mod deps;

pub use bootstrap::{Bootstrapper, Debootstrap};
pub use deps::DEPS_MANIFEST;

use crate::config::{Config, EnvironmentConfig};
use crate::error::{ConbuilderError, ConbuilderResult};
use crate::eviction::{self, EvictionReport};
use crate::layer::fingerprint::FingerprintBuilder;
use crate::layer::{
    DependencySet, Disposition, Fingerprint, Layer, LayerId, LayerKey, LayerStore, MountPurpose,
    OverlayMount, Tier, UnmountPolicy,
};
use crate::overlay::KernelOverlay;
use crate::sandbox::{
    CancelToken, HostSupport, Invocation, NspawnLauncher, SandboxLauncher, SandboxPolicy,
    SandboxProfile, SandboxSpec,
};
use artifacts::{collect_artifacts, copy_tree, export_path, output_path};
use bootstrap::{base_fingerprint, BootstrapBuilder, UpgradeBuilder};
use chrono::Utc;
use deps::{resolve_dependencies, DependencyInstaller};
use serde::Serialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Receives container output line by line
pub type OutputSink<'a> = &'a (dyn Fn(String) + Send + Sync);

const BUILD_COMMAND: &str = "dpkg-buildpackage";

/// Unique container name for one run
pub(crate) fn machine_name() -> String {
    let id = Uuid::new_v4().simple().to_string();
    format!("conbuilder-{}", &id[..12])
}

/// Fingerprint of a build: source tree, sandbox profile and build arguments
pub fn build_fingerprint(
    source_dir: &Path,
    profile: &SandboxProfile,
    extra_args: &[String],
) -> ConbuilderResult<Fingerprint> {
    Ok(FingerprintBuilder::new()
        .tree("source", source_dir)?
        .field("profile", profile.canonical())
        .field("args", extra_args.join("\0"))
        .finish())
}

/// Lifecycle of one build request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildState {
    Pending,
    LayerReady,
    SandboxPrepared,
    Running,
    Succeeded,
    Failed,
    Finalized,
}

impl BuildState {
    fn can_advance_to(self, next: BuildState) -> bool {
        use BuildState::*;
        match (self, next) {
            (Pending, LayerReady)
            | (LayerReady, SandboxPrepared)
            | (SandboxPrepared, Running)
            | (Running, Succeeded)
            // a cached build layer skips the sandbox entirely
            | (Pending, Succeeded) => true,
            (Finalized, _) | (_, Pending) => false,
            (Succeeded, Finalized) | (Failed, Finalized) => true,
            (Succeeded, _) | (Failed, _) => false,
            (_, Failed) => true,
            _ => false,
        }
    }
}

impl fmt::Display for BuildState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Pending => "pending",
            Self::LayerReady => "layer-ready",
            Self::SandboxPrepared => "sandbox-prepared",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Finalized => "finalized",
        };
        write!(f, "{}", name)
    }
}

/// Records the states a build went through
#[derive(Debug)]
struct StateTracker {
    states: Vec<BuildState>,
}

impl StateTracker {
    fn new() -> Self {
        Self {
            states: vec![BuildState::Pending],
        }
    }

    fn current(&self) -> BuildState {
        self.states
            .last()
            .copied()
            .unwrap_or(BuildState::Pending)
    }

    fn advance(&mut self, next: BuildState) -> ConbuilderResult<()> {
        let current = self.current();
        if !current.can_advance_to(next) {
            return Err(ConbuilderError::Internal(format!(
                "illegal build state transition {} -> {}",
                current, next
            )));
        }
        debug!(from = %current, to = %next, "Build state");
        self.states.push(next);
        Ok(())
    }

    /// Move to Failed unless already in a terminal state
    fn fail(&mut self) {
        if self.current().can_advance_to(BuildState::Failed) {
            self.states.push(BuildState::Failed);
        }
    }
}

/// One package build
#[derive(Debug, Clone)]
pub struct BuildRequest {
    /// Unpacked source package
    pub source_dir: PathBuf,
    pub environment: EnvironmentConfig,
    pub profile: SandboxProfile,
    /// Extra arguments for dpkg-buildpackage
    pub extra_args: Vec<String>,
    /// Known dependency set; resolved from the source tree when absent
    pub dependencies: Option<DependencySet>,
    /// Overrides `build.export_dir`
    pub export_dir: Option<PathBuf>,
    /// Build again even if an identical build layer exists
    pub rebuild: bool,
}

impl BuildRequest {
    pub fn new(
        source_dir: impl Into<PathBuf>,
        environment: EnvironmentConfig,
        profile: SandboxProfile,
    ) -> Self {
        Self {
            source_dir: source_dir.into(),
            environment,
            profile,
            extra_args: vec![],
            dependencies: None,
            export_dir: None,
            rebuild: false,
        }
    }
}

/// Outcome of a successful build
#[derive(Debug, Clone, Serialize)]
pub struct BuildReport {
    pub fingerprint: Fingerprint,
    pub base: LayerId,
    pub dependencies: LayerId,
    pub packages: Vec<String>,
    /// Build layer holding the result
    pub layer: LayerId,
    /// The build layer already existed and nothing ran
    pub cached: bool,
    pub artifacts: Vec<PathBuf>,
    pub states: Vec<BuildState>,
    pub eviction: Option<EvictionReport>,
}

/// Runs builds, installs and base layer maintenance against one store
pub struct Orchestrator {
    store: Arc<LayerStore>,
    policy: SandboxPolicy,
    launcher: Arc<dyn SandboxLauncher>,
    bootstrapper: Arc<dyn Bootstrapper>,
    config: Config,
}

impl Orchestrator {
    pub fn new(
        store: Arc<LayerStore>,
        policy: SandboxPolicy,
        launcher: Arc<dyn SandboxLauncher>,
        bootstrapper: Arc<dyn Bootstrapper>,
        config: Config,
    ) -> Self {
        Self {
            store,
            policy,
            launcher,
            bootstrapper,
            config,
        }
    }

    /// Orchestrator on the host backends: kernel overlayfs, systemd-nspawn
    /// and debootstrap
    pub fn from_config(config: &Config) -> ConbuilderResult<Self> {
        let unmount = UnmountPolicy {
            retries: config.store.unmount_retries,
            delay: Duration::from_millis(config.store.unmount_retry_delay_ms),
        };
        let store = LayerStore::open(
            &config.store.cache_dir,
            Arc::new(KernelOverlay::new()),
            unmount,
        )?;

        Ok(Self::new(
            Arc::new(store),
            SandboxPolicy::new(HostSupport::probe()),
            Arc::new(NspawnLauncher::new()),
            Arc::new(Debootstrap::new()),
            config.clone(),
        ))
    }

    pub fn store(&self) -> &Arc<LayerStore> {
        &self.store
    }

    /// Spec used when populating layers: network on, default capabilities
    fn construction_spec(&self) -> ConbuilderResult<SandboxSpec> {
        self.policy.compile(&SandboxProfile::construction())
    }

    fn bootstrap_builder<'a>(
        &'a self,
        environment: &'a EnvironmentConfig,
        cancel: &'a CancelToken,
        on_output: OutputSink<'a>,
    ) -> BootstrapBuilder<'a> {
        BootstrapBuilder {
            bootstrapper: &*self.bootstrapper,
            environment,
            cancel,
            on_output,
        }
    }

    fn fresh_base_key(environment: &EnvironmentConfig) -> LayerKey {
        let generation = Utc::now().to_rfc3339();
        LayerKey::base(
            environment.codename.clone(),
            base_fingerprint(environment, &generation),
        )
    }

    /// Bootstrap the first base layer of an environment
    pub async fn create(
        &self,
        environment: &EnvironmentConfig,
        cancel: &CancelToken,
        on_output: OutputSink<'_>,
    ) -> ConbuilderResult<Layer> {
        let _guard = self.store.lock_environment(&environment.codename).await?;
        if let Some(existing) = self.store.current_base(&environment.codename)? {
            return Err(ConbuilderError::User(format!(
                "Base layer for {} already exists ({}); use `conbuilder update` to refresh it",
                environment.codename, existing.id
            )));
        }

        let key = Self::fresh_base_key(environment);
        let builder = self.bootstrap_builder(environment, cancel, on_output);
        self.store.find_or_create(&key, &builder).await
    }

    /// Replace the current base with an upgraded copy, or with a fresh
    /// bootstrap when `rebootstrap` is set or no base exists yet. The old
    /// base is flagged superseded and stays until purged.
    pub async fn update(
        &self,
        environment: &EnvironmentConfig,
        rebootstrap: bool,
        cancel: &CancelToken,
        on_output: OutputSink<'_>,
    ) -> ConbuilderResult<Layer> {
        let _guard = self.store.lock_environment(&environment.codename).await?;
        let key = Self::fresh_base_key(environment);

        match self.store.current_base(&environment.codename)? {
            Some(previous) if !rebootstrap => {
                let builder = UpgradeBuilder {
                    previous: &previous,
                    launcher: &*self.launcher,
                    spec: self.construction_spec()?,
                    cancel,
                    on_output,
                };
                self.store.find_or_create(&key, &builder).await
            }
            _ => {
                let builder = self.bootstrap_builder(environment, cancel, on_output);
                self.store.find_or_create(&key, &builder).await
            }
        }
    }

    /// Current base for the environment, bootstrapped on a miss.
    ///
    /// Concurrent callers on one cache serialize on the environment lock,
    /// so a miss bootstraps exactly once and everyone gets the same base.
    pub async fn ensure_base(
        &self,
        environment: &EnvironmentConfig,
        cancel: &CancelToken,
        on_output: OutputSink<'_>,
    ) -> ConbuilderResult<Layer> {
        if let Some(base) = self.reuse_base(&environment.codename)? {
            return Ok(base);
        }

        let _guard = self.store.lock_environment(&environment.codename).await?;
        if let Some(base) = self.reuse_base(&environment.codename)? {
            debug!(layer = %base.id, "Base layer appeared while waiting");
            return Ok(base);
        }

        info!(codename = %environment.codename, "No base layer yet");
        let key = Self::fresh_base_key(environment);
        let builder = self.bootstrap_builder(environment, cancel, on_output);
        self.store.find_or_create(&key, &builder).await
    }

    fn reuse_base(&self, codename: &str) -> ConbuilderResult<Option<Layer>> {
        match self.store.current_base(codename)? {
            Some(base) => self.store.reuse(&base.key()),
            None => Ok(None),
        }
    }

    /// Build a source package in a sandbox on top of cached layers
    pub async fn build(
        &self,
        request: &BuildRequest,
        cancel: &CancelToken,
        on_output: OutputSink<'_>,
    ) -> ConbuilderResult<BuildReport> {
        let mut tracker = StateTracker::new();

        // Nothing touches the store before the profile is known to work here
        let spec = self.policy.compile(&request.profile)?;
        let construction = self.construction_spec()?;

        if !request.source_dir.is_dir() {
            return Err(ConbuilderError::PathNotFound(request.source_dir.clone()));
        }
        let fingerprint =
            build_fingerprint(&request.source_dir, &request.profile, &request.extra_args)?;
        info!(fingerprint = %fingerprint, source = %request.source_dir.display(), "Starting build");

        let base = self
            .ensure_base(&request.environment, cancel, on_output)
            .await?;

        let dependencies = match &request.dependencies {
            Some(deps) => deps.clone(),
            None => {
                resolve_dependencies(
                    &self.store,
                    &*self.launcher,
                    &construction,
                    &base,
                    &request.source_dir,
                    cancel,
                )
                .await?
            }
        };

        let deps_key = LayerKey::child_of(&base, dependencies.fingerprint())
            .ok_or_else(|| ConbuilderError::Internal("base layer has no child tier".into()))?;
        let installer = DependencyInstaller {
            source_dir: &request.source_dir,
            dependencies: &dependencies,
            launcher: &*self.launcher,
            spec: construction,
            cancel,
            on_output,
        };
        let deps_layer = self.store.find_or_create(&deps_key, &installer).await?;

        let build_key = LayerKey::child_of(&deps_layer, fingerprint.clone())
            .ok_or_else(|| ConbuilderError::Internal("dependencies layer has no child tier".into()))?;
        let export_dir = export_path(
            &request.source_dir,
            request
                .export_dir
                .as_deref()
                .unwrap_or(self.config.build.export_dir.as_path()),
        );

        let mut report = BuildReport {
            fingerprint,
            base: base.id.clone(),
            dependencies: deps_layer.id.clone(),
            packages: dependencies.entries(),
            layer: build_key.id(),
            cached: false,
            artifacts: vec![],
            states: vec![],
            eviction: None,
        };

        if !request.rebuild {
            if let Some(cached) = self.store.reuse(&build_key)? {
                info!(layer = %cached.id, "Identical build already cached");
                report.artifacts = collect_artifacts(
                    &output_path(&cached.mount_path, &self.config.build.output_dir),
                    &self.config.build.artifact_extensions,
                    &export_dir,
                )
                .await?;
                tracker.advance(BuildState::Succeeded)?;
                tracker.advance(BuildState::Finalized)?;
                report.cached = true;
                report.states = tracker.states;
                return Ok(report);
            }
        }

        let mount = self
            .store
            .mount_ephemeral(&deps_layer, MountPurpose::Build)
            .await?;

        let outcome = self
            .run_build(
                &mount,
                request,
                spec,
                &export_dir,
                &report.fingerprint,
                &mut tracker,
                cancel,
                on_output,
            )
            .await;

        if outcome.is_err() {
            tracker.fail();
        }

        let disposition = match &outcome {
            Ok(_) => Disposition::Promote {
                key: build_key,
                inputs: build_inputs(request),
            },
            Err(_) => Disposition::Discard,
        };

        let released = self.store.release(mount, disposition).await;
        tracker.advance(BuildState::Finalized)?;

        let eviction = self.auto_evict();

        match (outcome, released) {
            (Ok(artifacts), Ok(layer)) => {
                if let Some(layer) = layer {
                    report.layer = layer.id;
                }
                report.artifacts = artifacts;
                report.states = tracker.states;
                report.eviction = eviction;
                info!(layer = %report.layer, artifacts = report.artifacts.len(), "Build succeeded");
                Ok(report)
            }
            (Ok(_), Err(teardown)) => Err(teardown),
            (Err(e), Ok(_)) => Err(e),
            (Err(e), Err(teardown)) => {
                error!("Build failed: {}", e);
                Err(teardown)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_build(
        &self,
        mount: &OverlayMount,
        request: &BuildRequest,
        spec: SandboxSpec,
        export_dir: &Path,
        fingerprint: &Fingerprint,
        tracker: &mut StateTracker,
        cancel: &CancelToken,
        on_output: OutputSink<'_>,
    ) -> ConbuilderResult<Vec<PathBuf>> {
        copy_tree(&request.source_dir, &mount.merged().join("srv"), cancel).await?;
        tracker.advance(BuildState::LayerReady)?;

        let invocation = Invocation::new(machine_name(), mount.merged(), spec).command(
            std::iter::once(BUILD_COMMAND.to_string()).chain(request.extra_args.iter().cloned()),
        );
        tracker.advance(BuildState::SandboxPrepared)?;

        info!(
            machine = %invocation.machine,
            network = invocation.spec.network_enabled(),
            "[L3] Running {}",
            invocation.display_command()
        );
        tracker.advance(BuildState::Running)?;
        let outcome = self.launcher.run(&invocation, cancel, on_output).await?;

        if !outcome.success() {
            return Err(ConbuilderError::BuildFailure {
                parent: mount.top().id.clone(),
                fingerprint: fingerprint.to_string(),
                status: outcome.status.to_string(),
                exit_code: outcome.exit_code(),
                output: outcome.tail(),
            });
        }
        tracker.advance(BuildState::Succeeded)?;

        collect_artifacts(
            &output_path(mount.merged(), &self.config.build.output_dir),
            &self.config.build.artifact_extensions,
            export_dir,
        )
        .await
    }

    fn auto_evict(&self) -> Option<EvictionReport> {
        if !self.config.build.auto_evict {
            return None;
        }
        let policy = self.config.eviction.build.policy();
        match eviction::evict(&self.store, Tier::Build, &policy, Utc::now()) {
            Ok(report) => Some(report),
            Err(e) => {
                warn!("Automatic eviction failed: {}", e);
                None
            }
        }
    }

    /// Install local package files into a throwaway overlay over the base
    /// layer, bootstrapping the base on first use. Nothing is kept.
    pub async fn install(
        &self,
        environment: &EnvironmentConfig,
        packages: &[PathBuf],
        cancel: &CancelToken,
        on_output: OutputSink<'_>,
    ) -> ConbuilderResult<()> {
        if packages.is_empty() {
            return Err(ConbuilderError::User("No packages to install".to_string()));
        }
        for package in packages {
            if !package.is_file() {
                return Err(ConbuilderError::PathNotFound(package.clone()));
            }
        }
        let spec = self.construction_spec()?;

        let base = self.ensure_base(environment, cancel, on_output).await?;

        let mount = self
            .store
            .mount_ephemeral(&base, MountPurpose::Install)
            .await?;
        let result = self
            .run_install(&mount, packages, spec, cancel, on_output)
            .await;

        let released = self.store.release(mount, Disposition::Discard).await;
        match (result, released) {
            (Ok(()), Ok(_)) => Ok(()),
            (Ok(()), Err(teardown)) => Err(teardown),
            (Err(e), Ok(_)) => Err(e),
            (Err(e), Err(teardown)) => {
                error!("Install failed: {}", e);
                Err(teardown)
            }
        }
    }

    async fn run_install(
        &self,
        mount: &OverlayMount,
        packages: &[PathBuf],
        spec: SandboxSpec,
        cancel: &CancelToken,
        on_output: OutputSink<'_>,
    ) -> ConbuilderResult<()> {
        let srv = mount.merged().join("srv");
        fs::create_dir_all(&srv)
            .await
            .map_err(|e| ConbuilderError::io(format!("creating {}", srv.display()), e))?;

        let mut targets = Vec::with_capacity(packages.len());
        for package in packages {
            let name = package
                .file_name()
                .ok_or_else(|| ConbuilderError::PathNotFound(package.clone()))?;
            let dest = srv.join(name);
            fs::copy(package, &dest).await.map_err(|e| {
                ConbuilderError::io(format!("copying {}", package.display()), e)
            })?;
            targets.push(format!("/srv/{}", name.to_string_lossy()));
        }

        let invocation = Invocation::new(machine_name(), mount.merged(), spec)
            .command(
                ["/usr/bin/apt-get", "install", "-y"]
                    .into_iter()
                    .map(String::from)
                    .chain(targets),
            )
            .env("DEBIAN_FRONTEND", "noninteractive");
        info!("Installing {} package(s)", packages.len());

        self.launcher
            .run(&invocation, cancel, on_output)
            .await?
            .check(&invocation.display_command())?;
        Ok(())
    }
}

fn build_inputs(request: &BuildRequest) -> Vec<String> {
    let mut inputs = vec![format!("source: {}", request.source_dir.display())];
    if !request.extra_args.is_empty() {
        inputs.push(format!("args: {}", request.extra_args.join(" ")));
    }
    inputs.push(format!("profile: {}", request.profile.canonical()));
    inputs
}

//! Test doubles for the overlay, launcher and bootstrap seams

use crate::config::EnvironmentConfig;
use crate::error::{ConbuilderError, ConbuilderResult};
use crate::layer::{LayerBuilder, LayerContext};
use crate::orchestrator::{Bootstrapper, OutputSink};
use crate::overlay::{OverlayFs, OverlaySpec};
use crate::sandbox::{CancelToken, ExitStatus, Invocation, ProcessOutcome, SandboxLauncher};
use async_trait::async_trait;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// Overlay stand-in: the merged path becomes a symlink to the upper dir, so
/// writes land where a real overlay would put them. Lowers are not visible.
#[derive(Default)]
pub struct FakeOverlay {
    active: AtomicUsize,
    failing_unmounts: AtomicUsize,
    fail_mount: AtomicBool,
}

impl FakeOverlay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Currently mounted targets
    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    pub fn fail_next_unmounts(&self, n: usize) {
        self.failing_unmounts.store(n, Ordering::SeqCst);
    }

    pub fn fail_next_mount(&self) {
        self.fail_mount.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl OverlayFs for FakeOverlay {
    async fn mount(&self, spec: &OverlaySpec) -> ConbuilderResult<()> {
        if self.fail_mount.swap(false, Ordering::SeqCst) {
            return Err(ConbuilderError::mount(&spec.target, "injected mount failure"));
        }
        fs::remove_dir(&spec.target)
            .map_err(|e| ConbuilderError::io("replacing mount target", e))?;
        std::os::unix::fs::symlink(&spec.upper, &spec.target)
            .map_err(|e| ConbuilderError::io("linking mount target", e))?;
        self.active.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn unmount(&self, target: &Path) -> ConbuilderResult<()> {
        let failing = self.failing_unmounts.load(Ordering::SeqCst);
        if failing > 0 {
            self.failing_unmounts.store(failing - 1, Ordering::SeqCst);
            return Err(ConbuilderError::mount(target, "target is busy"));
        }
        fs::remove_file(target).map_err(|e| ConbuilderError::io("unlinking mount target", e))?;
        fs::create_dir(target).map_err(|e| ConbuilderError::io("restoring mount target", e))?;
        self.active.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }

    fn name(&self) -> &'static str {
        "fake"
    }
}

/// Writes one file into the layer and counts its runs
pub struct CountingBuilder {
    file: String,
    delay: Duration,
    runs: AtomicUsize,
}

impl CountingBuilder {
    pub fn new(file: &str) -> Self {
        Self {
            file: file.to_string(),
            delay: Duration::ZERO,
            runs: AtomicUsize::new(0),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn count(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LayerBuilder for CountingBuilder {
    async fn build(&self, ctx: &LayerContext) -> ConbuilderResult<()> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let path = ctx.root.join(&self.file);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| ConbuilderError::io("creating parent", e))?;
        }
        fs::write(&path, self.file.as_bytes())
            .map_err(|e| ConbuilderError::io("writing layer file", e))?;
        Ok(())
    }

    fn describe(&self) -> Vec<String> {
        vec![format!("writes {}", self.file)]
    }
}

/// Writes a file, then fails
pub struct FailingBuilder;

#[async_trait]
impl LayerBuilder for FailingBuilder {
    async fn build(&self, ctx: &LayerContext) -> ConbuilderResult<()> {
        fs::write(ctx.root.join("partial"), b"half done")
            .map_err(|e| ConbuilderError::io("writing partial file", e))?;
        Err(ConbuilderError::command_exec("apt-get", "E: Unable to locate package"))
    }
}

/// Launcher that records invocations and plays back scripted results.
///
/// `dpkg-buildpackage` runs write the configured artifacts to the container
/// root, like the real build writes them next to `/srv`.
#[derive(Default)]
pub struct FakeLauncher {
    output: Vec<String>,
    exit_code: i32,
    failing: Option<(String, i32)>,
    artifacts: Vec<String>,
    block_builds: bool,
    source_seen: AtomicBool,
    invocations: Mutex<Vec<Invocation>>,
}

impl FakeLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Output lines returned by every run
    pub fn with_output(mut self, lines: &[&str]) -> Self {
        self.output = lines.iter().map(|l| l.to_string()).collect();
        self
    }

    /// Exit code of every run
    pub fn with_exit_code(mut self, code: i32) -> Self {
        self.exit_code = code;
        self
    }

    /// Exit with `code` when the command line contains `pattern`
    pub fn fail_on(mut self, pattern: &str, code: i32) -> Self {
        self.failing = Some((pattern.to_string(), code));
        self
    }

    pub fn with_artifacts(mut self, names: &[&str]) -> Self {
        self.artifacts = names.iter().map(|n| n.to_string()).collect();
        self
    }

    /// Package builds wait until cancelled
    pub fn block_builds(mut self) -> Self {
        self.block_builds = true;
        self
    }

    pub fn invocations(&self) -> Vec<Invocation> {
        self.invocations.lock().unwrap().clone()
    }

    /// Runs whose command line contains `pattern`
    pub fn count_matching(&self, pattern: &str) -> usize {
        self.invocations
            .lock()
            .unwrap()
            .iter()
            .filter(|i| i.display_command().contains(pattern))
            .count()
    }

    /// Whether a package build saw the source tree under /srv
    pub fn source_seen(&self) -> bool {
        self.source_seen.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SandboxLauncher for FakeLauncher {
    async fn run(
        &self,
        invocation: &Invocation,
        cancel: &CancelToken,
        on_output: &(dyn Fn(String) + Send + Sync),
    ) -> ConbuilderResult<ProcessOutcome> {
        self.invocations.lock().unwrap().push(invocation.clone());
        for line in &self.output {
            on_output(line.clone());
        }

        let is_build = invocation.command.first().map(String::as_str) == Some("dpkg-buildpackage");
        if is_build {
            if invocation.root.join("srv/debian/control").exists() {
                self.source_seen.store(true, Ordering::SeqCst);
            }
            if self.block_builds {
                cancel.cancelled().await;
                return Ok(ProcessOutcome {
                    status: ExitStatus::Cancelled,
                    output: self.output.clone(),
                });
            }
        }

        let code = match &self.failing {
            Some((pattern, code)) if invocation.display_command().contains(pattern.as_str()) => {
                *code
            }
            _ => self.exit_code,
        };

        if is_build && code == 0 {
            for name in &self.artifacts {
                fs::write(invocation.root.join(name), name.as_bytes())
                    .map_err(|e| ConbuilderError::io("writing artifact", e))?;
            }
        }

        Ok(ProcessOutcome {
            status: ExitStatus::Exited(code),
            output: self.output.clone(),
        })
    }

    fn name(&self) -> &'static str {
        "fake"
    }
}

/// Bootstrapper producing a minimal tree with /etc and apt
#[derive(Default)]
pub struct FakeBootstrap {
    runs: AtomicUsize,
}

impl FakeBootstrap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Bootstrapper for FakeBootstrap {
    async fn bootstrap(
        &self,
        env: &EnvironmentConfig,
        target: &Path,
        _cancel: &CancelToken,
        on_output: OutputSink<'_>,
    ) -> ConbuilderResult<()> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        on_output(format!("I: Retrieving {} release", env.codename));
        fs::create_dir_all(target.join("etc"))
            .and_then(|_| fs::create_dir_all(target.join("usr/bin")))
            .and_then(|_| fs::write(target.join("usr/bin/apt"), b"#!/bin/sh\n"))
            .map_err(|e| ConbuilderError::io("writing fake root", e))?;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "fake-bootstrap"
    }
}

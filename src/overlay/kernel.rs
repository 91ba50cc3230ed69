//! Kernel overlayfs via mount(8)
//!
//! Implements the OverlayFs trait by executing `mount` and `umount`.
//! Requires root (or CAP_SYS_ADMIN) on the host.

use crate::error::{ConbuilderError, ConbuilderResult};
use crate::overlay::{OverlayFs, OverlaySpec};
use async_trait::async_trait;
use std::path::Path;
use std::process::Stdio;
use tokio::process::Command;
use tracing::debug;

/// Overlay backend using the host's mount(8)
pub struct KernelOverlay;

impl KernelOverlay {
    pub fn new() -> Self {
        Self
    }

    /// Execute a command and return its output
    async fn exec(&self, program: &str, args: &[&str]) -> ConbuilderResult<std::process::Output> {
        debug!("Executing: {} {:?}", program, args);

        Command::new(program)
            .args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| ConbuilderError::command_failed(format!("{} {:?}", program, args), e))
    }
}

impl Default for KernelOverlay {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl OverlayFs for KernelOverlay {
    async fn mount(&self, spec: &OverlaySpec) -> ConbuilderResult<()> {
        if spec.lowers.is_empty() {
            return Err(ConbuilderError::mount(
                &spec.target,
                "overlay needs at least one lower directory",
            ));
        }

        let options = spec.mount_options();
        let target = spec.target.display().to_string();
        let output = self
            .exec("mount", &["-t", "overlay", "overlay", "-o", &options, &target])
            .await?;

        if output.status.success() {
            Ok(())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(ConbuilderError::mount(&spec.target, stderr.trim()))
        }
    }

    async fn unmount(&self, target: &Path) -> ConbuilderResult<()> {
        let output = self.exec("umount", &[&target.display().to_string()]).await?;

        if output.status.success() {
            return Ok(());
        }

        // Already gone counts as unmounted
        let stderr = String::from_utf8_lossy(&output.stderr);
        if stderr.contains("not mounted") || stderr.contains("no mount point") {
            debug!("{} was not mounted", target.display());
            Ok(())
        } else {
            Err(ConbuilderError::mount(target, stderr.trim()))
        }
    }

    fn name(&self) -> &'static str {
        "kernel overlayfs"
    }
}

//! Overlay filesystem primitive
//!
//! conbuilder does not implement a filesystem; it asks the kernel for an
//! overlay mount through this narrow interface:
//! - `KernelOverlay`: shells out to `mount -t overlay` / `umount`

mod kernel;

pub use kernel::KernelOverlay;

use crate::error::ConbuilderResult;
use async_trait::async_trait;
use std::path::{Path, PathBuf};

/// Directories that make up one overlay mount
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OverlaySpec {
    /// Read-only lower directories, top first
    pub lowers: Vec<PathBuf>,
    /// Private writable directory
    pub upper: PathBuf,
    /// Overlay scratch directory, same filesystem as `upper`
    pub work: PathBuf,
    /// Mount point for the merged view
    pub target: PathBuf,
}

impl OverlaySpec {
    /// Render the `-o` option string for `mount -t overlay`
    pub fn mount_options(&self) -> String {
        let lowers: Vec<String> = self
            .lowers
            .iter()
            .map(|p| p.display().to_string())
            .collect();
        format!(
            "lowerdir={},upperdir={},workdir={}",
            lowers.join(":"),
            self.upper.display(),
            self.work.display()
        )
    }
}

/// Mount and unmount overlay filesystems
#[async_trait]
pub trait OverlayFs: Send + Sync {
    /// Mount `spec.target` as an overlay of the given directories
    async fn mount(&self, spec: &OverlaySpec) -> ConbuilderResult<()>;

    /// Unmount a previously mounted target
    async fn unmount(&self, target: &Path) -> ConbuilderResult<()>;

    /// Human-readable backend name for display
    fn name(&self) -> &'static str;
}

//! Configuration schema for conbuilder
//!
//! Configuration is stored at `~/.config/conbuilder/config.toml`

use crate::error::{ConbuilderError, ConbuilderResult};
use crate::eviction::EvictionPolicy;
use crate::layer::Tier;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Root configuration structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// General settings
    pub general: GeneralConfig,

    /// Layer store location and mount handling
    pub store: StoreConfig,

    /// Target environment of the base layer
    pub environment: EnvironmentConfig,

    /// Package build settings
    pub build: BuildConfig,

    /// Per-tier eviction thresholds
    pub eviction: EvictionConfig,

    /// Default sandbox profile for builds
    pub sandbox: SandboxConfig,
}

impl Config {
    /// Reject values the rest of the program cannot work with
    pub fn validate(&self, path: &Path) -> ConbuilderResult<()> {
        let invalid = |reason: String| ConbuilderError::ConfigInvalid {
            path: path.to_path_buf(),
            reason,
        };

        let cache = &self.store.cache_dir;
        if cache.as_os_str().is_empty() || cache == Path::new("/") {
            return Err(invalid(format!(
                "store.cache_dir must not be empty or '/', got '{}'",
                cache.display()
            )));
        }
        if !matches!(self.general.log_format.as_str(), "text" | "json") {
            return Err(invalid(format!(
                "general.log_format must be \"text\" or \"json\", got \"{}\"",
                self.general.log_format
            )));
        }
        if self.environment.codename.trim().is_empty() {
            return Err(invalid("environment.codename must not be empty".to_string()));
        }
        if self.environment.mirror.trim().is_empty() {
            return Err(invalid("environment.mirror must not be empty".to_string()));
        }
        if self.build.artifact_extensions.is_empty() {
            return Err(invalid("build.artifact_extensions must not be empty".to_string()));
        }
        Ok(())
    }
}

/// General application settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Log format: "text" or "json"
    pub log_format: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_format: "text".to_string(),
        }
    }
}

/// Layer store configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Where all the layers are stored
    pub cache_dir: PathBuf,

    /// Extra unmount attempts before giving up
    pub unmount_retries: u32,

    /// Delay between unmount attempts
    pub unmount_retry_delay_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            cache_dir: PathBuf::from("/var/cache/conbuilder"),
            unmount_retries: 3,
            unmount_retry_delay_ms: 500,
        }
    }
}

/// Target environment configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnvironmentConfig {
    /// Release codename to bootstrap
    pub codename: String,

    /// Package mirror used by debootstrap
    pub mirror: String,

    /// Extra packages installed into the base layer
    pub include: Vec<String>,
}

impl Default for EnvironmentConfig {
    fn default() -> Self {
        Self {
            codename: "sid".to_string(),
            mirror: "http://deb.debian.org/debian".to_string(),
            include: vec!["apt".to_string()],
        }
    }
}

/// Package build configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildConfig {
    /// Where to copy the generated .deb .changes .dsc ... files
    pub export_dir: PathBuf,

    /// Directory inside the build root where artifacts appear
    pub output_dir: String,

    /// File extensions collected as artifacts
    pub artifact_extensions: Vec<String>,

    /// Evict old build layers after each build
    pub auto_evict: bool,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            export_dir: PathBuf::from("../build-area"),
            output_dir: "/".to_string(),
            artifact_extensions: ["deb", "changes", "xz", "gz", "buildinfo", "dsc"]
                .into_iter()
                .map(String::from)
                .collect(),
            auto_evict: true,
        }
    }
}

/// Age and count thresholds for one tier
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TierThresholds {
    /// Remove layers not used for this many days
    pub max_age_days: u32,

    /// Keep at most this many layers
    pub max_count: usize,
}

impl TierThresholds {
    pub fn policy(&self) -> EvictionPolicy {
        EvictionPolicy::new(self.max_age_days, self.max_count)
    }
}

/// Eviction thresholds per tier
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EvictionConfig {
    pub build: TierThresholds,
    pub dependencies: TierThresholds,
}

impl Default for EvictionConfig {
    fn default() -> Self {
        Self {
            build: TierThresholds {
                max_age_days: 30,
                max_count: 10,
            },
            dependencies: TierThresholds {
                max_age_days: 90,
                max_count: 20,
            },
        }
    }
}

impl EvictionConfig {
    /// Policies for every evictable tier
    pub fn policies(&self) -> Vec<(Tier, EvictionPolicy)> {
        vec![
            (Tier::Build, self.build.policy()),
            (Tier::Dependencies, self.dependencies.policy()),
        ]
    }

    pub fn for_tier(&self, tier: Tier) -> Option<EvictionPolicy> {
        match tier {
            Tier::Build => Some(self.build.policy()),
            Tier::Dependencies => Some(self.dependencies.policy()),
            Tier::Base => None,
        }
    }
}

/// Default sandbox profile for builds
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    /// Allow network access during the build
    pub network: bool,

    /// Optional capabilities to keep (CAP_CHOWN, CAP_SETUID, ...)
    pub allow_capabilities: Vec<String>,

    /// Syscalls or @groups to allow, see systemd.exec(5)
    pub syscall_allow: Vec<String>,

    /// Syscalls or @groups to deny
    pub syscall_deny: Vec<String>,
}

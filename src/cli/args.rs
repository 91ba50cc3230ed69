//! CLI argument definitions using clap derive

use crate::layer::Tier;
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// conbuilder - build Debian packages on cached overlay layers
///
/// Layers are created, reused and purged automatically: a base system
/// (L1), build dependencies (L2) and the build itself (L3), each an
/// overlay on top of the previous one, run in a systemd-nspawn container.
#[derive(Parser, Debug)]
#[command(name = "conbuilder")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Increase verbosity (-v info, -vv debug)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    pub verbose: u8,

    /// Configuration file path
    #[arg(short, long, global = true, env = "CONBUILDER_CONFIG")]
    pub config: Option<PathBuf>,

    /// Release codename, overrides environment.codename
    #[arg(long, global = true)]
    pub codename: Option<String>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Bootstrap the base layer
    Create,

    /// Refresh the base layer; the old one is superseded
    Update(UpdateArgs),

    /// Build the package in the current directory
    Build(BuildArgs),

    /// Try installing package files in a throwaway container
    Install(InstallArgs),

    /// Evict old layers
    Purge(PurgeArgs),

    /// Show layers and active mounts
    Show(ShowArgs),

    /// Show or edit configuration
    Config(ConfigArgs),
}

#[derive(Parser, Debug)]
pub struct UpdateArgs {
    /// Bootstrap from scratch instead of upgrading the current base
    #[arg(long)]
    pub rebootstrap: bool,
}

#[derive(Parser, Debug)]
pub struct BuildArgs {
    /// Source package directory (defaults to current directory)
    #[arg(short, long)]
    pub source: Option<PathBuf>,

    /// Where to copy the built files, overrides build.export_dir
    #[arg(short, long)]
    pub export_dir: Option<PathBuf>,

    /// Allow network access during the build
    #[arg(long)]
    pub network: bool,

    /// Keep an optional capability (e.g. CAP_CHOWN); repeatable
    #[arg(long = "allow-cap", value_name = "CAP")]
    pub allow_capabilities: Vec<String>,

    /// Allow a syscall or @group; repeatable
    #[arg(long, value_name = "SYSCALL")]
    pub syscall_allow: Vec<String>,

    /// Deny a syscall or @group; repeatable
    #[arg(long, value_name = "SYSCALL")]
    pub syscall_deny: Vec<String>,

    /// Build even if an identical build is cached
    #[arg(long)]
    pub rebuild: bool,

    /// Arguments passed to dpkg-buildpackage
    #[arg(last = true)]
    pub extra_args: Vec<String>,
}

#[derive(Parser, Debug)]
pub struct InstallArgs {
    /// .deb files to install
    #[arg(required = true)]
    pub packages: Vec<PathBuf>,
}

#[derive(Parser, Debug)]
pub struct PurgeArgs {
    /// Only this tier; all evictable tiers by default
    #[arg(long, value_enum)]
    pub tier: Option<TierArg>,

    /// Show what would be removed
    #[arg(long)]
    pub dry_run: bool,

    /// Skip the confirmation prompt
    #[arg(short, long)]
    pub yes: bool,
}

/// Tiers that eviction applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum TierArg {
    Build,
    Dependencies,
}

impl From<TierArg> for Tier {
    fn from(arg: TierArg) -> Self {
        match arg {
            TierArg::Build => Tier::Build,
            TierArg::Dependencies => Tier::Dependencies,
        }
    }
}

#[derive(Parser, Debug)]
pub struct ShowArgs {
    /// Output format
    #[arg(short, long, default_value = "table")]
    pub format: OutputFormat,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable table
    Table,
    /// JSON output
    Json,
    /// Layer ids only
    Plain,
}

#[derive(Parser, Debug)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub action: Option<ConfigAction>,
}

#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Show current configuration
    Show,

    /// Show configuration file path
    Path,

    /// Write the default configuration
    Init {
        /// Overwrite existing configuration
        #[arg(short, long)]
        force: bool,
    },

    /// Set a configuration value
    Set {
        /// Configuration key (e.g. environment.codename)
        key: String,
        /// Value to set
        value: String,
    },
}

//! Sandbox profiles
//!
//! A profile is the declarative half of the sandbox: what a build may do.
//! Anything not listed is denied.

use crate::config::SandboxConfig;
use crate::error::{ConbuilderError, ConbuilderResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

macro_rules! capabilities {
    ($($variant:ident = $index:literal => $name:literal),* $(,)?) => {
        /// Linux capabilities by kernel number
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(try_from = "String", into = "String")]
        pub enum Capability {
            $($variant),*
        }

        impl Capability {
            pub const ALL: &'static [Capability] = &[$(Capability::$variant),*];

            /// Kernel capability number
            pub fn index(&self) -> u32 {
                match self {
                    $(Self::$variant => $index),*
                }
            }

            /// Canonical `CAP_*` name
            pub fn name(&self) -> &'static str {
                match self {
                    $(Self::$variant => $name),*
                }
            }
        }
    };
}

capabilities! {
    Chown = 0 => "CAP_CHOWN",
    DacOverride = 1 => "CAP_DAC_OVERRIDE",
    DacReadSearch = 2 => "CAP_DAC_READ_SEARCH",
    Fowner = 3 => "CAP_FOWNER",
    Fsetid = 4 => "CAP_FSETID",
    Kill = 5 => "CAP_KILL",
    Setgid = 6 => "CAP_SETGID",
    Setuid = 7 => "CAP_SETUID",
    Setpcap = 8 => "CAP_SETPCAP",
    LinuxImmutable = 9 => "CAP_LINUX_IMMUTABLE",
    NetBindService = 10 => "CAP_NET_BIND_SERVICE",
    NetBroadcast = 11 => "CAP_NET_BROADCAST",
    NetAdmin = 12 => "CAP_NET_ADMIN",
    NetRaw = 13 => "CAP_NET_RAW",
    IpcLock = 14 => "CAP_IPC_LOCK",
    IpcOwner = 15 => "CAP_IPC_OWNER",
    SysModule = 16 => "CAP_SYS_MODULE",
    SysRawio = 17 => "CAP_SYS_RAWIO",
    SysChroot = 18 => "CAP_SYS_CHROOT",
    SysPtrace = 19 => "CAP_SYS_PTRACE",
    SysPacct = 20 => "CAP_SYS_PACCT",
    SysAdmin = 21 => "CAP_SYS_ADMIN",
    SysBoot = 22 => "CAP_SYS_BOOT",
    SysNice = 23 => "CAP_SYS_NICE",
    SysResource = 24 => "CAP_SYS_RESOURCE",
    SysTime = 25 => "CAP_SYS_TIME",
    SysTtyConfig = 26 => "CAP_SYS_TTY_CONFIG",
    Mknod = 27 => "CAP_MKNOD",
    Lease = 28 => "CAP_LEASE",
    AuditWrite = 29 => "CAP_AUDIT_WRITE",
    AuditControl = 30 => "CAP_AUDIT_CONTROL",
    Setfcap = 31 => "CAP_SETFCAP",
    MacOverride = 32 => "CAP_MAC_OVERRIDE",
    MacAdmin = 33 => "CAP_MAC_ADMIN",
    Syslog = 34 => "CAP_SYSLOG",
    WakeAlarm = 35 => "CAP_WAKE_ALARM",
    BlockSuspend = 36 => "CAP_BLOCK_SUSPEND",
    AuditRead = 37 => "CAP_AUDIT_READ",
    Perfmon = 38 => "CAP_PERFMON",
    Bpf = 39 => "CAP_BPF",
    CheckpointRestore = 40 => "CAP_CHECKPOINT_RESTORE",
}

/// Capabilities a systemd-nspawn container keeps unless told otherwise
pub const CONTAINER_DEFAULT_CAPABILITIES: &[Capability] = &[
    Capability::AuditControl,
    Capability::AuditWrite,
    Capability::Chown,
    Capability::DacOverride,
    Capability::DacReadSearch,
    Capability::Fowner,
    Capability::Fsetid,
    Capability::IpcOwner,
    Capability::Kill,
    Capability::Lease,
    Capability::LinuxImmutable,
    Capability::Mknod,
    Capability::NetBindService,
    Capability::NetBroadcast,
    Capability::NetRaw,
    Capability::Setfcap,
    Capability::Setgid,
    Capability::Setpcap,
    Capability::Setuid,
    Capability::SysAdmin,
    Capability::SysBoot,
    Capability::SysChroot,
    Capability::SysNice,
    Capability::SysPtrace,
    Capability::SysResource,
    Capability::SysTtyConfig,
];

/// Container defaults that a package build does not normally need.
/// Dropped unless a profile allows them.
pub const OPTIONAL_CAPABILITIES: &[Capability] = &[
    Capability::Chown,
    Capability::DacReadSearch,
    Capability::Fowner,
    Capability::Fsetid,
    Capability::IpcOwner,
    Capability::Kill,
    Capability::Lease,
    Capability::LinuxImmutable,
    Capability::NetBindService,
    Capability::NetBroadcast,
    Capability::NetRaw,
    Capability::Setgid,
    Capability::Setfcap,
    Capability::Setpcap,
    Capability::Setuid,
    Capability::SysAdmin,
    Capability::SysChroot,
    Capability::SysNice,
    Capability::SysPtrace,
    Capability::SysTtyConfig,
    Capability::SysResource,
    Capability::SysBoot,
    Capability::AuditWrite,
    Capability::AuditControl,
];

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for Capability {
    type Err = ConbuilderError;

    /// Accepts `CAP_CHOWN`, `cap_chown` or `chown`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let upper = s.trim().to_ascii_uppercase();
        let wanted = if upper.starts_with("CAP_") {
            upper
        } else {
            format!("CAP_{}", upper)
        };
        Self::ALL
            .iter()
            .copied()
            .find(|cap| cap.name() == wanted)
            .ok_or_else(|| ConbuilderError::UnsupportedProfile(format!("unknown capability '{}'", s)))
    }
}

impl TryFrom<String> for Capability {
    type Error = ConbuilderError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Capability> for String {
    fn from(cap: Capability) -> Self {
        cap.name().to_string()
    }
}

/// What one build is allowed to do
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxProfile {
    /// Network access; off means a private network namespace
    pub network: bool,
    /// Optional capabilities to keep
    pub allow_capabilities: BTreeSet<Capability>,
    /// Syscalls (or `@group`s) to allow on top of the container default filter
    pub syscall_allow: BTreeSet<String>,
    /// Syscalls (or `@group`s) to deny
    pub syscall_deny: BTreeSet<String>,
}

impl SandboxProfile {
    /// Nothing permitted
    pub fn locked_down() -> Self {
        Self::default()
    }

    /// Profile for layer construction: network on, container default capabilities
    pub fn construction() -> Self {
        Self {
            network: true,
            allow_capabilities: OPTIONAL_CAPABILITIES.iter().copied().collect(),
            ..Self::default()
        }
    }

    pub fn from_config(config: &SandboxConfig) -> ConbuilderResult<Self> {
        let allow_capabilities = config
            .allow_capabilities
            .iter()
            .map(|name| name.parse())
            .collect::<ConbuilderResult<BTreeSet<Capability>>>()?;

        Ok(Self {
            network: config.network,
            allow_capabilities,
            syscall_allow: config.syscall_allow.iter().map(|s| s.trim().to_string()).collect(),
            syscall_deny: config.syscall_deny.iter().map(|s| s.trim().to_string()).collect(),
        })
    }

    /// Canonical text used when fingerprinting a build
    pub fn canonical(&self) -> String {
        let caps: Vec<&str> = self.allow_capabilities.iter().map(|c| c.name()).collect();
        let allow: Vec<&str> = self.syscall_allow.iter().map(String::as_str).collect();
        let deny: Vec<&str> = self.syscall_deny.iter().map(String::as_str).collect();
        format!(
            "network={};caps={};allow={};deny={}",
            self.network,
            caps.join(","),
            allow.join(","),
            deny.join(",")
        )
    }
}

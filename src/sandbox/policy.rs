//! Profile compilation
//!
//! Turns a [`SandboxProfile`] into the concrete isolation settings for one
//! container. Compilation is pure: the host's capabilities are described by a
//! [`HostSupport`] value probed once up front, so the same profile always
//! compiles to the same spec on the same host.

use crate::error::{ConbuilderError, ConbuilderResult};
use crate::sandbox::profile::{
    Capability, SandboxProfile, CONTAINER_DEFAULT_CAPABILITIES, OPTIONAL_CAPABILITIES,
};
use serde::Serialize;
use std::collections::BTreeSet;
use std::fmt;
use std::fs;
use tracing::debug;

/// Highest capability number known to this build of conbuilder
const KNOWN_LAST_CAPABILITY: u32 = 40;

/// Isolation primitives available on the host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct HostSupport {
    /// Kernel supports seccomp syscall filtering
    pub seccomp: bool,
    /// Network namespaces can be created
    pub net_namespace: bool,
    /// Highest capability number the kernel knows
    pub last_capability: u32,
}

impl HostSupport {
    /// Read the host's support from procfs
    pub fn probe() -> Self {
        let seccomp = fs::read_to_string("/proc/self/status")
            .map(|status| status.lines().any(|l| l.starts_with("Seccomp:")))
            .unwrap_or(false);
        let net_namespace = std::path::Path::new("/proc/self/ns/net").exists();
        let last_capability = fs::read_to_string("/proc/sys/kernel/cap_last_cap")
            .ok()
            .and_then(|s| s.trim().parse().ok())
            .unwrap_or(KNOWN_LAST_CAPABILITY);

        let support = Self {
            seccomp,
            net_namespace,
            last_capability,
        };
        debug!(?support, "Probed host sandbox support");
        support
    }

    /// A host with every primitive available
    pub fn full() -> Self {
        Self {
            seccomp: true,
            net_namespace: true,
            last_capability: KNOWN_LAST_CAPABILITY,
        }
    }
}

/// Namespaces a container is placed in
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Namespace {
    Mount,
    Pid,
    Ipc,
    Uts,
    Net,
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Mount => "mount",
            Self::Pid => "pid",
            Self::Ipc => "ipc",
            Self::Uts => "uts",
            Self::Net => "net",
        };
        write!(f, "{}", name)
    }
}

/// Syscall filter applied on top of the container manager's own
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyscallFilter {
    /// Container manager default, nothing added
    HostDefault,
    Rules {
        allow: Vec<String>,
        deny: Vec<String>,
    },
}

/// Concrete isolation settings for one container
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SandboxSpec {
    pub namespaces: BTreeSet<Namespace>,
    /// Capabilities the container keeps
    pub retained_capabilities: BTreeSet<Capability>,
    /// Container defaults taken away
    pub dropped_capabilities: BTreeSet<Capability>,
    /// Capabilities granted beyond the container defaults
    pub added_capabilities: BTreeSet<Capability>,
    pub syscall_filter: SyscallFilter,
}

impl SandboxSpec {
    pub fn network_enabled(&self) -> bool {
        !self.namespaces.contains(&Namespace::Net)
    }
}

/// Compiles profiles against a fixed host description
#[derive(Debug, Clone, Copy)]
pub struct SandboxPolicy {
    host: HostSupport,
}

impl SandboxPolicy {
    pub fn new(host: HostSupport) -> Self {
        Self { host }
    }

    pub fn host(&self) -> HostSupport {
        self.host
    }

    pub fn compile(&self, profile: &SandboxProfile) -> ConbuilderResult<SandboxSpec> {
        let mut namespaces: BTreeSet<Namespace> =
            [Namespace::Mount, Namespace::Pid, Namespace::Ipc, Namespace::Uts]
                .into_iter()
                .collect();

        if !profile.network {
            if !self.host.net_namespace {
                return Err(ConbuilderError::UnsupportedProfile(
                    "network isolation requested but network namespaces are unavailable"
                        .to_string(),
                ));
            }
            namespaces.insert(Namespace::Net);
        }

        if let Some(cap) = profile
            .allow_capabilities
            .iter()
            .find(|cap| cap.index() > self.host.last_capability)
        {
            return Err(ConbuilderError::UnsupportedProfile(format!(
                "{} (number {}) is not known to this kernel (last capability {})",
                cap,
                cap.index(),
                self.host.last_capability
            )));
        }

        let defaults: BTreeSet<Capability> = CONTAINER_DEFAULT_CAPABILITIES.iter().copied().collect();
        let optional: BTreeSet<Capability> = OPTIONAL_CAPABILITIES.iter().copied().collect();

        let dropped: BTreeSet<Capability> = optional
            .difference(&profile.allow_capabilities)
            .copied()
            .collect();
        let added: BTreeSet<Capability> = profile
            .allow_capabilities
            .difference(&defaults)
            .copied()
            .collect();
        let retained: BTreeSet<Capability> = defaults
            .difference(&dropped)
            .copied()
            .chain(added.iter().copied())
            .collect();

        let syscall_filter = self.compile_syscalls(profile)?;

        Ok(SandboxSpec {
            namespaces,
            retained_capabilities: retained,
            dropped_capabilities: dropped,
            added_capabilities: added,
            syscall_filter,
        })
    }

    fn compile_syscalls(&self, profile: &SandboxProfile) -> ConbuilderResult<SyscallFilter> {
        if profile.syscall_allow.is_empty() && profile.syscall_deny.is_empty() {
            return Ok(SyscallFilter::HostDefault);
        }

        if let Some(bad) = profile
            .syscall_allow
            .iter()
            .chain(profile.syscall_deny.iter())
            .find(|name| !valid_syscall_name(name))
        {
            return Err(ConbuilderError::UnsupportedProfile(format!(
                "malformed syscall name '{}'",
                bad
            )));
        }

        let both: Vec<&str> = profile
            .syscall_allow
            .intersection(&profile.syscall_deny)
            .map(String::as_str)
            .collect();
        if !both.is_empty() {
            return Err(ConbuilderError::UnsupportedProfile(format!(
                "syscall(s) both allowed and denied: {}",
                both.join(", ")
            )));
        }

        if !self.host.seccomp {
            return Err(ConbuilderError::UnsupportedProfile(
                "syscall filtering requested but seccomp is unavailable".to_string(),
            ));
        }

        Ok(SyscallFilter::Rules {
            allow: profile.syscall_allow.iter().cloned().collect(),
            deny: profile.syscall_deny.iter().cloned().collect(),
        })
    }
}

/// Plain syscall names or `@group` sets as understood by systemd
fn valid_syscall_name(name: &str) -> bool {
    let (body, extra) = match name.strip_prefix('@') {
        Some(group) => (group, '-'),
        None => (name, '_'),
    };
    !body.is_empty()
        && body
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == extra)
}

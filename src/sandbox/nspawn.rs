//! systemd-nspawn launcher
//!
//! Implements the SandboxLauncher trait by executing `systemd-nspawn`
//! directly. Requires root on the host.

use crate::error::{ConbuilderError, ConbuilderResult};
use crate::sandbox::launcher::{
    run_child, BindMode, CancelToken, Invocation, ProcessOutcome, SandboxLauncher,
};
use crate::sandbox::policy::SyscallFilter;
use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

const NSPAWN: &str = "systemd-nspawn";

/// Launcher backed by systemd-nspawn
pub struct NspawnLauncher;

impl NspawnLauncher {
    pub fn new() -> Self {
        Self
    }

    /// Render the full argument list for an invocation
    pub fn args(&self, inv: &Invocation) -> Vec<String> {
        let spec = &inv.spec;
        let mut args = vec![
            "--quiet".to_string(),
            format!("--machine={}", inv.machine),
            format!("--directory={}", inv.root.display()),
            format!("--chdir={}", inv.workdir),
        ];

        if !spec.network_enabled() {
            args.push("--private-network".to_string());
        }

        if inv.read_only {
            args.push("--read-only".to_string());
        }

        if !spec.dropped_capabilities.is_empty() {
            let names: Vec<&str> = spec.dropped_capabilities.iter().map(|c| c.name()).collect();
            args.push(format!("--drop-capability={}", names.join(",")));
        }

        if !spec.added_capabilities.is_empty() {
            let names: Vec<&str> = spec.added_capabilities.iter().map(|c| c.name()).collect();
            args.push(format!("--capability={}", names.join(",")));
        }

        if let SyscallFilter::Rules { allow, deny } = &spec.syscall_filter {
            if !allow.is_empty() {
                args.push(format!("--system-call-filter={}", allow.join(" ")));
            }
            if !deny.is_empty() {
                args.push(format!("--system-call-filter=~{}", deny.join(" ")));
            }
        }

        for bind in &inv.binds {
            match bind.mode {
                BindMode::ReadOnly => {
                    args.push(format!("--bind-ro={}:{}", bind.source.display(), bind.target))
                }
                BindMode::Overlay => {
                    args.push(format!("--overlay={}::{}", bind.source.display(), bind.target))
                }
            }
        }

        for (key, value) in &inv.env {
            args.push(format!("--setenv={}={}", key, value));
        }

        args.push("--".to_string());
        args.extend(inv.command.iter().cloned());
        args
    }
}

impl Default for NspawnLauncher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SandboxLauncher for NspawnLauncher {
    async fn run(
        &self,
        invocation: &Invocation,
        cancel: &CancelToken,
        on_output: &(dyn Fn(String) + Send + Sync),
    ) -> ConbuilderResult<ProcessOutcome> {
        if invocation.command.is_empty() {
            return Err(ConbuilderError::Internal(
                "container invocation without a command".to_string(),
            ));
        }

        let args = self.args(invocation);
        debug!("Executing: {} {}", NSPAWN, args.join(" "));

        let mut command = Command::new(NSPAWN);
        command.args(&args);
        let outcome = run_child(command, NSPAWN, cancel, on_output).await?;

        debug!(machine = %invocation.machine, status = %outcome.status, "Container run finished");
        Ok(outcome)
    }

    fn name(&self) -> &'static str {
        "systemd-nspawn"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::{Capability, HostSupport, SandboxPolicy, SandboxProfile};

    fn invocation(profile: &SandboxProfile) -> Invocation {
        let spec = SandboxPolicy::new(HostSupport::full()).compile(profile).unwrap();
        Invocation::new("conbuilder-abc", "/cache/mounts/abc/merged", spec)
            .command(["dpkg-buildpackage", "-us", "-uc"])
    }

    #[test]
    fn locked_down_build_args() {
        let args = NspawnLauncher::new().args(&invocation(&SandboxProfile::locked_down()));

        assert!(args.contains(&"--machine=conbuilder-abc".to_string()));
        assert!(args.contains(&"--directory=/cache/mounts/abc/merged".to_string()));
        assert!(args.contains(&"--chdir=/srv".to_string()));
        assert!(args.contains(&"--private-network".to_string()));
        let drop = args
            .iter()
            .find(|a| a.starts_with("--drop-capability="))
            .unwrap();
        assert!(drop.contains("CAP_SYS_ADMIN"));
        assert!(drop.contains("CAP_CHOWN"));
        assert!(!args.iter().any(|a| a.starts_with("--system-call-filter")));

        let sep = args.iter().position(|a| a == "--").unwrap();
        assert_eq!(&args[sep + 1..], ["dpkg-buildpackage", "-us", "-uc"]);
    }

    #[test]
    fn network_and_syscalls_rendered() {
        let mut profile = SandboxProfile::locked_down();
        profile.network = true;
        profile.allow_capabilities = Capability::ALL
            .iter()
            .copied()
            .filter(|c| crate::sandbox::OPTIONAL_CAPABILITIES.contains(c))
            .collect();
        profile.syscall_deny.insert("ptrace".to_string());
        profile.syscall_deny.insert("@raw-io".to_string());

        let args = NspawnLauncher::new().args(&invocation(&profile));

        assert!(!args.contains(&"--private-network".to_string()));
        assert!(!args.iter().any(|a| a.starts_with("--drop-capability")));
        assert!(args.contains(&"--system-call-filter=~@raw-io ptrace".to_string()));
    }

    #[test]
    fn binds_env_and_read_only() {
        let inv = invocation(&SandboxProfile::construction())
            .bind("/home/u/pkg", "/srv", BindMode::Overlay)
            .bind("/tmp/debs", "/debs", BindMode::ReadOnly)
            .env("DEBIAN_FRONTEND", "noninteractive")
            .read_only();
        let args = NspawnLauncher::new().args(&inv);

        assert!(args.contains(&"--overlay=/home/u/pkg::/srv".to_string()));
        assert!(args.contains(&"--bind-ro=/tmp/debs:/debs".to_string()));
        assert!(args.contains(&"--setenv=DEBIAN_FRONTEND=noninteractive".to_string()));
        assert!(args.contains(&"--read-only".to_string()));
    }

    #[tokio::test]
    async fn empty_command_rejected() {
        let spec = SandboxPolicy::new(HostSupport::full())
            .compile(&SandboxProfile::locked_down())
            .unwrap();
        let inv = Invocation::new("conbuilder-x", "/nonexistent", spec);
        let result = NspawnLauncher::new()
            .run(&inv, &CancelToken::never(), &|_| {})
            .await;
        assert!(result.is_err());
    }
}

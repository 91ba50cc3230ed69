//! Build sandbox
//!
//! Split into a pure half and an enforcing half:
//! - `profile` / `policy`: what a build may do, compiled into a [`SandboxSpec`]
//!   against the host's [`HostSupport`]
//! - `launcher` / `nspawn`: running a command confined by a spec

mod launcher;
mod nspawn;
mod policy;
mod profile;

pub use launcher::{
    Bind, BindMode, CancelHandle, CancelToken, ExitStatus, Invocation, ProcessOutcome,
    SandboxLauncher,
};
pub(crate) use launcher::run_child;
pub use nspawn::NspawnLauncher;
pub use policy::{HostSupport, Namespace, SandboxPolicy, SandboxSpec, SyscallFilter};
pub use profile::{Capability, SandboxProfile, CONTAINER_DEFAULT_CAPABILITIES, OPTIONAL_CAPABILITIES};

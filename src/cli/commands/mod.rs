//! CLI command implementations

pub mod build;
pub mod config;
pub mod create;
pub mod install;
pub mod purge;
pub mod show;
pub mod update;

pub use build::execute as build;
pub use config::execute as config;
pub use create::execute as create;
pub use install::execute as install;
pub use purge::execute as purge;
pub use show::execute as show;
pub use update::execute as update;

use crate::config::Config;
use crate::error::ConbuilderResult;
use crate::orchestrator::Orchestrator;
use tracing::info;

/// Orchestrator on the host backends, with mounts of dead processes cleaned up
async fn open_orchestrator(config: &Config) -> ConbuilderResult<Orchestrator> {
    let orchestrator = Orchestrator::from_config(config)?;
    let reaped = orchestrator.store().reap_stale_mounts().await?;
    if !reaped.is_empty() {
        info!("Cleaned up {} stale mount(s)", reaped.len());
    }
    Ok(orchestrator)
}

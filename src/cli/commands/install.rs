//! Install command - test-install packages in a throwaway container

use super::open_orchestrator;
use crate::cli::args::InstallArgs;
use crate::config::Config;
use crate::error::ConbuilderResult;
use crate::sandbox::CancelToken;
use crate::ui::{self, BuildProgress, UiContext};

/// Execute the install command
pub async fn execute(args: InstallArgs, config: &Config, cancel: &CancelToken) -> ConbuilderResult<()> {
    let ctx = UiContext::detect();
    let env = &config.environment;
    let orchestrator = open_orchestrator(config).await?;

    ui::intro(&ctx, &format!("Installing into {}", env.codename));
    for package in &args.packages {
        ui::remark(&ctx, &package.display().to_string());
    }

    let progress = BuildProgress::new(&ctx, "Installing");
    let result = orchestrator
        .install(env, &args.packages, cancel, &|line| progress.on_line(line))
        .await;
    progress.finish();

    result?;
    ui::outro_success(
        &ctx,
        &format!("{} package(s) installed cleanly", args.packages.len()),
    );
    Ok(())
}

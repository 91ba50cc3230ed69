//! Create command - bootstrap the base layer

use super::open_orchestrator;
use crate::config::Config;
use crate::error::ConbuilderResult;
use crate::layer::Tier;
use crate::sandbox::CancelToken;
use crate::ui::{self, BuildProgress, UiContext};

/// Execute the create command
pub async fn execute(config: &Config, cancel: &CancelToken) -> ConbuilderResult<()> {
    let ctx = UiContext::detect();
    let env = &config.environment;
    let orchestrator = open_orchestrator(config).await?;

    ui::intro(&ctx, &format!("Creating base layer for {}", env.codename));
    ui::key_value(&ctx, "Mirror", &env.mirror);
    ui::key_value(&ctx, "Cache", &config.store.cache_dir.display().to_string());

    let progress = BuildProgress::new(&ctx, "Bootstrapping");
    let result = orchestrator
        .create(env, cancel, &|line| progress.on_line(line))
        .await;
    progress.finish();

    let layer = result?;
    ui::layer_ready(&ctx, Tier::Base, &layer.id, None);
    ui::outro_success(&ctx, &format!("{} is ready for builds", env.codename));
    Ok(())
}

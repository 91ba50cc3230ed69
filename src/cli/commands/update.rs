//! Update command - refresh the base layer

use super::open_orchestrator;
use crate::cli::args::UpdateArgs;
use crate::config::Config;
use crate::error::ConbuilderResult;
use crate::layer::Tier;
use crate::sandbox::CancelToken;
use crate::ui::{self, BuildProgress, UiContext};

/// Execute the update command
pub async fn execute(args: UpdateArgs, config: &Config, cancel: &CancelToken) -> ConbuilderResult<()> {
    let ctx = UiContext::detect();
    let env = &config.environment;
    let orchestrator = open_orchestrator(config).await?;
    let previous = orchestrator.store().current_base(&env.codename)?;

    ui::intro(&ctx, &format!("Updating base layer for {}", env.codename));
    match &previous {
        Some(layer) if !args.rebootstrap => ui::key_value(&ctx, "Upgrading", layer.id.as_str()),
        Some(layer) => ui::key_value(&ctx, "Replacing", layer.id.as_str()),
        None => ui::step_info(&ctx, "No base layer yet, bootstrapping"),
    }

    let label = if previous.is_some() && !args.rebootstrap {
        "Upgrading"
    } else {
        "Bootstrapping"
    };
    let progress = BuildProgress::new(&ctx, label);
    let result = orchestrator
        .update(env, args.rebootstrap, cancel, &|line| progress.on_line(line))
        .await;
    progress.finish();

    let layer = result?;
    ui::layer_ready(&ctx, Tier::Base, &layer.id, None);
    if let Some(old) = previous {
        ui::remark(
            &ctx,
            &format!(
                "{} is superseded; `conbuilder purge` removes it once unused",
                old.id
            ),
        );
    }
    ui::outro_success(&ctx, "Update complete");
    Ok(())
}

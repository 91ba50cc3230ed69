//! Build command - build a source package on cached layers

use super::open_orchestrator;
use crate::cli::args::BuildArgs;
use crate::config::{Config, SandboxConfig};
use crate::error::{ConbuilderError, ConbuilderResult};
use crate::layer::Tier;
use crate::orchestrator::{BuildReport, BuildRequest};
use crate::sandbox::{CancelToken, SandboxProfile};
use crate::ui::{self, BuildProgress, UiContext};
use tracing::debug;

/// Execute the build command
pub async fn execute(args: BuildArgs, config: &Config, cancel: &CancelToken) -> ConbuilderResult<()> {
    let ctx = UiContext::detect();

    let source_dir = match args.source.clone() {
        Some(dir) => dir,
        None => std::env::current_dir()
            .map_err(|e| ConbuilderError::io("getting current directory", e))?,
    };
    let profile = SandboxProfile::from_config(&merge_sandbox(&config.sandbox, &args))?;
    debug!(profile = %profile.canonical(), "Build profile");

    let mut request = BuildRequest::new(&source_dir, config.environment.clone(), profile);
    request.extra_args = args.extra_args;
    request.export_dir = args.export_dir;
    request.rebuild = args.rebuild;

    let orchestrator = open_orchestrator(config).await?;

    ui::intro(&ctx, &format!("Building {}", source_dir.display()));
    ui::key_value(&ctx, "Codename", &config.environment.codename);
    if !request.extra_args.is_empty() {
        ui::key_value(&ctx, "Arguments", &request.extra_args.join(" "));
    }

    let progress = BuildProgress::new(&ctx, "Building");
    let result = orchestrator
        .build(&request, cancel, &|line| progress.on_line(line))
        .await;
    progress.finish();

    match result {
        Ok(report) => {
            print_report(&ctx, &report);
            Ok(())
        }
        Err(e) => {
            ui::outro_error(&ctx, "Build failed");
            Err(e)
        }
    }
}

/// Command line flags on top of the configured sandbox defaults
fn merge_sandbox(defaults: &SandboxConfig, args: &BuildArgs) -> SandboxConfig {
    let mut sandbox = defaults.clone();
    sandbox.network |= args.network;
    sandbox
        .allow_capabilities
        .extend(args.allow_capabilities.iter().cloned());
    sandbox.syscall_allow.extend(args.syscall_allow.iter().cloned());
    sandbox.syscall_deny.extend(args.syscall_deny.iter().cloned());
    sandbox
}

fn print_report(ctx: &UiContext, report: &BuildReport) {
    ui::layer_ready(ctx, Tier::Base, &report.base, None);
    ui::layer_ready(
        ctx,
        Tier::Dependencies,
        &report.dependencies,
        Some(&format!("{} packages", report.packages.len())),
    );
    ui::layer_ready(
        ctx,
        Tier::Build,
        &report.layer,
        report.cached.then_some("cached"),
    );

    if report.artifacts.is_empty() {
        ui::step_warn(ctx, "No artifacts found");
    } else {
        ui::section(ctx, "Artifacts");
        for artifact in &report.artifacts {
            ui::remark(ctx, &artifact.display().to_string());
        }
    }

    if let Some(eviction) = &report.eviction {
        if !eviction.removed.is_empty() {
            ui::step_info(
                ctx,
                &format!("Evicted {} old build layer(s)", eviction.removed.len()),
            );
        }
    }

    ui::outro_success(ctx, &format!("Build {} complete", report.fingerprint));
}

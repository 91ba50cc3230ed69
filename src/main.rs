//! conbuilder - Debian package builds on cached overlay layers
//!
//! CLI entry point that dispatches to subcommands.

use clap::Parser;
use conbuilder::cli::{Cli, Commands};
use conbuilder::config::ConfigManager;
use conbuilder::error::{ConbuilderError, ConbuilderResult};
use conbuilder::sandbox::CancelToken;
use console::style;
use std::process::ExitCode;
use tracing::{debug, warn};
use tracing_subscriber::EnvFilter;

/// Exit code of a package build that ran and failed
const BUILD_FAILED: u8 = 2;

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{} {}", style("Error:").red().bold(), e);
            if let Some(hint) = e.hint() {
                eprintln!("{} {}", style("Hint:").yellow(), hint);
            }
            match e {
                ConbuilderError::BuildFailure { .. } => ExitCode::from(BUILD_FAILED),
                _ => ExitCode::FAILURE,
            }
        }
    }
}

async fn run() -> ConbuilderResult<()> {
    let cli = Cli::parse();
    let manager = ConfigManager::resolve(cli.config.clone());

    // Config command works on the file itself, even a broken one
    if let Commands::Config(args) = cli.command {
        init_logging(cli.verbose, false);
        return conbuilder::cli::commands::config(args, &manager).await;
    }

    let mut config = manager.load().await?;
    init_logging(cli.verbose, config.general.log_format == "json");
    debug!("Using configuration {}", manager.path().display());

    if let Some(codename) = cli.codename {
        config.environment.codename = codename;
        config.validate(manager.path())?;
    }

    conbuilder::ui::init_theme();

    let (handle, cancel) = CancelToken::pair();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, stopping the container");
            handle.cancel();
        }
    });

    // Dispatch to command
    match cli.command {
        Commands::Config(_) => unreachable!("Config handled above"),
        Commands::Create => conbuilder::cli::commands::create(&config, &cancel).await,
        Commands::Update(args) => conbuilder::cli::commands::update(args, &config, &cancel).await,
        Commands::Build(args) => conbuilder::cli::commands::build(args, &config, &cancel).await,
        Commands::Install(args) => {
            conbuilder::cli::commands::install(args, &config, &cancel).await
        }
        Commands::Purge(args) => conbuilder::cli::commands::purge(args, &config).await,
        Commands::Show(args) => conbuilder::cli::commands::show(args, &config).await,
    }
}

/// 0 = warn (spinners only), 1 = info, 2+ = debug; RUST_LOG wins when set
fn init_logging(verbose: u8, json: bool) {
    let level = match verbose {
        0 => "conbuilder=warn",
        1 => "conbuilder=info",
        _ => "conbuilder=debug",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    if json {
        builder.json().init();
    } else {
        builder.without_time().init();
    }
}

//! Show command - list layers and active mounts

use super::open_orchestrator;
use crate::cli::args::{OutputFormat, ShowArgs};
use crate::config::Config;
use crate::error::ConbuilderResult;
use crate::inspect::{format_age, format_bytes, inspect, InspectionReport, LayerSummary};
use crate::layer::Tier;
use chrono::{DateTime, Utc};
use console::style;

/// Execute the show command
pub async fn execute(args: ShowArgs, config: &Config) -> ConbuilderResult<()> {
    let orchestrator = open_orchestrator(config).await?;
    let report = inspect(orchestrator.store())?;

    match args.format {
        OutputFormat::Table => print_table(&report, Utc::now()),
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
        OutputFormat::Plain => {
            for layer in &report.layers {
                println!("{}", layer.id);
            }
        }
    }

    Ok(())
}

fn print_table(report: &InspectionReport, now: DateTime<Utc>) {
    println!("{} {}", style("Cache:").bold(), report.cache_dir.display());
    println!();

    if report.mounts.is_empty() {
        println!("No active mounts.");
    } else {
        println!("{}", style("Active mounts").bold());
        for mount in &report.mounts {
            let lowers: Vec<&str> = mount.lowers.iter().map(|id| id.as_str()).collect();
            println!(
                "  {}  {:<12} pid {:<8} {}",
                mount.id,
                mount.purpose.to_string(),
                mount.owner_pid,
                lowers.join(" <- ")
            );
        }
    }
    println!();

    if report.layers.is_empty() {
        println!("No layers found.");
        return;
    }

    println!(
        "{:<5} {:<28} {:<10} {:>10} {:>6} {:<12}",
        "TIER", "LAYER", "ENV", "SIZE", "IDLE", "STATE"
    );
    println!("{}", "-".repeat(76));

    for tier in Tier::all() {
        for layer in report.layers.iter().filter(|l| l.tier == *tier) {
            print_row(layer, now);
        }
    }

    println!();
    println!(
        "Total: {} layer(s), {}",
        report.layers.len(),
        format_bytes(report.total_size())
    );
}

fn print_row(layer: &LayerSummary, now: DateTime<Utc>) {
    let state = if layer.superseded {
        style("superseded").yellow().to_string()
    } else {
        style("current").green().to_string()
    };
    println!(
        "{:<5} {:<28} {:<10} {:>10} {:>6} {:<12}",
        layer.tier.label(),
        layer.id.as_str(),
        layer.environment,
        format_bytes(layer.size_bytes),
        format_age(layer.last_used_at, now),
        state
    );

    if let Some(parent) = &layer.parent {
        println!("      {} {}", style("on").dim(), style(parent).dim());
    }
    // dependency layers list their packages
    if layer.tier == Tier::Dependencies {
        for input in &layer.inputs {
            println!("        {}", style(input).dim());
        }
    }
}

//! Purge command - evict old layers

use super::open_orchestrator;
use crate::cli::args::PurgeArgs;
use crate::config::Config;
use crate::error::ConbuilderResult;
use crate::eviction::{self, EvictionPolicy, EvictionReport};
use crate::layer::{LayerId, LayerStore, Tier};
use crate::ui::{self, TaskSpinner, UiContext};
use chrono::{DateTime, Utc};

/// One layer the purge would delete
#[derive(Debug, Clone, PartialEq, Eq)]
struct Victim {
    tier: Tier,
    id: LayerId,
    reason: &'static str,
}

/// Execute the purge command
pub async fn execute(args: PurgeArgs, config: &Config) -> ConbuilderResult<()> {
    let ctx = UiContext::detect().with_auto_yes(args.yes);
    let orchestrator = open_orchestrator(config).await?;
    let store = orchestrator.store();
    let now = Utc::now();

    let policies: Vec<(Tier, EvictionPolicy)> = match args.tier {
        Some(tier) => {
            let tier = Tier::from(tier);
            config
                .eviction
                .for_tier(tier)
                .map(|policy| (tier, policy))
                .into_iter()
                .collect()
        }
        None => config.eviction.policies(),
    };
    let include_superseded = args.tier.is_none();

    let victims = preview(store, &policies, include_superseded, now)?;
    if victims.is_empty() {
        ui::outro_success(&ctx, "Nothing to purge");
        return Ok(());
    }

    ui::intro(&ctx, "Purging layers");
    for victim in &victims {
        ui::remark(
            &ctx,
            &format!("{} {} ({})", victim.tier.label(), victim.id, victim.reason),
        );
    }

    if args.dry_run {
        ui::outro_warn(
            &ctx,
            &format!("Dry run: {} layer(s) would be removed", victims.len()),
        );
        return Ok(());
    }

    let question = format!("Delete {} layer(s)?", victims.len());
    if !ui::confirm(&ctx, &question, false).await? {
        ui::outro_warn(&ctx, "Purge cancelled (use --yes to skip this prompt)");
        return Ok(());
    }

    let mut spinner = TaskSpinner::new(&ctx);
    spinner.start("Removing layers...");
    let report = match run(store, &policies, include_superseded, now) {
        Ok(report) => report,
        Err(e) => {
            spinner.stop_error("Eviction failed");
            return Err(e);
        }
    };
    spinner.stop(&format!("Removed {} layer(s)", report.removed.len()));
    print_report(&ctx, &report);
    Ok(())
}

/// Layers an eviction pass would remove right now
fn preview(
    store: &LayerStore,
    policies: &[(Tier, EvictionPolicy)],
    include_superseded: bool,
    now: DateTime<Utc>,
) -> ConbuilderResult<Vec<Victim>> {
    let mut victims = Vec::new();
    for (tier, policy) in policies {
        let plan = eviction::plan_for(store, *tier, policy, now)?;
        victims.extend(plan.expired.into_iter().map(|id| Victim {
            tier: *tier,
            id,
            reason: "expired",
        }));
        victims.extend(plan.surplus.into_iter().map(|id| Victim {
            tier: *tier,
            id,
            reason: "over count limit",
        }));
    }
    if include_superseded {
        victims.extend(
            eviction::superseded_candidates(store)?
                .into_iter()
                .map(|id| Victim {
                    tier: Tier::Base,
                    id,
                    reason: "superseded",
                }),
        );
    }
    Ok(victims)
}

fn run(
    store: &LayerStore,
    policies: &[(Tier, EvictionPolicy)],
    include_superseded: bool,
    now: DateTime<Utc>,
) -> ConbuilderResult<EvictionReport> {
    if include_superseded {
        return eviction::evict_all(store, policies, now);
    }
    let mut report = EvictionReport::default();
    for (tier, policy) in policies {
        let pass = eviction::evict(store, *tier, policy, now)?;
        report.removed.extend(pass.removed);
        report.skipped_in_use.extend(pass.skipped_in_use);
        report.failed.extend(pass.failed);
    }
    Ok(report)
}

fn print_report(ctx: &UiContext, report: &EvictionReport) {
    for id in &report.skipped_in_use {
        ui::step_warn(ctx, &format!("{} is in use, skipped", id));
    }
    for (id, reason) in &report.failed {
        ui::step_error(ctx, &format!("{}: {}", id, reason));
    }

    if report.failed.is_empty() {
        ui::outro_success(ctx, "Purge complete");
    } else {
        ui::outro_warn(ctx, &format!("{} layer(s) could not be removed", report.failed.len()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layer::{Fingerprint, Layer, LayerKey, UnmountPolicy};
    use crate::testing::{CountingBuilder, FakeOverlay};
    use std::sync::Arc;
    use tempfile::TempDir;

    async fn store_with_builds(dir: &TempDir, builds: usize) -> (LayerStore, Layer) {
        let store = LayerStore::open(
            dir.path().join("cache"),
            Arc::new(FakeOverlay::new()),
            UnmountPolicy::default(),
        )
        .unwrap();
        let base = store
            .find_or_create(
                &LayerKey::base("sid", Fingerprint::new("base")),
                &CountingBuilder::new("usr/bin/apt"),
            )
            .await
            .unwrap();
        let deps = store
            .find_or_create(
                &LayerKey::child_of(&base, Fingerprint::new("deps")).unwrap(),
                &CountingBuilder::new(".deps.conbuilder"),
            )
            .await
            .unwrap();
        for i in 0..builds {
            store
                .find_or_create(
                    &LayerKey::child_of(&deps, Fingerprint::new(format!("build{}", i))).unwrap(),
                    &CountingBuilder::new("hello.deb"),
                )
                .await
                .unwrap();
        }
        (store, base)
    }

    #[tokio::test]
    async fn preview_lists_surplus_builds_only() {
        let dir = TempDir::new().unwrap();
        let (store, _base) = store_with_builds(&dir, 3).await;
        let policies = vec![
            (Tier::Build, EvictionPolicy::new(30, 1)),
            (Tier::Dependencies, EvictionPolicy::new(30, 0)),
        ];

        let victims = preview(&store, &policies, true, Utc::now()).unwrap();

        // the dependencies layer is a parent, so it is pinned
        assert_eq!(victims.len(), 2);
        assert!(victims
            .iter()
            .all(|v| v.tier == Tier::Build && v.reason == "over count limit"));
    }

    #[tokio::test]
    async fn run_removes_what_preview_showed() {
        let dir = TempDir::new().unwrap();
        let (store, _base) = store_with_builds(&dir, 3).await;
        let policies = vec![(Tier::Build, EvictionPolicy::new(30, 1))];
        let now = Utc::now();

        let victims = preview(&store, &policies, false, now).unwrap();
        let report = run(&store, &policies, false, now).unwrap();

        let mut shown: Vec<LayerId> = victims.into_iter().map(|v| v.id).collect();
        let mut removed = report.removed.clone();
        shown.sort();
        removed.sort();
        assert_eq!(shown, removed);
        assert_eq!(
            store
                .list()
                .unwrap()
                .iter()
                .filter(|l| l.tier == Tier::Build)
                .count(),
            1
        );
    }

    #[tokio::test]
    async fn empty_store_has_nothing_to_purge() {
        let dir = TempDir::new().unwrap();
        let store = LayerStore::open(
            dir.path().join("cache"),
            Arc::new(FakeOverlay::new()),
            UnmountPolicy::default(),
        )
        .unwrap();
        let policies = vec![(Tier::Build, EvictionPolicy::new(0, 0))];

        assert!(preview(&store, &policies, true, Utc::now())
            .unwrap()
            .is_empty());
    }
}

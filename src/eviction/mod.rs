//! Layer eviction
//!
//! Two-stage policy per tier: every candidate idle longer than `max_age` goes,
//! then the least recently used survivors are trimmed down to `max_count`.
//! Candidates are sealed layers of the tier that are neither mounted nor
//! parents of another layer. Equal `last_used_at` values are ordered by layer
//! id, lowest first.
//!
//! Planning is pure; execution re-checks every victim under the registry lock
//! and skips the ones that became busy in the meantime.

use crate::error::{ConbuilderError, ConbuilderResult};
use crate::layer::{Layer, LayerId, LayerStore, MountRecord, Tier};
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::collections::BTreeSet;
use tracing::{debug, info, warn};

/// Age and count thresholds for one tier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EvictionPolicy {
    pub max_age: Duration,
    pub max_count: usize,
}

impl EvictionPolicy {
    pub fn new(max_age_days: u32, max_count: usize) -> Self {
        Self {
            max_age: Duration::days(i64::from(max_age_days)),
            max_count,
        }
    }
}

/// Layers chosen for deletion, in deletion order
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EvictionPlan {
    /// Idle longer than the age limit
    pub expired: Vec<LayerId>,
    /// Least recently used beyond the count limit
    pub surplus: Vec<LayerId>,
    /// Candidates left after both stages
    pub retained: usize,
}

impl EvictionPlan {
    pub fn victims(&self) -> impl Iterator<Item = &LayerId> {
        self.expired.iter().chain(self.surplus.iter())
    }

    pub fn is_empty(&self) -> bool {
        self.expired.is_empty() && self.surplus.is_empty()
    }

    pub fn len(&self) -> usize {
        self.expired.len() + self.surplus.len()
    }
}

/// What an eviction pass actually did
#[derive(Debug, Clone, Default, Serialize)]
pub struct EvictionReport {
    pub removed: Vec<LayerId>,
    pub skipped_in_use: Vec<LayerId>,
    pub failed: Vec<(LayerId, String)>,
}

impl EvictionReport {
    fn merge(&mut self, other: EvictionReport) {
        self.removed.extend(other.removed);
        self.skipped_in_use.extend(other.skipped_in_use);
        self.failed.extend(other.failed);
    }
}

/// Layers that may not be deleted: mounted (as any lower) or parent of another layer
pub fn pinned(layers: &[Layer], mounts: &[MountRecord]) -> BTreeSet<LayerId> {
    mounts
        .iter()
        .flat_map(|m| m.lowers.iter().cloned())
        .chain(layers.iter().filter_map(|l| l.parent_id.clone()))
        .collect()
}

/// Decide which layers of `tier` to delete
pub fn plan(
    layers: &[Layer],
    pinned: &BTreeSet<LayerId>,
    tier: Tier,
    policy: &EvictionPolicy,
    now: DateTime<Utc>,
) -> EvictionPlan {
    let mut candidates: Vec<&Layer> = layers
        .iter()
        .filter(|l| l.tier == tier && l.sealed && !pinned.contains(&l.id))
        .collect();
    candidates.sort_by(|a, b| {
        a.last_used_at
            .cmp(&b.last_used_at)
            .then_with(|| a.id.cmp(&b.id))
    });

    let (expired, survivors): (Vec<&Layer>, Vec<&Layer>) = candidates
        .into_iter()
        .partition(|l| l.idle_for(now) > policy.max_age);

    let surplus_len = survivors.len().saturating_sub(policy.max_count);
    let surplus = &survivors[..surplus_len];

    EvictionPlan {
        expired: expired.iter().map(|l| l.id.clone()).collect(),
        surplus: surplus.iter().map(|l| l.id.clone()).collect(),
        retained: survivors.len() - surplus_len,
    }
}

/// Plan against the current registry state
pub fn plan_for(
    store: &LayerStore,
    tier: Tier,
    policy: &EvictionPolicy,
    now: DateTime<Utc>,
) -> ConbuilderResult<EvictionPlan> {
    let layers = store.list()?;
    let mounts = store.active_mounts()?;
    Ok(plan(&layers, &pinned(&layers, &mounts), tier, policy, now))
}

/// Delete the planned layers, best effort
pub fn execute(store: &LayerStore, plan: &EvictionPlan) -> EvictionReport {
    let mut report = EvictionReport::default();

    for id in plan.victims() {
        match store.delete(id) {
            Ok(()) => report.removed.push(id.clone()),
            Err(ConbuilderError::LayerInUse { reason, .. }) => {
                debug!(layer = %id, "Skipping eviction: {}", reason);
                report.skipped_in_use.push(id.clone());
            }
            Err(e) => {
                warn!(layer = %id, "Eviction failed: {}", e);
                report.failed.push((id.clone(), e.to_string()));
            }
        }
    }

    report
}

/// Evict layers of one tier
pub fn evict(
    store: &LayerStore,
    tier: Tier,
    policy: &EvictionPolicy,
    now: DateTime<Utc>,
) -> ConbuilderResult<EvictionReport> {
    let plan = plan_for(store, tier, policy, now)?;
    if plan.is_empty() {
        debug!(tier = %tier, "Nothing to evict");
        return Ok(EvictionReport::default());
    }

    info!(
        tier = %tier,
        expired = plan.expired.len(),
        surplus = plan.surplus.len(),
        "Evicting layers"
    );
    Ok(execute(store, &plan))
}

/// Superseded base layers that nothing references anymore
pub fn superseded_candidates(store: &LayerStore) -> ConbuilderResult<Vec<LayerId>> {
    let layers = store.list()?;
    let pinned = pinned(&layers, &store.active_mounts()?);
    Ok(layers
        .iter()
        .filter(|l| l.tier == Tier::Base && l.superseded && !pinned.contains(&l.id))
        .map(|l| l.id.clone())
        .collect())
}

/// Delete superseded base layers that are no longer referenced
pub fn purge_superseded(store: &LayerStore) -> ConbuilderResult<EvictionReport> {
    let plan = EvictionPlan {
        expired: superseded_candidates(store)?,
        ..Default::default()
    };
    Ok(execute(store, &plan))
}

/// Run the given per-tier policies, higher tiers first so parents free up
pub fn evict_all(
    store: &LayerStore,
    policies: &[(Tier, EvictionPolicy)],
    now: DateTime<Utc>,
) -> ConbuilderResult<EvictionReport> {
    let mut ordered = policies.to_vec();
    ordered.sort_by(|a, b| b.0.cmp(&a.0));

    let mut report = EvictionReport::default();
    for (tier, policy) in ordered {
        report.merge(evict(store, tier, &policy, now)?);
    }
    report.merge(purge_superseded(store)?);
    Ok(report)
}

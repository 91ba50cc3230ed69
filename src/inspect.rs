//! Read-only view of the layer store

use crate::error::ConbuilderResult;
use crate::layer::{Layer, LayerId, LayerStore, MountRecord, Tier};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// One layer as shown to the user
#[derive(Debug, Clone, Serialize)]
pub struct LayerSummary {
    pub id: LayerId,
    pub tier: Tier,
    pub parent: Option<LayerId>,
    pub environment: String,
    pub fingerprint: String,
    pub created_at: DateTime<Utc>,
    pub last_used_at: DateTime<Utc>,
    pub size_bytes: u64,
    pub superseded: bool,
    pub inputs: Vec<String>,
}

impl LayerSummary {
    fn from_layer(layer: &Layer) -> Self {
        Self {
            id: layer.id.clone(),
            tier: layer.tier,
            parent: layer.parent_id.clone(),
            environment: layer.environment.clone(),
            fingerprint: layer.input_fingerprint.to_string(),
            created_at: layer.created_at,
            last_used_at: layer.last_used_at,
            size_bytes: dir_size(&layer.mount_path),
            superseded: layer.superseded,
            inputs: layer.inputs.clone(),
        }
    }
}

/// Everything `show` prints
#[derive(Debug, Clone, Serialize)]
pub struct InspectionReport {
    pub cache_dir: PathBuf,
    pub layers: Vec<LayerSummary>,
    pub mounts: Vec<MountRecord>,
}

impl InspectionReport {
    pub fn total_size(&self) -> u64 {
        self.layers.iter().map(|l| l.size_bytes).sum()
    }
}

pub fn inspect(store: &LayerStore) -> ConbuilderResult<InspectionReport> {
    let layers = store.list()?;
    Ok(InspectionReport {
        cache_dir: store.root().to_path_buf(),
        layers: layers.iter().map(LayerSummary::from_layer).collect(),
        mounts: store.active_mounts()?,
    })
}

/// Apparent size of a tree; symlinks are not followed, unreadable entries
/// count as zero
pub fn dir_size(path: &Path) -> u64 {
    WalkDir::new(path)
        .follow_links(false)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .filter_map(|entry| entry.metadata().ok())
        .map(|meta| meta.len())
        .sum()
}

/// Format bytes as human-readable size (e.g., "1.5 GB")
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.1} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

/// Coarse age like "3d", "5h" or "12m"
pub fn format_age(since: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let age = now.signed_duration_since(since);
    if age.num_days() > 0 {
        format!("{}d", age.num_days())
    } else if age.num_hours() > 0 {
        format!("{}h", age.num_hours())
    } else {
        format!("{}m", age.num_minutes().max(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layer::{Fingerprint, LayerKey, MountPurpose, UnmountPolicy};
    use crate::testing::{CountingBuilder, FakeOverlay};
    use chrono::Duration;
    use std::sync::Arc;
    use tempfile::TempDir;

    #[test]
    fn format_bytes_units() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(1536), "1.5 KB");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5.0 MB");
        assert_eq!(format_bytes(3 * 1024 * 1024 * 1024), "3.0 GB");
    }

    #[test]
    fn format_age_picks_largest_unit() {
        let now = Utc::now();
        assert_eq!(format_age(now - Duration::days(3), now), "3d");
        assert_eq!(format_age(now - Duration::hours(5), now), "5h");
        assert_eq!(format_age(now - Duration::minutes(12), now), "12m");
        assert_eq!(format_age(now + Duration::minutes(1), now), "0m");
    }

    #[test]
    fn dir_size_sums_files() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("a/b")).unwrap();
        std::fs::write(dir.path().join("a/one"), vec![0u8; 100]).unwrap();
        std::fs::write(dir.path().join("a/b/two"), vec![0u8; 23]).unwrap();
        assert_eq!(dir_size(dir.path()), 123);
        assert_eq!(dir_size(&dir.path().join("missing")), 0);
    }

    #[tokio::test]
    async fn report_lists_layers_and_mounts() {
        let dir = TempDir::new().unwrap();
        let store = LayerStore::open(
            dir.path().join("cache"),
            Arc::new(FakeOverlay::new()),
            UnmountPolicy::default(),
        )
        .unwrap();
        let base = store
            .find_or_create(
                &LayerKey::base("sid", Fingerprint::new("sid")),
                &CountingBuilder::new("usr/bin/apt"),
            )
            .await
            .unwrap();
        let mount = store
            .mount_ephemeral(&base, MountPurpose::Inspection)
            .await
            .unwrap();

        let report = inspect(&store).unwrap();

        assert_eq!(report.layers.len(), 1);
        assert_eq!(report.layers[0].id, base.id);
        assert_eq!(report.layers[0].size_bytes, "usr/bin/apt".len() as u64);
        assert_eq!(report.total_size(), report.layers[0].size_bytes);
        assert_eq!(report.mounts.len(), 1);
        assert_eq!(report.mounts[0].lowers, vec![base.id.clone()]);

        store
            .release(mount, crate::layer::Disposition::Discard)
            .await
            .unwrap();
    }
}

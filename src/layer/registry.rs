//! Layer registry
//!
//! Flat, id-keyed record of every sealed layer and every active overlay
//! mount. Persisted as JSON next to the layer content; callers go through
//! `LayerStore`, which serializes all mutations.

use crate::error::{ConbuilderError, ConbuilderResult};
use crate::layer::{Layer, LayerId, LayerKey, Tier};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

const REGISTRY_VERSION: u32 = 1;

/// Why an overlay mount exists
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MountPurpose {
    /// Populating a new layer
    Construction,
    /// Running a package build
    Build,
    /// Throw-away package installation
    Install,
    /// Read-only probe (dependency resolution)
    Inspection,
}

impl fmt::Display for MountPurpose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Construction => write!(f, "construction"),
            Self::Build => write!(f, "build"),
            Self::Install => write!(f, "install"),
            Self::Inspection => write!(f, "inspection"),
        }
    }
}

/// An active overlay mount
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MountRecord {
    pub id: String,
    pub purpose: MountPurpose,
    /// Directory holding upper/, work/ and merged/
    pub root: PathBuf,
    /// Merged view
    pub merged: PathBuf,
    /// Every layer the mount reads from, top first
    pub lowers: Vec<LayerId>,
    pub owner_pid: u32,
    pub created_at: DateTime<Utc>,
}

/// Persistent registry contents
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Registry {
    version: u32,
    #[serde(default)]
    layers: BTreeMap<LayerId, Layer>,
    #[serde(default)]
    mounts: BTreeMap<String, MountRecord>,
}

impl Default for Registry {
    fn default() -> Self {
        Self {
            version: REGISTRY_VERSION,
            layers: BTreeMap::new(),
            mounts: BTreeMap::new(),
        }
    }
}

impl Registry {
    /// Load from disk; a missing file is an empty registry
    pub fn load(path: &Path) -> ConbuilderResult<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path)
            .map_err(|e| ConbuilderError::io(format!("reading registry {}", path.display()), e))?;
        if content.trim().is_empty() {
            return Ok(Self::default());
        }

        let registry: Registry =
            serde_json::from_str(&content).map_err(|e| ConbuilderError::RegistryCorrupt {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?;

        if registry.version != REGISTRY_VERSION {
            return Err(ConbuilderError::RegistryCorrupt {
                path: path.to_path_buf(),
                reason: format!("unsupported version {}", registry.version),
            });
        }

        Ok(registry)
    }

    /// Write atomically (temp file + rename)
    pub fn save(&self, path: &Path) -> ConbuilderResult<()> {
        let tmp = path.with_extension("json.tmp");
        let content = serde_json::to_string_pretty(self)?;

        let mut file = fs::File::create(&tmp)
            .map_err(|e| ConbuilderError::io(format!("creating {}", tmp.display()), e))?;
        file.write_all(content.as_bytes())
            .and_then(|_| file.sync_all())
            .map_err(|e| ConbuilderError::io(format!("writing {}", tmp.display()), e))?;

        fs::rename(&tmp, path)
            .map_err(|e| ConbuilderError::io(format!("replacing {}", path.display()), e))
    }

    pub fn get(&self, id: &LayerId) -> Option<&Layer> {
        self.layers.get(id)
    }

    /// Sealed, reusable layer answering `key`
    pub fn find(&self, key: &LayerKey) -> Option<&Layer> {
        self.layers.get(&key.id()).filter(|layer| {
            layer.sealed
                && !layer.superseded
                && layer.tier == key.tier
                && layer.parent_id == key.parent
                && layer.input_fingerprint == key.fingerprint
        })
    }

    /// All layers, ordered by tier then id
    pub fn layers(&self) -> Vec<&Layer> {
        let mut layers: Vec<&Layer> = self.layers.values().collect();
        layers.sort_by(|a, b| a.tier.cmp(&b.tier).then_with(|| a.id.cmp(&b.id)));
        layers
    }

    pub fn children(&self, id: &LayerId) -> Vec<&Layer> {
        self.layers
            .values()
            .filter(|l| l.parent_id.as_ref() == Some(id))
            .collect()
    }

    /// Layer and its ancestors, top first
    pub fn lineage(&self, id: &LayerId) -> ConbuilderResult<Vec<&Layer>> {
        let mut chain = Vec::new();
        let mut next = Some(id.clone());
        while let Some(current) = next {
            let layer = self
                .layers
                .get(&current)
                .ok_or_else(|| ConbuilderError::LayerNotFound(current.clone()))?;
            if chain.len() > Tier::all().len() {
                return Err(ConbuilderError::InvalidLayerChain(format!(
                    "ancestor chain of {} is longer than the tier count",
                    id
                )));
            }
            next = layer.parent_id.clone();
            chain.push(layer);
        }
        Ok(chain)
    }

    /// Current (not superseded) base for an environment
    pub fn current_base(&self, environment: &str) -> Option<&Layer> {
        self.layers
            .values()
            .find(|l| l.tier == Tier::Base && l.environment == environment && !l.superseded)
    }

    /// Why `id` cannot be deleted right now, if anything holds it
    pub fn in_use_reason(&self, id: &LayerId) -> Option<String> {
        let mounts: Vec<&str> = self
            .mounts
            .values()
            .filter(|m| m.lowers.contains(id))
            .map(|m| m.id.as_str())
            .collect();
        if !mounts.is_empty() {
            return Some(format!("referenced by active mount(s) {}", mounts.join(", ")));
        }

        let children: Vec<String> = self.children(id).iter().map(|c| c.id.to_string()).collect();
        if !children.is_empty() {
            return Some(format!("parent of layer(s) {}", children.join(", ")));
        }

        None
    }

    /// Register a sealed layer. Its parent must be registered and sealed,
    /// exactly one tier below.
    pub fn register(&mut self, layer: Layer) -> ConbuilderResult<()> {
        if !layer.sealed {
            return Err(ConbuilderError::InvalidLayerChain(format!(
                "layer {} is not sealed",
                layer.id
            )));
        }

        match (&layer.parent_id, layer.tier.parent_tier()) {
            (None, None) => {}
            (Some(parent_id), Some(parent_tier)) => {
                let parent = self
                    .layers
                    .get(parent_id)
                    .ok_or_else(|| ConbuilderError::LayerNotFound(parent_id.clone()))?;
                if !parent.sealed || parent.tier != parent_tier {
                    return Err(ConbuilderError::InvalidLayerChain(format!(
                        "{} layer {} cannot sit on {} layer {}",
                        layer.tier, layer.id, parent.tier, parent.id
                    )));
                }
            }
            _ => {
                return Err(ConbuilderError::InvalidLayerChain(format!(
                    "{} layer {} has the wrong parent arity",
                    layer.tier, layer.id
                )));
            }
        }

        self.layers.insert(layer.id.clone(), layer);
        Ok(())
    }

    /// Mark the current base of an environment superseded, except `keep`
    pub fn supersede_bases(&mut self, environment: &str, keep: &LayerId) -> Vec<LayerId> {
        let mut superseded = Vec::new();
        for layer in self.layers.values_mut() {
            if layer.tier == Tier::Base
                && layer.environment == environment
                && &layer.id != keep
                && !layer.superseded
            {
                layer.superseded = true;
                superseded.push(layer.id.clone());
            }
        }
        superseded
    }

    /// Remove a layer record, failing if anything still holds it
    pub fn remove(&mut self, id: &LayerId) -> ConbuilderResult<Option<Layer>> {
        if let Some(reason) = self.in_use_reason(id) {
            return Err(ConbuilderError::LayerInUse {
                id: id.clone(),
                reason,
            });
        }
        Ok(self.layers.remove(id))
    }

    /// Update `last_used_at`
    pub fn touch(&mut self, id: &LayerId, now: DateTime<Utc>) -> Option<&Layer> {
        let layer = self.layers.get_mut(id)?;
        layer.last_used_at = now;
        Some(layer)
    }

    pub fn add_mount(&mut self, record: MountRecord) {
        self.mounts.insert(record.id.clone(), record);
    }

    pub fn remove_mount(&mut self, id: &str) -> Option<MountRecord> {
        self.mounts.remove(id)
    }

    pub fn mounts(&self) -> Vec<&MountRecord> {
        let mut mounts: Vec<&MountRecord> = self.mounts.values().collect();
        mounts.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        mounts
    }
}

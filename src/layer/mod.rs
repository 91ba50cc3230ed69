//! Layer hierarchy
//!
//! Layers are sealed filesystem snapshots stacked as overlay lowers. Each
//! layer belongs to a tier and points back at its parent by id; the chain
//! `Build -> Dependencies -> Base` is kept in a flat registry, never as
//! embedded references.
//!
//! # Cache key
//!
//! A layer id is derived from `(tier, parent id, input fingerprint)`, so the
//! same declared inputs on the same parent always resolve to the same layer.
//!
//! | Tier | Parent | Populated by |
//! |------|--------|--------------|
//! | Base | none | bootstrap command |
//! | Dependencies | Base | dependency install command |
//! | Build | Dependencies | promoted build overlay |

pub mod fingerprint;
mod lock;
pub mod registry;
pub mod store;

pub use fingerprint::{DependencySet, Fingerprint};
pub use registry::{MountPurpose, MountRecord, Registry};
pub use store::{
    Disposition, EnvironmentLock, LayerBuilder, LayerContext, LayerStore, OverlayMount,
    UnmountPolicy,
};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// The three ordered stages of the overlay chain
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    /// Bootstrapped root filesystem
    Base,
    /// Build dependencies installed on top of a base
    Dependencies,
    /// Output of a successful package build
    Build,
}

impl Tier {
    /// Tier a parent layer must have, `None` for the bottom of the chain
    pub fn parent_tier(&self) -> Option<Tier> {
        match self {
            Self::Base => None,
            Self::Dependencies => Some(Self::Base),
            Self::Build => Some(Self::Dependencies),
        }
    }

    /// Short label used in progress output, matching the classic L1/L2/L3 naming
    pub fn label(&self) -> &'static str {
        match self {
            Self::Base => "L1",
            Self::Dependencies => "L2",
            Self::Build => "L3",
        }
    }

    /// All tiers, bottom first
    pub fn all() -> &'static [Tier] {
        &[Self::Base, Self::Dependencies, Self::Build]
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Base => "base",
            Self::Dependencies => "dependencies",
            Self::Build => "build",
        };
        write!(f, "{}", name)
    }
}

impl FromStr for Tier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "base" | "l1" => Ok(Self::Base),
            "dependencies" | "deps" | "l2" => Ok(Self::Dependencies),
            "build" | "l3" => Ok(Self::Build),
            other => Err(format!("unknown tier '{}'", other)),
        }
    }
}

/// Stable layer identifier
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LayerId(String);

impl LayerId {
    /// Derive the id for a cache key: first 16 hex chars of
    /// SHA256(tier, parent id, fingerprint)
    pub fn derive(tier: Tier, parent: Option<&LayerId>, fingerprint: &Fingerprint) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(tier.to_string().as_bytes());
        hasher.update([0u8]);
        hasher.update(parent.map(|p| p.as_str()).unwrap_or("").as_bytes());
        hasher.update([0u8]);
        hasher.update(fingerprint.as_str().as_bytes());
        let digest = hasher.finalize();
        Self(hex::encode(&digest[..8]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LayerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for LayerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for LayerId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Lookup key for a layer: what it is built from, and where it sits
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LayerKey {
    pub tier: Tier,
    pub parent: Option<LayerId>,
    pub fingerprint: Fingerprint,
    /// Target environment (release codename) the chain belongs to
    pub environment: String,
}

impl LayerKey {
    /// Key for the base layer of an environment
    pub fn base(environment: impl Into<String>, fingerprint: Fingerprint) -> Self {
        Self {
            tier: Tier::Base,
            parent: None,
            fingerprint,
            environment: environment.into(),
        }
    }

    /// Key for a layer stacked on `parent`, one tier above it
    pub fn child_of(parent: &Layer, fingerprint: Fingerprint) -> Option<Self> {
        let tier = match parent.tier {
            Tier::Base => Tier::Dependencies,
            Tier::Dependencies => Tier::Build,
            Tier::Build => return None,
        };
        Some(Self {
            tier,
            parent: Some(parent.id.clone()),
            fingerprint,
            environment: parent.environment.clone(),
        })
    }

    /// The layer id this key resolves to
    pub fn id(&self) -> LayerId {
        LayerId::derive(self.tier, self.parent.as_ref(), &self.fingerprint)
    }
}

/// A registered filesystem snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Layer {
    pub id: LayerId,
    pub tier: Tier,
    pub parent_id: Option<LayerId>,
    pub environment: String,
    /// Read-only content directory, fixed at creation
    pub mount_path: PathBuf,
    pub input_fingerprint: Fingerprint,
    pub created_at: DateTime<Utc>,
    pub last_used_at: DateTime<Utc>,
    pub sealed: bool,
    /// Replaced by a newer base for the same environment
    #[serde(default)]
    pub superseded: bool,
    /// Human-readable description of the declared inputs
    #[serde(default)]
    pub inputs: Vec<String>,
}

impl Layer {
    /// Create an unsealed layer record for a key
    pub fn unsealed(key: &LayerKey, mount_path: PathBuf) -> Self {
        let now = Utc::now();
        Self {
            id: key.id(),
            tier: key.tier,
            parent_id: key.parent.clone(),
            environment: key.environment.clone(),
            mount_path,
            input_fingerprint: key.fingerprint.clone(),
            created_at: now,
            last_used_at: now,
            sealed: false,
            superseded: false,
            inputs: vec![],
        }
    }

    /// The cache key this layer answers
    pub fn key(&self) -> LayerKey {
        LayerKey {
            tier: self.tier,
            parent: self.parent_id.clone(),
            fingerprint: self.input_fingerprint.clone(),
            environment: self.environment.clone(),
        }
    }

    /// Time since last reuse
    pub fn idle_for(&self, now: DateTime<Utc>) -> Duration {
        now - self.last_used_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tier_ordering_follows_chain() {
        assert!(Tier::Base < Tier::Dependencies);
        assert!(Tier::Dependencies < Tier::Build);
        assert_eq!(Tier::Build.parent_tier(), Some(Tier::Dependencies));
        assert_eq!(Tier::Base.parent_tier(), None);
    }

    #[test]
    fn tier_parses_aliases() {
        assert_eq!("Build".parse::<Tier>().unwrap(), Tier::Build);
        assert_eq!("l2".parse::<Tier>().unwrap(), Tier::Dependencies);
        assert!("l4".parse::<Tier>().is_err());
    }

    #[test]
    fn layer_id_is_deterministic() {
        let fp = Fingerprint::new("deps-v1");
        let parent = LayerId::from("0011223344556677");
        let a = LayerId::derive(Tier::Dependencies, Some(&parent), &fp);
        let b = LayerId::derive(Tier::Dependencies, Some(&parent), &fp);
        assert_eq!(a, b);
        assert_eq!(a.as_str().len(), 16);
    }

    #[test]
    fn layer_id_depends_on_every_key_part() {
        let fp = Fingerprint::new("deps-v1");
        let p1 = LayerId::from("p1");
        let p2 = LayerId::from("p2");
        let base = LayerId::derive(Tier::Dependencies, Some(&p1), &fp);
        assert_ne!(base, LayerId::derive(Tier::Dependencies, Some(&p2), &fp));
        assert_ne!(base, LayerId::derive(Tier::Build, Some(&p1), &fp));
        assert_ne!(
            base,
            LayerId::derive(Tier::Dependencies, Some(&p1), &Fingerprint::new("deps-v2"))
        );
    }

    #[test]
    fn child_key_moves_up_one_tier() {
        let base = Layer::unsealed(
            &LayerKey::base("sid", Fingerprint::new("sid")),
            PathBuf::from("/cache/layers/x/fs"),
        );
        let key = LayerKey::child_of(&base, Fingerprint::new("deps-v1")).unwrap();
        assert_eq!(key.tier, Tier::Dependencies);
        assert_eq!(key.parent.as_ref(), Some(&base.id));
        assert_eq!(key.environment, "sid");
    }

    #[test]
    fn build_layer_has_no_child_tier() {
        let mut layer = Layer::unsealed(
            &LayerKey::base("sid", Fingerprint::new("sid")),
            PathBuf::from("/x"),
        );
        layer.tier = Tier::Build;
        assert!(LayerKey::child_of(&layer, Fingerprint::new("x")).is_none());
    }

    #[test]
    fn layer_serializes_with_lowercase_tier() {
        let layer = Layer::unsealed(
            &LayerKey::base("bookworm", Fingerprint::new("abc")),
            PathBuf::from("/x"),
        );
        let json = serde_json::to_string(&layer).unwrap();
        assert!(json.contains("\"tier\":\"base\""));
        let parsed: Layer = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.id, layer.id);
        assert!(!parsed.sealed);
    }
}

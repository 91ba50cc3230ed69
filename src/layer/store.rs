//! Layer store
//!
//! Owns the on-disk layer hierarchy under the cache directory:
//!
//! ```text
//! <cache>/registry.json        layer + mount registry
//! <cache>/registry.lock        serializes registry mutations
//! <cache>/locks/<id>.lock      one in-flight construction per cache key
//! <cache>/layers/<id>/fs       sealed layer content
//! <cache>/mounts/<mount>/      upper/ work/ merged/ of an ephemeral overlay
//! <cache>/staging/<uuid>/      base layer under construction
//! ```
//!
//! Every registry mutation reloads the registry under an exclusive file lock,
//! applies the change and writes it back, so several conbuilder processes can
//! share one cache directory.

use crate::error::{ConbuilderError, ConbuilderResult};
use crate::layer::lock::FileLock;
use crate::layer::registry::{MountPurpose, MountRecord, Registry};
use crate::layer::{Layer, LayerId, LayerKey, Tier};
use crate::overlay::{OverlayFs, OverlaySpec};
use async_trait::async_trait;
use chrono::Utc;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Where a layer under construction gets populated
#[derive(Debug, Clone)]
pub struct LayerContext {
    /// Cache key being built
    pub key: LayerKey,
    /// Writable root: the merged overlay view, or a private directory for a base
    pub root: PathBuf,
    /// Layer directly below, if any
    pub parent: Option<Layer>,
}

/// Populates the content of a new layer
#[async_trait]
pub trait LayerBuilder: Send + Sync {
    /// Fill `ctx.root`. An error discards everything written so far.
    async fn build(&self, ctx: &LayerContext) -> ConbuilderResult<()>;

    /// Human-readable description of the declared inputs, kept on the layer
    fn describe(&self) -> Vec<String> {
        vec![]
    }
}

/// What happens to an ephemeral overlay's upper directory at teardown
#[derive(Debug, Clone)]
pub enum Disposition {
    /// Throw the writes away
    Discard,
    /// Seal the writes into a new layer answering `key`
    Promote { key: LayerKey, inputs: Vec<String> },
}

/// Bounded retry for unmounting busy overlays
#[derive(Debug, Clone, Copy)]
pub struct UnmountPolicy {
    pub retries: u32,
    pub delay: Duration,
}

impl Default for UnmountPolicy {
    fn default() -> Self {
        Self {
            retries: 3,
            delay: Duration::from_millis(500),
        }
    }
}

/// An ephemeral writable overlay, owned by the invocation that created it
#[derive(Debug)]
pub struct OverlayMount {
    record: MountRecord,
    upper: PathBuf,
    lowers: Vec<Layer>,
}

impl OverlayMount {
    pub fn id(&self) -> &str {
        &self.record.id
    }

    /// Merged, writable view
    pub fn merged(&self) -> &Path {
        &self.record.merged
    }

    pub fn upper(&self) -> &Path {
        &self.upper
    }

    /// Topmost lower layer
    pub fn top(&self) -> &Layer {
        &self.lowers[0]
    }

    pub fn purpose(&self) -> MountPurpose {
        self.record.purpose
    }
}

/// Exclusive claim on the base layer of one environment
#[derive(Debug)]
pub struct EnvironmentLock {
    _lock: FileLock,
}

/// The shared layer hierarchy
pub struct LayerStore {
    root: PathBuf,
    overlay: Arc<dyn OverlayFs>,
    unmount: UnmountPolicy,
    registry: Mutex<Registry>,
}

impl LayerStore {
    /// Open (and create if needed) a store rooted at `root`
    pub fn open(
        root: impl Into<PathBuf>,
        overlay: Arc<dyn OverlayFs>,
        unmount: UnmountPolicy,
    ) -> ConbuilderResult<Self> {
        let root = root.into();
        if root.as_os_str().is_empty() || root == Path::new("/") {
            return Err(ConbuilderError::User(format!(
                "Invalid cache directory '{}'",
                root.display()
            )));
        }

        for dir in ["layers", "mounts", "staging", "locks"] {
            let path = root.join(dir);
            fs::create_dir_all(&path)
                .map_err(|e| ConbuilderError::io(format!("creating {}", path.display()), e))?;
        }

        let registry = {
            let _lock = FileLock::acquire(&root.join("registry.lock"))?;
            Registry::load(&root.join("registry.json"))?
        };

        debug!("Opened layer store at {} ({})", root.display(), overlay.name());
        Ok(Self {
            root,
            overlay,
            unmount,
            registry: Mutex::new(registry),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn registry_path(&self) -> PathBuf {
        self.root.join("registry.json")
    }

    fn layer_dir(&self, id: &LayerId) -> PathBuf {
        self.root.join("layers").join(id.as_str())
    }

    fn key_lock_path(&self, id: &LayerId) -> PathBuf {
        self.root.join("locks").join(format!("{}.lock", id))
    }

    /// Hold while choosing or creating the base of `environment`, so that
    /// concurrent invocations agree on one base
    pub async fn lock_environment(&self, environment: &str) -> ConbuilderResult<EnvironmentLock> {
        let path = self.root.join("locks").join(format!("base-{}.lock", environment));
        Ok(EnvironmentLock {
            _lock: FileLock::acquire_async(path).await?,
        })
    }

    /// Apply a mutation atomically with respect to every other store user.
    /// The registry is only written back if `f` succeeds.
    fn update<R>(
        &self,
        f: impl FnOnce(&mut Registry) -> ConbuilderResult<R>,
    ) -> ConbuilderResult<R> {
        let mut guard = self
            .registry
            .lock()
            .map_err(|_| ConbuilderError::Internal("registry mutex poisoned".to_string()))?;
        let _lock = FileLock::acquire(&self.root.join("registry.lock"))?;

        let mut next = Registry::load(&self.registry_path())?;
        let result = f(&mut next)?;
        next.save(&self.registry_path())?;
        *guard = next;
        Ok(result)
    }

    /// Read a consistent snapshot
    fn read<R>(&self, f: impl FnOnce(&Registry) -> R) -> ConbuilderResult<R> {
        let mut guard = self
            .registry
            .lock()
            .map_err(|_| ConbuilderError::Internal("registry mutex poisoned".to_string()))?;
        let _lock = FileLock::acquire(&self.root.join("registry.lock"))?;
        *guard = Registry::load(&self.registry_path())?;
        Ok(f(&guard))
    }

    /// All registered layers, ordered by tier then id
    pub fn list(&self) -> ConbuilderResult<Vec<Layer>> {
        self.read(|reg| reg.layers().into_iter().cloned().collect())
    }

    pub fn get(&self, id: &LayerId) -> ConbuilderResult<Option<Layer>> {
        self.read(|reg| reg.get(id).cloned())
    }

    /// Reusable layer for `key`, without touching its timestamps
    pub fn lookup(&self, key: &LayerKey) -> ConbuilderResult<Option<Layer>> {
        self.read(|reg| reg.find(key).cloned())
    }

    /// Current base for an environment
    pub fn current_base(&self, environment: &str) -> ConbuilderResult<Option<Layer>> {
        self.read(|reg| reg.current_base(environment).cloned())
    }

    /// Layer and its ancestors, top first
    pub fn lineage(&self, id: &LayerId) -> ConbuilderResult<Vec<Layer>> {
        self.read(|reg| {
            reg.lineage(id)
                .map(|chain| chain.into_iter().cloned().collect::<Vec<_>>())
        })?
    }

    pub fn children(&self, id: &LayerId) -> ConbuilderResult<Vec<Layer>> {
        self.read(|reg| reg.children(id).into_iter().cloned().collect())
    }

    pub fn active_mounts(&self) -> ConbuilderResult<Vec<MountRecord>> {
        self.read(|reg| reg.mounts().into_iter().cloned().collect())
    }

    /// Why a layer cannot be deleted right now, if anything holds it
    pub fn in_use_reason(&self, id: &LayerId) -> ConbuilderResult<Option<String>> {
        self.read(|reg| reg.in_use_reason(id))
    }

    /// Reusable layer for `key` with its `last_used_at` refreshed
    pub fn reuse(&self, key: &LayerKey) -> ConbuilderResult<Option<Layer>> {
        self.update(|reg| {
            if reg.find(key).is_none() {
                return Ok(None);
            }
            Ok(reg.touch(&key.id(), Utc::now()).cloned())
        })
    }

    /// Return the sealed layer for `key`, building it with `builder` on a miss.
    ///
    /// Constructions of the same key are serialized across tasks and
    /// processes; a caller that waited receives the layer the first caller
    /// built without running `builder` again.
    pub async fn find_or_create(
        &self,
        key: &LayerKey,
        builder: &dyn LayerBuilder,
    ) -> ConbuilderResult<Layer> {
        if key.tier.parent_tier().is_some() != key.parent.is_some() {
            return Err(ConbuilderError::InvalidLayerChain(format!(
                "{} layer key has the wrong parent arity",
                key.tier
            )));
        }

        if let Some(layer) = self.reuse(key)? {
            info!(layer = %layer.id, tier = %key.tier, "Reusing cached layer");
            return Ok(layer);
        }

        let id = key.id();
        let _construction = FileLock::acquire_async(self.key_lock_path(&id)).await?;

        // Someone else may have finished while we waited
        if let Some(layer) = self.reuse(key)? {
            info!(layer = %layer.id, tier = %key.tier, "Layer built by concurrent invocation");
            return Ok(layer);
        }

        info!(
            layer = %id,
            tier = %key.tier,
            fingerprint = %key.fingerprint,
            "Constructing layer"
        );

        match &key.parent {
            None => self.construct_base(key, builder).await,
            Some(parent) => self.construct_derived(key, parent, builder).await,
        }
    }

    async fn construct_base(
        &self,
        key: &LayerKey,
        builder: &dyn LayerBuilder,
    ) -> ConbuilderResult<Layer> {
        let staging = self.root.join("staging").join(Uuid::new_v4().to_string());
        let content = staging.join("fs");
        fs::create_dir_all(&content)
            .map_err(|e| ConbuilderError::io(format!("creating {}", content.display()), e))?;

        let ctx = LayerContext {
            key: key.clone(),
            root: content.clone(),
            parent: None,
        };

        let result = match builder.build(&ctx).await {
            Ok(()) => self.seal(&content, key, builder.describe()),
            Err(e) => Err(construction_error(key, e)),
        };

        remove_tree(&staging);
        result
    }

    async fn construct_derived(
        &self,
        key: &LayerKey,
        parent_id: &LayerId,
        builder: &dyn LayerBuilder,
    ) -> ConbuilderResult<Layer> {
        let parent = self
            .get(parent_id)?
            .ok_or_else(|| ConbuilderError::LayerNotFound(parent_id.clone()))?;
        if !parent.sealed || Some(parent.tier) != key.tier.parent_tier() {
            return Err(ConbuilderError::InvalidLayerChain(format!(
                "{} layer cannot be built on {} layer {}",
                key.tier, parent.tier, parent.id
            )));
        }

        let mount = self
            .mount_ephemeral(&parent, MountPurpose::Construction)
            .await?;
        let ctx = LayerContext {
            key: key.clone(),
            root: mount.merged().to_path_buf(),
            parent: Some(parent),
        };

        match builder.build(&ctx).await {
            Ok(()) => {
                let disposition = Disposition::Promote {
                    key: key.clone(),
                    inputs: builder.describe(),
                };
                self.finish(mount, disposition)
                    .await?
                    .ok_or_else(|| ConbuilderError::Internal("promotion produced no layer".into()))
            }
            Err(e) => {
                let err = construction_error(key, e);
                if let Err(teardown) = self.finish(mount, Disposition::Discard).await {
                    error!("Discarding failed construction: {}", err);
                    return Err(teardown);
                }
                Err(err)
            }
        }
    }

    /// Move finished content into place and register it. Caller holds the
    /// construction lock for `key`.
    fn seal(&self, content: &Path, key: &LayerKey, inputs: Vec<String>) -> ConbuilderResult<Layer> {
        let id = key.id();

        // Same key means same declared inputs: keep the registered copy
        if let Some(existing) = self.get(&id)? {
            if existing.sealed {
                info!(layer = %id, "Identical layer already sealed, discarding new content");
                return self
                    .update(|reg| Ok(reg.touch(&id, Utc::now()).cloned()))?
                    .ok_or(ConbuilderError::LayerNotFound(id));
            }
        }

        let layer_dir = self.layer_dir(&id);
        let dest = layer_dir.join("fs");
        if dest.exists() {
            warn!(layer = %id, "Removing unregistered leftover content");
            fs::remove_dir_all(&dest)
                .map_err(|e| ConbuilderError::io(format!("removing {}", dest.display()), e))?;
        }
        fs::create_dir_all(&layer_dir)
            .map_err(|e| ConbuilderError::io(format!("creating {}", layer_dir.display()), e))?;
        fs::rename(content, &dest).map_err(|e| {
            ConbuilderError::io(
                format!("moving {} to {}", content.display(), dest.display()),
                e,
            )
        })?;

        let mut layer = Layer::unsealed(key, dest);
        layer.inputs = inputs;
        layer.sealed = true;

        let registered = layer.clone();
        let superseded = self.update(move |reg| {
            reg.register(registered)?;
            if key.tier == Tier::Base {
                return Ok(reg.supersede_bases(&key.environment, &id));
            }
            Ok(Vec::new())
        });

        // Superseded bases stay until purged: a concurrent invocation may
        // hold one it has not mounted yet
        match superseded {
            Ok(old) => {
                for old in old {
                    info!(layer = %old, "Superseded base layer");
                }
            }
            Err(e) => {
                remove_tree(&layer_dir);
                return Err(e);
            }
        }

        info!(layer = %layer.id, tier = %layer.tier, "Sealed layer");
        Ok(layer)
    }

    /// Mount a private writable overlay on top of `top` and its ancestors
    pub async fn mount_ephemeral(
        &self,
        top: &Layer,
        purpose: MountPurpose,
    ) -> ConbuilderResult<OverlayMount> {
        let mount_id = Uuid::new_v4().simple().to_string();
        let root = self.root.join("mounts").join(&mount_id);
        let upper = root.join("upper");
        let work = root.join("work");
        let merged = root.join("merged");

        // Registering the mount under the registry lock pins the whole chain
        let (record, lowers) = self.update(|reg| {
            let lowers: Vec<Layer> = reg.lineage(&top.id)?.into_iter().cloned().collect();
            if let Some(unsealed) = lowers.iter().find(|l| !l.sealed) {
                return Err(ConbuilderError::InvalidLayerChain(format!(
                    "layer {} is not sealed",
                    unsealed.id
                )));
            }
            let record = MountRecord {
                id: mount_id.clone(),
                purpose,
                root: root.clone(),
                merged: merged.clone(),
                lowers: lowers.iter().map(|l| l.id.clone()).collect(),
                owner_pid: std::process::id(),
                created_at: Utc::now(),
            };
            reg.add_mount(record.clone());
            Ok((record, lowers))
        })?;

        let prepared = [&upper, &work, &merged]
            .into_iter()
            .try_for_each(|dir| fs::create_dir_all(dir))
            .map_err(|e| ConbuilderError::io(format!("creating {}", root.display()), e));

        let spec = OverlaySpec {
            lowers: lowers.iter().map(|l| l.mount_path.clone()).collect(),
            upper: upper.clone(),
            work,
            target: merged,
        };

        let mounted = match prepared {
            Ok(()) => self.overlay.mount(&spec).await,
            Err(e) => Err(e),
        };

        if let Err(e) = mounted {
            remove_tree(&root);
            self.update(|reg| Ok(reg.remove_mount(&mount_id)))?;
            return Err(e);
        }

        debug!(
            mount = %mount_id,
            top = %top.id,
            purpose = %purpose,
            "Mounted overlay at {}",
            spec.target.display()
        );

        Ok(OverlayMount {
            record,
            upper,
            lowers,
        })
    }

    /// Tear down an ephemeral overlay: unmount (with bounded retries), then
    /// discard or promote its upper directory.
    pub async fn release(
        &self,
        mount: OverlayMount,
        disposition: Disposition,
    ) -> ConbuilderResult<Option<Layer>> {
        let _construction = match &disposition {
            Disposition::Promote { key, .. } => {
                Some(FileLock::acquire_async(self.key_lock_path(&key.id())).await?)
            }
            Disposition::Discard => None,
        };
        self.finish(mount, disposition).await
    }

    async fn finish(
        &self,
        mount: OverlayMount,
        disposition: Disposition,
    ) -> ConbuilderResult<Option<Layer>> {
        // A mount that will not go away keeps its record: its lowers stay pinned
        self.unmount_with_retries(mount.merged()).await?;

        let promoted = match disposition {
            Disposition::Discard => Ok(None),
            Disposition::Promote { key, inputs } => {
                if key.parent.as_ref() != Some(&mount.top().id) {
                    Err(ConbuilderError::InvalidLayerChain(format!(
                        "cannot promote mount {} over {} into a child of {:?}",
                        mount.id(),
                        mount.top().id,
                        key.parent
                    )))
                } else {
                    self.seal(mount.upper(), &key, inputs).map(Some)
                }
            }
        };

        remove_tree(&mount.record.root);
        self.update(|reg| Ok(reg.remove_mount(mount.id())))?;
        debug!(mount = %mount.id(), "Released overlay");

        promoted
    }

    async fn unmount_with_retries(&self, target: &Path) -> ConbuilderResult<()> {
        let attempts = self.unmount.retries.saturating_add(1);
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            match self.overlay.unmount(target).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    warn!(
                        "Unmount of {} failed (attempt {}/{}): {}",
                        target.display(),
                        attempt,
                        attempts,
                        e
                    );
                    last_error = e.to_string();
                    if attempt < attempts {
                        tokio::time::sleep(self.unmount.delay).await;
                    }
                }
            }
        }

        Err(ConbuilderError::mount(
            target,
            format!("gave up after {} attempts: {}", attempts, last_error),
        ))
    }

    /// Delete a layer's content and metadata. Absent ids are not an error.
    pub fn delete(&self, id: &LayerId) -> ConbuilderResult<()> {
        match self.update(|reg| reg.remove(id))? {
            Some(layer) => {
                let dir = self.layer_dir(id);
                if dir.exists() {
                    fs::remove_dir_all(&dir)
                        .map_err(|e| ConbuilderError::io(format!("removing {}", dir.display()), e))?;
                }
                info!(layer = %id, tier = %layer.tier, "Deleted layer");
            }
            None => debug!(layer = %id, "Layer already absent"),
        }
        Ok(())
    }

    /// Drop mount records left behind by processes that no longer exist
    pub async fn reap_stale_mounts(&self) -> ConbuilderResult<Vec<MountRecord>> {
        let stale: Vec<MountRecord> = self.read(|reg| {
            reg.mounts()
                .into_iter()
                .filter(|m| !process_alive(m.owner_pid))
                .cloned()
                .collect()
        })?;

        let mut reaped = Vec::new();
        for record in stale {
            if let Err(e) = self.unmount_with_retries(&record.merged).await {
                warn!(mount = %record.id, "Leaving stale mount in place: {}", e);
                continue;
            }
            remove_tree(&record.root);
            self.update(|reg| Ok(reg.remove_mount(&record.id)))?;
            info!(mount = %record.id, pid = record.owner_pid, "Reaped stale mount");
            reaped.push(record);
        }

        Ok(reaped)
    }
}

fn construction_error(key: &LayerKey, err: ConbuilderError) -> ConbuilderError {
    match err {
        ConbuilderError::LayerConstruction { .. } => err,
        other => ConbuilderError::LayerConstruction {
            tier: key.tier,
            fingerprint: key.fingerprint.to_string(),
            reason: other.to_string(),
        },
    }
}

fn remove_tree(path: &Path) {
    if let Err(e) = fs::remove_dir_all(path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!("Failed to remove {}: {}", path.display(), e);
        }
    }
}

fn process_alive(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    // SAFETY: signal 0 performs only the existence/permission check.
    let rc = unsafe { libc::kill(pid, 0) };
    rc == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

//! Input fingerprints
//!
//! A fingerprint is the cache key part describing what went into a layer.
//! Same inputs = same fingerprint = same layer.

use crate::error::{ConbuilderError, ConbuilderResult};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::fs;
use std::os::unix::fs::FileTypeExt;
use std::path::Path;
use tracing::debug;
use walkdir::WalkDir;

/// Directories never included in a source tree fingerprint
const IGNORED_DIRS: &[&str] = &[".git", ".pc"];

/// Hash of the declared inputs of a layer
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Wrap a precomputed fingerprint
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Incremental fingerprint over several labelled inputs
pub struct FingerprintBuilder {
    hasher: Sha256,
}

impl FingerprintBuilder {
    pub fn new() -> Self {
        Self {
            hasher: Sha256::new(),
        }
    }

    /// Add a labelled value; labels keep adjacent fields from running together
    pub fn field(mut self, label: &str, value: impl AsRef<[u8]>) -> Self {
        let value = value.as_ref();
        self.hasher.update(label.as_bytes());
        self.hasher.update((value.len() as u64).to_le_bytes());
        self.hasher.update(value);
        self
    }

    /// Add the contents of a directory tree
    pub fn tree(mut self, label: &str, root: &Path) -> ConbuilderResult<Self> {
        self.hasher.update(label.as_bytes());
        hash_tree(&mut self.hasher, root)?;
        Ok(self)
    }

    /// Finish, returning the first 12 hex chars
    pub fn finish(self) -> Fingerprint {
        let digest = self.hasher.finalize();
        Fingerprint(hex::encode(&digest[..6]))
    }
}

impl Default for FingerprintBuilder {
    fn default() -> Self {
        Self::new()
    }
}

fn hash_tree(hasher: &mut Sha256, root: &Path) -> ConbuilderResult<()> {
    if !root.is_dir() {
        return Err(ConbuilderError::PathNotFound(root.to_path_buf()));
    }

    let walker = WalkDir::new(root)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| {
            e.depth() == 0
                || !(e.file_type().is_dir()
                    && IGNORED_DIRS.contains(&e.file_name().to_string_lossy().as_ref()))
        });

    let mut files = 0usize;
    for entry in walker {
        let entry = entry.map_err(|e| {
            ConbuilderError::io(
                format!("walking source tree {}", root.display()),
                e.into_io_error()
                    .unwrap_or_else(|| std::io::Error::other("filesystem loop")),
            )
        })?;
        let rel = entry.path().strip_prefix(root).unwrap_or(entry.path());
        let rel = rel.to_string_lossy();
        let file_type = entry.file_type();

        hasher.update([entry_tag(&file_type)]);
        hasher.update(rel.as_bytes());
        hasher.update([0u8]);

        if file_type.is_symlink() {
            let target = fs::read_link(entry.path()).map_err(|e| {
                ConbuilderError::io(format!("reading link {}", entry.path().display()), e)
            })?;
            hasher.update(target.to_string_lossy().as_bytes());
            hasher.update([0u8]);
        } else if file_type.is_file() {
            let contents = fs::read(entry.path()).map_err(|e| {
                ConbuilderError::io(format!("reading {}", entry.path().display()), e)
            })?;
            hasher.update((contents.len() as u64).to_le_bytes());
            hasher.update(&contents);
            files += 1;
        }
        // Pipes, sockets and devices count by name and type only
    }

    debug!("Hashed {} files under {}", files, root.display());
    Ok(())
}

fn entry_tag(file_type: &fs::FileType) -> u8 {
    if file_type.is_dir() {
        b'd'
    } else if file_type.is_symlink() {
        b'l'
    } else if file_type.is_file() {
        b'f'
    } else if file_type.is_fifo() {
        b'p'
    } else if file_type.is_socket() {
        b's'
    } else if file_type.is_block_device() || file_type.is_char_device() {
        b'b'
    } else {
        b'?'
    }
}

/// Build dependencies (name, version) as reported by the package manager
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencySet {
    packages: Vec<(String, String)>,
}

impl DependencySet {
    /// Build a set; order and duplicates in the input do not matter
    pub fn new(packages: impl IntoIterator<Item = (String, String)>) -> Self {
        let mut packages: Vec<_> = packages.into_iter().collect();
        packages.sort();
        packages.dedup();
        Self { packages }
    }

    /// Parse the `Inst ` lines of `apt-get build-dep -s` output.
    ///
    /// Example line: `Inst gettext (0.19.8.1-4 Debian:unstable [amd64]) []`
    pub fn from_simulation<S: AsRef<str>>(lines: &[S]) -> ConbuilderResult<Self> {
        let mut packages = Vec::new();
        for line in lines {
            let line = line.as_ref();
            let Some(rest) = line.strip_prefix("Inst ") else {
                continue;
            };
            let mut parts = rest.splitn(3, ' ');
            let name = parts.next().unwrap_or_default();
            let version = parts
                .next()
                .and_then(|v| v.strip_prefix('('))
                .filter(|v| !v.is_empty())
                .ok_or_else(|| {
                    ConbuilderError::Internal(format!("cannot parse version from {:?}", line))
                })?;
            if name.is_empty() {
                return Err(ConbuilderError::Internal(format!(
                    "cannot parse package name from {:?}",
                    line
                )));
            }
            packages.push((name.to_string(), version.to_string()));
        }
        Ok(Self::new(packages))
    }

    pub fn is_empty(&self) -> bool {
        self.packages.is_empty()
    }

    pub fn len(&self) -> usize {
        self.packages.len()
    }

    /// `name:version` entries, sorted
    pub fn entries(&self) -> Vec<String> {
        self.packages
            .iter()
            .map(|(name, version)| format!("{}:{}", name, version))
            .collect()
    }

    /// `name=version` pins for `apt-get install`, sorted
    pub fn install_pins(&self) -> Vec<String> {
        self.packages
            .iter()
            .map(|(name, version)| format!("{}={}", name, version))
            .collect()
    }

    /// Deterministic fingerprint over the sorted set
    pub fn fingerprint(&self) -> Fingerprint {
        self.entries()
            .iter()
            .fold(FingerprintBuilder::new(), |fp, entry| fp.field("pkg", entry))
            .finish()
    }
}

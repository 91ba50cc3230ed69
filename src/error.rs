//! Error types for conbuilder
//!
//! All modules use `ConbuilderResult<T>` as their return type.

use crate::layer::{LayerId, Tier};
use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for conbuilder operations
pub type ConbuilderResult<T> = Result<T, ConbuilderError>;

/// All errors that can occur in conbuilder
#[derive(Error, Debug)]
pub enum ConbuilderError {
    // Layer store errors
    #[error("Failed to construct {tier} layer (fingerprint {fingerprint}): {reason}")]
    LayerConstruction {
        tier: Tier,
        fingerprint: String,
        reason: String,
    },

    #[error("Layer {id} is in use: {reason}")]
    LayerInUse { id: LayerId, reason: String },

    #[error("Layer not found: {0}")]
    LayerNotFound(LayerId),

    #[error("Invalid layer chain: {0}")]
    InvalidLayerChain(String),

    #[error("Registry at {path} is corrupt: {reason}")]
    RegistryCorrupt { path: PathBuf, reason: String },

    // Sandbox errors
    #[error("Sandbox profile not supported on this host: {0}")]
    UnsupportedProfile(String),

    // Mount errors
    #[error("Overlay mount failed at {path}: {reason}")]
    Mount { path: PathBuf, reason: String },

    // Build outcome
    #[error("Build failed in layer chain {parent} (fingerprint {fingerprint}): {status}\n{output}")]
    BuildFailure {
        parent: LayerId,
        fingerprint: String,
        status: String,
        exit_code: Option<i32>,
        output: String,
    },

    // Configuration errors
    #[error("Invalid configuration at {path}: {reason}")]
    ConfigInvalid { path: PathBuf, reason: String },

    #[error("Failed to create config directory {path}: {source}")]
    ConfigDirCreate {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // IO errors
    #[error("IO error: {context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Path not found: {0}")]
    PathNotFound(PathBuf),

    // Process errors
    #[error("Command failed: {command}")]
    CommandFailed {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Command execution error: {command}, output: {output}")]
    CommandExecution { command: String, output: String },

    // Serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    // General errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("{0}")]
    User(String),
}

impl ConbuilderError {
    /// Create an IO error with context
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Create a command failed error
    pub fn command_failed(command: impl Into<String>, source: std::io::Error) -> Self {
        Self::CommandFailed {
            command: command.into(),
            source,
        }
    }

    /// Create a command execution error
    pub fn command_exec(command: impl Into<String>, output: impl Into<String>) -> Self {
        Self::CommandExecution {
            command: command.into(),
            output: output.into(),
        }
    }

    /// Create a mount error
    pub fn mount(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::Mount {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::LayerInUse { .. } | Self::Mount { .. })
    }

    /// Get actionable hint for the error
    pub fn hint(&self) -> Option<&'static str> {
        match self {
            Self::LayerInUse { .. } => Some("Retry once the running build finishes, or skip this layer"),
            Self::UnsupportedProfile(_) => {
                Some("Relax the [sandbox] section of the config or the build flags")
            }
            Self::Mount { .. } => Some("Check `conbuilder show` and unmount stale overlays"),
            Self::RegistryCorrupt { .. } => Some("Move the registry aside and rebuild the cache"),
            _ => None,
        }
    }
}

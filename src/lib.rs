//! conbuilder - Debian package builds on cached overlay layers
//!
//! Packages are built inside systemd-nspawn containers running on a stack of
//! overlay layers: a bootstrapped base system, the build dependencies of one
//! package, and the build itself. Each layer is keyed by its inputs and
//! reused as long as they do not change.

pub mod cli;
pub mod config;
pub mod error;
pub mod eviction;
pub mod inspect;
pub mod layer;
pub mod orchestrator;
pub mod overlay;
pub mod sandbox;
pub mod ui;

#[cfg(test)]
mod testing;

pub use error::{ConbuilderError, ConbuilderResult};

//! # Phase 3: manifest consolidation for a backup run
//!
//! Drives the last stage of a backup: the changed and unchanged manifests are
//! merged into one ([`reconcile`]), the run's per-chunk hook files are reduced
//! into a local sparse index, and that index is folded into the global one
//! shared by every run.
//!
//! The building blocks live in their own crates:
//!
//! - `manio`: record framing, manifest and hook file streams
//! - `advlock`: the advisory lock guarding the global index
//! - `sparse`: pairwise merge, tournament build and global merge

pub mod config;
pub mod error;
pub mod reconcile;

pub use config::{ConfigError, Phase3Config};
pub use error::{Error, ErrorKind, Result};
pub use reconcile::{reconcile, ReconcileStats};

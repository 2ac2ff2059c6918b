//! # Sparse: fingerprint-sorted sparse indexes
//!
//! A sparse index is a hook file (see [`manio::HookWriter`]) whose records
//! are sorted by fingerprint bytes with no two records sharing a fingerprint
//! set. Future backups consult it to find which blocks already exist.
//!
//! Indexes are **write-once**: every merge writes a new file and the old one
//! is replaced by rename, never edited in place.
//!
//! ## Building one
//!
//! ```text
//! hooks/00000000 ─┐
//! hooks/00000001 ─┴─ merge ─► h1/00000000 ─┐
//! hooks/00000002 ─┐                        ├─ merge ─► h2/00000000 ─► sparse
//! hooks/00000003 ─┴─ merge ─► h1/00000001 ─┘
//!
//! sparse + <global>/sparse ─ merge (under <global>/sparse.lock) ─► <global>/sparse
//! ```
//!
//! - [`merge_sparse_indexes`] is one pairwise merge.
//! - [`build_local_sparse`] runs the tournament reduction over a manifest's
//!   hook files.
//! - [`merge_into_global`] folds a local index into the shared global one.
//! - [`SparseLookup`] loads an index for fingerprint lookups.

mod global;
mod lookup;
mod merge;
mod tournament;

pub use global::merge_into_global;
pub use lookup::{read_index, SparseLookup};
pub use merge::{merge_hooks, merge_sparse_indexes, MergeStats};
pub use tournament::{build_local_sparse, LocalBuild};

use std::io;
use std::path::{Path, PathBuf};

use advlock::LockError;
use manio::{HookReader, ManioError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SparseError {
    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error(transparent)]
    Manio(#[from] ManioError),
    #[error(transparent)]
    Lock(#[from] LockError),
}

pub type Result<T> = std::result::Result<T, SparseError>;

pub(crate) fn io_at(path: &Path) -> impl FnOnce(io::Error) -> SparseError + '_ {
    move |source| SparseError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Opens a hook file, attaching the path to open failures.
pub(crate) fn open_hooks(path: &Path) -> Result<HookReader<std::fs::File>> {
    HookReader::open(path).map_err(|e| match e {
        ManioError::Io(source) => io_at(path)(source),
        other => other.into(),
    })
}

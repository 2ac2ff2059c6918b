//! On-disk naming contract shared by the manifest writer and the sparse
//! index builder.
//!
//! Chunk and hook files are named by a zero-padded 8-digit upper-case hex
//! index, so lexical order of names equals numeric order of indexes.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Per-chunk hook files written alongside a manifest.
pub const HOOKS_DIR: &str = "hooks";
/// Scratch directories the tournament passes alternate between.
pub const H1_DIR: &str = "h1";
pub const H2_DIR: &str = "h2";
/// A run's local sparse index, and the global one in the data directory.
pub const SPARSE_FILE: &str = "sparse";
pub const SPARSE_LOCK_FILE: &str = "sparse.lock";
pub const SPARSE_TMP_PREFIX: &str = "sparse.tmp.";

/// `00000000`, `00000001`, ...
pub fn chunk_name(index: u64) -> String {
    format!("{index:08X}")
}

/// Parses a name produced by [`chunk_name`].
pub fn parse_chunk_name(name: &str) -> Option<u64> {
    if name.len() != 8 || !name.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    u64::from_str_radix(name, 16).ok()
}

pub fn chunk_path(dir: &Path, index: u64) -> PathBuf {
    dir.join(chunk_name(index))
}

/// Creates the parent directory of a file that is about to be written.
pub fn ensure_parent_dir(path: &Path) -> io::Result<()> {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => fs::create_dir_all(parent),
        _ => Ok(()),
    }
}

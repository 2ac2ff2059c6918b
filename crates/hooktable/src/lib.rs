//! # HookTable
//!
//! An in-memory, fingerprint-ordered buffer of hook records for one manifest
//! chunk.
//!
//! While a manifest chunk is being written, every entry that carried
//! signature blocks contributes one hook: the entry's path paired with the
//! concatenation of its fingerprints. When the chunk is closed the table is
//! drained to a hook file in ascending fingerprint order, which is the order
//! the sparse-index merge passes expect.
//!
//! ## Key properties
//! - **Sorted order**: hooks are always iterated in ascending fingerprint order.
//! - **Later insert wins**: inserting a fingerprint set that is already present
//!   replaces the stored path, matching the merge rule that the incoming side
//!   is authoritative.
//! - **Approximate size tracking**: tracks the byte size of fingerprints + paths.
//!
//! ## Example
//! ```rust
//! use hooktable::HookTable;
//!
//! let mut t = HookTable::new();
//! t.insert(b"0000000000000002".to_vec(), b"b".to_vec());
//! t.insert(b"0000000000000001".to_vec(), b"a".to_vec());
//! let order: Vec<_> = t.iter().map(|(_, p)| p.clone()).collect();
//! assert_eq!(order, vec![b"a".to_vec(), b"b".to_vec()]);
//! ```

use std::collections::BTreeMap;

/// An ordered, in-memory hook buffer backed by a `BTreeMap`.
///
/// Keys are concatenated fingerprints, values are the path of the entry the
/// fingerprints belong to.
#[derive(Debug)]
pub struct HookTable {
    map: BTreeMap<Vec<u8>, Vec<u8>>,
    approx_size: usize,
}

impl HookTable {
    /// Creates a new, empty table.
    pub fn new() -> Self {
        Self {
            map: BTreeMap::new(),
            approx_size: 0,
        }
    }

    /// Inserts a hook, replacing the path of an identical fingerprint set.
    ///
    /// Returns the replaced path, if any.
    pub fn insert(&mut self, fingerprints: Vec<u8>, path: Vec<u8>) -> Option<Vec<u8>> {
        match self.map.get(&fingerprints) {
            Some(old) => {
                // Fingerprint bytes already counted.
                self.approx_size = self.approx_size.saturating_sub(old.len());
            }
            None => {
                self.approx_size = self.approx_size.saturating_add(fingerprints.len());
            }
        }
        self.approx_size = self.approx_size.saturating_add(path.len());
        self.map.insert(fingerprints, path)
    }

    /// Returns the path stored for an exact fingerprint set.
    pub fn get(&self, fingerprints: &[u8]) -> Option<&Vec<u8>> {
        self.map.get(fingerprints)
    }

    /// Returns an iterator over `(fingerprints, path)` in ascending
    /// fingerprint order.
    pub fn iter(&self) -> impl Iterator<Item = (&Vec<u8>, &Vec<u8>)> {
        self.map.iter()
    }

    /// Returns the number of distinct fingerprint sets.
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Returns `true` if the table holds no hooks.
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Returns the approximate byte size of all fingerprints and paths.
    ///
    /// `BTreeMap` node overhead is not included.
    pub fn approx_size(&self) -> usize {
        self.approx_size
    }

    /// Removes all hooks and resets `approx_size` to zero, keeping the
    /// table for the next chunk.
    pub fn clear(&mut self) {
        self.map.clear();
        self.approx_size = 0;
    }
}

impl Default for HookTable {
    fn default() -> Self {
        Self::new()
    }
}

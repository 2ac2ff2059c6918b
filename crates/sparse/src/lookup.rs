use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};

use manio::{Fingerprint, HookRecord, ManioError, Pull};

use crate::{open_hooks, Result, SparseError};

/// Reads every hook record of a sparse index, in file order.
pub fn read_index(path: &Path) -> Result<Vec<HookRecord>> {
    let mut reader = open_hooks(path)?;
    let mut hooks = Vec::new();
    while let Pull::Item(hook) = reader.next_hook()? {
        hooks.try_reserve(1).map_err(ManioError::from)?;
        hooks.push(hook);
    }
    Ok(hooks)
}

/// A sparse index loaded for block lookups.
///
/// On [`open`](SparseLookup::open) every record is read and each individual
/// fingerprint is mapped to the paths of the records that contain it. A
/// backup consults [`candidates`](SparseLookup::candidates) to find earlier
/// entries that already hold a block.
#[derive(Debug, Default)]
pub struct SparseLookup {
    path: PathBuf,
    index: BTreeMap<Fingerprint, Vec<Vec<u8>>>,
    records: usize,
}

impl SparseLookup {
    /// Loads the sparse index at `path`. A missing file is an empty index.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let hooks = match read_index(path) {
            Ok(hooks) => hooks,
            Err(SparseError::Io { source, .. }) if source.kind() == io::ErrorKind::NotFound => {
                Vec::new()
            }
            Err(e) => return Err(e),
        };

        let mut index: BTreeMap<Fingerprint, Vec<Vec<u8>>> = BTreeMap::new();
        let records = hooks.len();
        for hook in hooks {
            for fp in hook.iter() {
                let paths = index.entry(fp).or_default();
                if paths.last() != Some(&hook.path) {
                    paths.push(hook.path.clone());
                }
            }
        }

        Ok(Self {
            path: path.to_path_buf(),
            index,
            records,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Paths of the records containing `fp`, in index order.
    pub fn candidates(&self, fp: &Fingerprint) -> &[Vec<u8>] {
        self.index.get(fp).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn contains(&self, fp: &Fingerprint) -> bool {
        self.index.contains_key(fp)
    }

    /// Distinct fingerprints in ascending order.
    pub fn fingerprints(&self) -> impl Iterator<Item = &Fingerprint> {
        self.index.keys()
    }

    /// Number of distinct fingerprints.
    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Number of hook records the index was built from.
    pub fn records(&self) -> usize {
        self.records
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{hook, write_index};
    use tempfile::tempdir;

    // -------------------- Lookups --------------------

    #[test]
    fn maps_each_fingerprint_to_its_records() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("sparse");
        write_index(
            &path,
            &[hook("a", &[1, 2]), hook("b", &[2]), hook("c", &[3, 3])],
        );

        let lookup = SparseLookup::open(&path)?;
        assert_eq!(lookup.records(), 3);
        assert_eq!(lookup.len(), 3);
        assert_eq!(lookup.candidates(&Fingerprint::from_u64(1)), &[b"a".to_vec()]);
        assert_eq!(
            lookup.candidates(&Fingerprint::from_u64(2)),
            &[b"a".to_vec(), b"b".to_vec()]
        );
        // A block repeated within one record is listed once.
        assert_eq!(lookup.candidates(&Fingerprint::from_u64(3)), &[b"c".to_vec()]);
        assert!(lookup.candidates(&Fingerprint::from_u64(4)).is_empty());
        assert!(!lookup.contains(&Fingerprint::from_u64(4)));
        Ok(())
    }

    #[test]
    fn fingerprints_iterate_sorted() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("sparse");
        write_index(&path, &[hook("x", &[9, 1]), hook("y", &[5])]);

        let lookup = SparseLookup::open(&path)?;
        let fps: Vec<_> = lookup.fingerprints().copied().collect();
        assert_eq!(
            fps,
            vec![
                Fingerprint::from_u64(1),
                Fingerprint::from_u64(5),
                Fingerprint::from_u64(9)
            ]
        );
        Ok(())
    }

    // -------------------- Missing and malformed --------------------

    #[test]
    fn missing_file_is_empty() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let lookup = SparseLookup::open(dir.path().join("sparse"))?;
        assert!(lookup.is_empty());
        assert_eq!(lookup.records(), 0);
        Ok(())
    }

    #[test]
    fn malformed_file_is_an_error() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("sparse");
        std::fs::write(&path, b"\x02\x00\x00")?;
        assert!(matches!(
            SparseLookup::open(&path),
            Err(SparseError::Manio(ManioError::Corrupt(_)))
        ));
        Ok(())
    }
}

//! Consolidation of a backup run's manifests.
//!
//! A run leaves two path-sorted manifests behind: entries whose content
//! changed and entries carried over unchanged. [`reconcile`] merges them into
//! one manifest, builds the run's sparse index from the per-chunk hook files
//! written along the way, folds that into the global sparse index and finally
//! prunes the two input manifests.
//!
//! Nothing is deleted until the global index has been replaced, so a failed
//! run can simply be retried with the same inputs.

use std::cmp::Ordering;
use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};
use tracing::{debug, info};

use manio::naming::SPARSE_FILE;
use manio::{
    Fingerprint, HookRecord, ManifestReader, ManifestWriter, ManioError, Pull, StreamEntry,
    StreamItem,
};
use sparse::{build_local_sparse, merge_into_global, MergeStats};

use crate::config::Phase3Config;
use crate::error::{Error, Result};

/// Counters from one [`reconcile`] run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileStats {
    /// Entries written to the new manifest.
    pub entries: u64,
    pub from_changed: u64,
    pub from_unchanged: u64,
    /// Unchanged entries dropped because the changed manifest had the same path.
    pub superseded: u64,
    /// Signatures copied to the new manifest.
    pub signatures: u64,
    /// Hook files the local sparse index was built from.
    pub hook_files: u64,
    /// Records in the run's local sparse index.
    pub local_hooks: u64,
    pub global: MergeStats,
}

/// One input manifest with the entry read ahead of it.
struct Cursor {
    name: &'static str,
    reader: ManifestReader,
    held: Option<StreamEntry>,
    last_path: Option<Vec<u8>>,
    exhausted: bool,
}

impl Cursor {
    fn new(name: &'static str, reader: ManifestReader) -> Self {
        Self {
            name,
            reader,
            held: None,
            last_path: None,
            exhausted: false,
        }
    }

    fn fill(&mut self) -> Result<()> {
        if self.held.is_some() || self.exhausted {
            return Ok(());
        }
        match self.reader.read_next()? {
            Pull::Item(StreamItem::Entry(entry)) => self.hold(entry),
            Pull::Item(StreamItem::Signature(_)) => Err(ManioError::Protocol(format!(
                "{} manifest: signature without an owning entry",
                self.name
            ))
            .into()),
            Pull::EndOfStream => {
                self.exhausted = true;
                Ok(())
            }
        }
    }

    fn hold(&mut self, entry: StreamEntry) -> Result<()> {
        if let Some(last) = &self.last_path {
            if entry.path <= *last {
                return Err(ManioError::Protocol(format!(
                    "{} manifest: entry {:?} is out of path order",
                    self.name,
                    String::from_utf8_lossy(&entry.path)
                ))
                .into());
            }
        }
        self.last_path = Some(entry.path.clone());
        self.held = Some(entry);
        Ok(())
    }

    /// Passes each signature trailing the consumed entry to `f`, stopping at
    /// the next entry (which becomes held) or the end of the manifest.
    fn drain_signatures(
        &mut self,
        mut f: impl FnMut(&Fingerprint) -> Result<()>,
    ) -> Result<()> {
        loop {
            match self.reader.read_next()? {
                Pull::Item(StreamItem::Signature(fp)) => f(&fp)?,
                Pull::Item(StreamItem::Entry(entry)) => return self.hold(entry),
                Pull::EndOfStream => {
                    self.exhausted = true;
                    return Ok(());
                }
            }
        }
    }

    /// Writes the held entry and its signatures to `out`, then its hook.
    fn copy_entry(&mut self, out: &mut ManifestWriter, stats: &mut ReconcileStats) -> Result<()> {
        let Some(entry) = self.held.take() else {
            return Ok(());
        };
        out.write_entry(&entry)?;

        let mut hook = HookRecord::new(entry.path);
        self.drain_signatures(|fp| {
            out.write_signature(fp)?;
            hook.push(fp)?;
            stats.signatures += 1;
            Ok(())
        })?;
        out.write_hook(hook)?;
        stats.entries += 1;
        Ok(())
    }

    /// Drops the held entry and its signatures.
    fn skip_entry(&mut self) -> Result<()> {
        if self.held.take().is_some() {
            self.drain_signatures(|_| Ok(()))?;
        }
        Ok(())
    }
}

fn remove_superseded(dir: &Path) -> Result<()> {
    match fs::remove_dir_all(dir) {
        Ok(()) => {
            debug!(dir = %dir.display(), "removed superseded manifest");
            Ok(())
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(Error::Io {
            path: dir.to_path_buf(),
            source,
        }),
    }
}

/// `path` made absolute with `.` and `..` folded and symlinks resolved.
/// Components that do not exist yet are appended to the resolved part that
/// does.
fn resolve(path: &Path) -> Result<PathBuf> {
    let io_err = |source| Error::Io {
        path: path.to_path_buf(),
        source,
    };
    let joined = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir().map_err(io_err)?.join(path)
    };
    let mut absolute = PathBuf::new();
    for component in joined.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                absolute.pop();
            }
            other => absolute.push(other),
        }
    }

    let mut missing = Vec::new();
    let mut cur = absolute.as_path();
    loop {
        match fs::canonicalize(cur) {
            Ok(mut resolved) => {
                resolved.extend(missing.iter().rev());
                return Ok(resolved);
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                match (cur.parent(), cur.file_name()) {
                    (Some(parent), Some(name)) => {
                        missing.push(name);
                        cur = parent;
                    }
                    _ => return Ok(absolute),
                }
            }
            Err(e) => return Err(io_err(e)),
        }
    }
}

/// Rejects a manifest directory equal to, inside, or containing an input.
/// Writing there would clobber the input before it is read, and pruning the
/// input would take the new manifest with it.
fn check_disjoint(manifest_dir: &Path, inputs: [(&'static str, &Path); 2]) -> Result<()> {
    let output = resolve(manifest_dir)?;
    for (name, input) in inputs {
        let resolved = resolve(input)?;
        if output.starts_with(&resolved) || resolved.starts_with(&output) {
            return Err(Error::Overlap {
                name,
                input: input.to_path_buf(),
                output: manifest_dir.to_path_buf(),
            });
        }
    }
    Ok(())
}

/// Merges `changed` and `unchanged` into a new manifest in `manifest_dir`,
/// then builds `<manifest_dir>/sparse` and merges it into
/// `<global_data_dir>/sparse`.
///
/// Entries are merged in path order. When both manifests hold a path, the
/// changed entry and its signatures are kept and the unchanged one is
/// dropped. On success the input manifest directories are removed; on
/// failure they are left as they were.
///
/// `manifest_dir` must not overlap either input directory.
pub fn reconcile(
    changed: ManifestReader,
    unchanged: ManifestReader,
    manifest_dir: &Path,
    global_data_dir: &Path,
    config: &Phase3Config,
) -> Result<ReconcileStats> {
    info!("Start phase3");

    let changed_dir: PathBuf = changed.directory().to_path_buf();
    let unchanged_dir: PathBuf = unchanged.directory().to_path_buf();
    check_disjoint(
        manifest_dir,
        [("changed", changed_dir.as_path()), ("unchanged", unchanged_dir.as_path())],
    )?;

    let mut ch = Cursor::new("changed", changed);
    let mut un = Cursor::new("unchanged", unchanged);

    let mut out = ManifestWriter::create(manifest_dir, config.manifest_options())?;
    let mut stats = ReconcileStats::default();

    loop {
        ch.fill()?;
        un.fill()?;

        let order = match (&ch.held, &un.held) {
            (None, None) => break,
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (Some(c), Some(u)) => c.path.cmp(&u.path),
        };
        match order {
            Ordering::Less => {
                ch.copy_entry(&mut out, &mut stats)?;
                stats.from_changed += 1;
            }
            Ordering::Greater => {
                un.copy_entry(&mut out, &mut stats)?;
                stats.from_unchanged += 1;
            }
            Ordering::Equal => {
                ch.copy_entry(&mut out, &mut stats)?;
                un.skip_entry()?;
                stats.from_changed += 1;
                stats.superseded += 1;
            }
        }
    }

    let summary = out.set_read_mode()?;
    info!(
        manifest = %summary.dir.display(),
        entries = summary.entry_count,
        chunks = summary.chunk_count,
        superseded = stats.superseded,
        "merged manifests"
    );

    let sync = config.manifest.sync;
    let local = build_local_sparse(manifest_dir, summary.chunk_count, sync)?;
    stats.hook_files = summary.chunk_count;
    stats.local_hooks = local.hooks;

    let global = global_data_dir.join(SPARSE_FILE);
    stats.global = merge_into_global(&local.path, &global, &config.lock_policy(), sync)?;

    remove_superseded(&changed_dir)?;
    remove_superseded(&unchanged_dir)?;

    info!("End phase3");
    Ok(stats)
}

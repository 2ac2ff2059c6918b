use std::ffi::OsString;
use std::fs;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::info;

use advlock::{LockHandle, LockPolicy};
use manio::HookWriter;

use crate::merge::{merge_hooks, MergeStats};
use crate::{io_at, open_hooks, Result};

/// `<dir>/<name><suffix>` for a file `<dir>/<name>`.
fn sibling(path: &Path, suffix: &str) -> Result<PathBuf> {
    let Some(name) = path.file_name() else {
        return Err(io_at(path)(io::Error::new(
            io::ErrorKind::InvalidInput,
            "sparse index path has no file name",
        )));
    };
    let mut name = OsString::from(name);
    name.push(suffix);
    Ok(path.with_file_name(name))
}

fn parent_dir(path: &Path) -> &Path {
    match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    }
}

/// Folds the local sparse index at `local` into the shared index at `global`.
///
/// Holds `<global>.lock` for the whole operation, acquired with `policy`.
/// A missing global index is merged against nothing. The merge is written to
/// a `<global>.tmp.*` file in the same directory and renamed over `global`
/// only once it is complete, so a failure at any point leaves the existing
/// global index untouched. On equal fingerprint sets the record already in
/// the global index is kept.
///
/// The replacement keeps the permissions of the file it replaces. A new
/// global index takes those of `local`.
pub fn merge_into_global(
    local: &Path,
    global: &Path,
    policy: &LockPolicy,
    sync: bool,
) -> Result<MergeStats> {
    let lock_path = sibling(global, ".lock")?;
    let tmp_name = sibling(global, ".tmp.")?;
    let tmp_prefix = tmp_name.file_name().unwrap_or_default();
    let dir = parent_dir(global);

    let _lock = LockHandle::acquire_with_retry(&lock_path, policy)?;

    let existing = match fs::symlink_metadata(global) {
        Ok(_) => Some(global),
        Err(e) if e.kind() == io::ErrorKind::NotFound => None,
        Err(e) => return Err(io_at(global)(e)),
    };

    let left = open_hooks(local)?;
    let right = existing.map(open_hooks).transpose()?;

    let mut tmp = tempfile::Builder::new()
        .prefix(tmp_prefix)
        .tempfile_in(dir)
        .map_err(io_at(dir))?;
    let tmp_path = tmp.path().to_path_buf();

    // tempfile creates 0600.
    let template = existing.unwrap_or(local);
    let perms = fs::metadata(template)
        .map_err(io_at(template))?
        .permissions();
    tmp.as_file()
        .set_permissions(perms)
        .map_err(io_at(&tmp_path))?;

    let stats = {
        let mut out = HookWriter::new(BufWriter::new(tmp.as_file_mut()));
        let stats = merge_hooks(left, right, &mut out)?;
        out.into_inner()?.flush().map_err(io_at(&tmp_path))?;
        stats
    };
    if sync {
        tmp.as_file().sync_all().map_err(io_at(&tmp_path))?;
    }
    tmp.persist(global).map_err(|e| io_at(global)(e.error))?;

    info!(
        local = %local.display(),
        global = %global.display(),
        created = existing.is_none(),
        written = stats.written(),
        collapsed = stats.collapsed,
        "merged into global sparse index"
    );
    Ok(stats)
}

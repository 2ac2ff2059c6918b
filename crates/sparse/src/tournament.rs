use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use manio::naming::{chunk_path, H1_DIR, H2_DIR, HOOKS_DIR, SPARSE_FILE};
use manio::HookWriter;

use crate::merge::merge_sparse_indexes;
use crate::{io_at, Result};

/// Outcome of [`build_local_sparse`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalBuild {
    /// `<manifest_dir>/sparse`.
    pub path: PathBuf,
    /// Number of merge passes run; zero when there was nothing to merge.
    pub passes: u32,
    /// Hook records in the final index.
    pub hooks: u64,
}

/// The `h1`/`h2` scratch directories, removed when dropped.
struct ScratchDirs {
    dirs: [PathBuf; 2],
}

impl ScratchDirs {
    fn new(manifest_dir: &Path) -> Self {
        let scratch = Self {
            dirs: [manifest_dir.join(H1_DIR), manifest_dir.join(H2_DIR)],
        };
        // Leftovers from an interrupted run.
        scratch.clear();
        scratch
    }

    fn clear(&self) {
        for dir in &self.dirs {
            match fs::remove_dir_all(dir) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => warn!(dir = %dir.display(), error = %e, "could not remove scratch dir"),
            }
        }
    }
}

impl Drop for ScratchDirs {
    fn drop(&mut self) {
        self.clear();
    }
}

/// Reduces `<manifest_dir>/hooks/00000000 ..` into `<manifest_dir>/sparse`.
///
/// The `fcount` hook files are merged pairwise, `2i` with `2i+1` into `i`,
/// alternating between the `h1` and `h2` scratch directories until a single
/// file remains. An odd file out is copied through unpaired. With no hook
/// files at all an empty index is written.
///
/// The scratch directories are gone on return, whether or not the build
/// succeeded.
pub fn build_local_sparse(manifest_dir: &Path, fcount: u64, sync: bool) -> Result<LocalBuild> {
    let hooks_dir = manifest_dir.join(HOOKS_DIR);
    let sparse = manifest_dir.join(SPARSE_FILE);
    let scratch = ScratchDirs::new(manifest_dir);

    if fcount == 0 {
        HookWriter::create(&sparse)?.finish_file(sync)?;
        info!(path = %sparse.display(), "no hook files, wrote empty sparse index");
        return Ok(LocalBuild {
            path: sparse,
            passes: 0,
            hooks: 0,
        });
    }

    let mut count = fcount;
    let mut passes = 0u32;
    let mut src = hooks_dir;
    let mut dst = scratch.dirs[0].clone();
    let mut hooks = 0;

    loop {
        passes += 1;
        let mut i = 0;
        while i < count {
            let a = chunk_path(&src, i);
            let b = (i + 1 < count).then(|| chunk_path(&src, i + 1));
            let out = chunk_path(&dst, i / 2);
            hooks = merge_sparse_indexes(&a, b.as_deref(), &out, sync)?.written();
            i += 2;
        }
        debug!(pass = passes, files_in = count, files_out = i / 2, "tournament pass");
        count = i / 2;
        if count < 2 {
            break;
        }

        src = dst;
        dst = if src == scratch.dirs[0] {
            scratch.dirs[1].clone()
        } else {
            scratch.dirs[0].clone()
        };
    }

    let survivor = chunk_path(&dst, 0);
    fs::rename(&survivor, &sparse).map_err(io_at(&sparse))?;
    drop(scratch);

    info!(
        path = %sparse.display(),
        hook_files = fcount,
        passes,
        hooks,
        "built sparse index"
    );
    Ok(LocalBuild {
        path: sparse,
        passes,
        hooks,
    })
}

//! # Advlock
//!
//! Advisory, whole-file exclusive locks shared between cooperating
//! processes.
//!
//! The holder writes `"{holder_name}\n{pid}\n"` into the lock file and
//! fsyncs it once the lock is held, so the owner of a stuck lock can be
//! identified from disk. Releasing unlocks but leaves the file in place.
//!
//! ## Example
//! ```no_run
//! use advlock::{LockHandle, LockPolicy};
//!
//! let policy = LockPolicy::default();
//! let mut lock = LockHandle::acquire_with_retry("/var/spool/data/sparse.lock", &policy)?;
//! // ... mutate the shared file ...
//! lock.release();
//! # Ok::<(), advlock::LockError>(())
//! ```

use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum LockError {
    #[error("lock {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("gave up waiting for lock {path} after {attempts} attempts ({waited:?})")]
    Timeout {
        path: PathBuf,
        attempts: u32,
        waited: Duration,
    },
}

pub type Result<T> = std::result::Result<T, LockError>;

/// Retry policy for [`LockHandle::acquire_with_retry`].
#[derive(Debug, Clone)]
pub struct LockPolicy {
    pub max_attempts: u32,
    pub interval: Duration,
    /// How often a still-waiting caller logs that it is waiting.
    pub report_every: Duration,
    /// Written to the lock file as the first line.
    pub holder_name: String,
}

impl Default for LockPolicy {
    /// 1800 attempts two seconds apart (one hour), reporting every ten
    /// seconds.
    fn default() -> Self {
        Self {
            max_attempts: 1800,
            interval: Duration::from_secs(2),
            report_every: Duration::from_secs(10),
            holder_name: program_name(),
        }
    }
}

impl LockPolicy {
    /// Attempts between two progress reports, at least one.
    fn attempts_per_report(&self) -> u32 {
        if self.interval.is_zero() {
            return u32::MAX;
        }
        let n = self.report_every.as_nanos() / self.interval.as_nanos();
        u32::try_from(n).unwrap_or(u32::MAX).max(1)
    }
}

/// Outcome of a single non-blocking attempt.
#[derive(Debug)]
pub enum Acquire {
    Got(LockHandle),
    Busy,
}

/// Result of [`probe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockStatus {
    Free,
    Held,
}

/// Identity recorded in a lock file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockHolder {
    pub name: String,
    pub pid: u32,
}

/// An acquired lock. Dropping the handle releases it.
#[derive(Debug)]
pub struct LockHandle {
    path: PathBuf,
    file: Option<File>,
    holder: LockHolder,
}

impl LockHandle {
    /// Tries once to take the lock at `path` without blocking.
    ///
    /// Creates the parent directory and the lock file if needed.
    ///
    /// # Errors
    ///
    /// Failing to create the directory, open the file, or record the holder
    /// is an error; a lock held elsewhere is `Ok(Acquire::Busy)`.
    pub fn acquire<P: AsRef<Path>>(path: P, holder_name: &str) -> Result<Acquire> {
        let path = path.as_ref();
        let io_err = |source: io::Error| LockError::Io {
            path: path.to_path_buf(),
            source,
        };

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(io_err)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(path)
            .map_err(io_err)?;

        match file.try_lock_exclusive() {
            Ok(()) => {}
            Err(e) if is_contended(&e) => return Ok(Acquire::Busy),
            Err(e) => return Err(io_err(e)),
        }

        let holder = LockHolder {
            name: holder_name.to_string(),
            pid: std::process::id(),
        };
        // Only rewrite the owner once we hold the lock.
        let text = format!("{}\n{}\n", holder.name, holder.pid);
        let record = |file: &mut File| -> io::Result<()> {
            file.set_len(0)?;
            file.write_all(text.as_bytes())?;
            file.sync_all()
        };
        record(&mut file).map_err(io_err)?;

        Ok(Acquire::Got(LockHandle {
            path: path.to_path_buf(),
            file: Some(file),
            holder,
        }))
    }

    /// Retries [`acquire`](Self::acquire) according to `policy`.
    ///
    /// # Errors
    ///
    /// Returns [`LockError::Timeout`] once `max_attempts` attempts all found
    /// the lock busy, or the first hard I/O error.
    pub fn acquire_with_retry<P: AsRef<Path>>(
        path: P,
        policy: &LockPolicy,
    ) -> Result<LockHandle> {
        let path = path.as_ref();
        let start = Instant::now();
        let per_report = policy.attempts_per_report();
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            match Self::acquire(path, &policy.holder_name)? {
                Acquire::Got(handle) => {
                    info!(lock = %path.display(), attempts, "got lock");
                    return Ok(handle);
                }
                Acquire::Busy => {}
            }

            if attempts >= policy.max_attempts {
                warn!(
                    lock = %path.display(),
                    attempts,
                    waited_secs = start.elapsed().as_secs(),
                    "unable to get lock, giving up"
                );
                return Err(LockError::Timeout {
                    path: path.to_path_buf(),
                    attempts,
                    waited: start.elapsed(),
                });
            }
            if attempts % per_report == 0 {
                let holder = read_holder(path).ok().flatten();
                warn!(
                    lock = %path.display(),
                    waited_secs = start.elapsed().as_secs(),
                    holder = ?holder,
                    "still waiting for lock"
                );
            } else {
                debug!(lock = %path.display(), attempts, "lock busy, retrying");
            }
            thread::sleep(policy.interval);
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn holder(&self) -> &LockHolder {
        &self.holder
    }

    pub fn is_held(&self) -> bool {
        self.file.is_some()
    }

    /// Unlocks and closes the lock file. Calling it again is a no-op.
    pub fn release(&mut self) {
        if let Some(file) = self.file.take() {
            if let Err(e) = FileExt::unlock(&file) {
                // Closing the descriptor below drops the lock regardless.
                debug!(lock = %self.path.display(), error = %e, "explicit unlock failed");
            }
            debug!(lock = %self.path.display(), "released lock");
        }
    }
}

impl Drop for LockHandle {
    fn drop(&mut self) {
        self.release();
    }
}

/// Checks whether `path` is currently locked, without keeping the lock.
///
/// A missing lock file is reported as [`LockStatus::Free`].
pub fn probe<P: AsRef<Path>>(path: P) -> Result<LockStatus> {
    let path = path.as_ref();
    let io_err = |source: io::Error| LockError::Io {
        path: path.to_path_buf(),
        source,
    };
    let file = match OpenOptions::new().write(true).open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(LockStatus::Free),
        Err(e) => return Err(io_err(e)),
    };
    match file.try_lock_exclusive() {
        Ok(()) => {
            let _ = FileExt::unlock(&file);
            Ok(LockStatus::Free)
        }
        Err(e) if is_contended(&e) => Ok(LockStatus::Held),
        Err(e) => Err(io_err(e)),
    }
}

/// Reads the holder identity last recorded in `path`.
///
/// Returns `None` for a missing or unparseable file.
pub fn read_holder<P: AsRef<Path>>(path: P) -> Result<Option<LockHolder>> {
    let path = path.as_ref();
    let text = match fs::read_to_string(path) {
        Ok(t) => t,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(LockError::Io {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    let mut lines = text.lines();
    let (Some(name), Some(pid)) = (lines.next(), lines.next()) else {
        return Ok(None);
    };
    Ok(pid.trim().parse().ok().map(|pid| LockHolder {
        name: name.to_string(),
        pid,
    }))
}

fn is_contended(e: &io::Error) -> bool {
    e.kind() == io::ErrorKind::WouldBlock
        || e.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}

/// Basename of the running executable, used as the default holder name.
pub fn program_name() -> String {
    std::env::args_os()
        .next()
        .as_deref()
        .map(Path::new)
        .and_then(Path::file_name)
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "phase3".to_string())
}

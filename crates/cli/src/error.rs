use std::io;
use std::path::PathBuf;

use advlock::LockError;
use manio::ManioError;
use sparse::SparseError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Why a reconciliation failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// An allocation could not be satisfied.
    ResourceExhausted,
    /// Opening, reading, writing, renaming or syncing a file failed.
    IoFailure,
    /// An input stream held a record of the wrong kind or in the wrong order,
    /// or the run's directories overlap.
    ProtocolViolation,
    /// The global index lock stayed busy for the whole retry budget.
    LockTimeout,
    /// The lock file itself could not be created, opened or written.
    LockFailure,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Manio(#[from] ManioError),

    #[error(transparent)]
    Sparse(#[from] SparseError),

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("manifest directory {output} overlaps {name} manifest {input}")]
    Overlap {
        name: &'static str,
        input: PathBuf,
        output: PathBuf,
    },
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Manio(e) => manio_kind(e),
            Error::Sparse(SparseError::Manio(e)) => manio_kind(e),
            Error::Sparse(SparseError::Lock(e)) | Error::Lock(e) => lock_kind(e),
            Error::Sparse(SparseError::Io { .. }) | Error::Io { .. } => ErrorKind::IoFailure,
            Error::Overlap { .. } => ErrorKind::ProtocolViolation,
        }
    }
}

fn manio_kind(e: &ManioError) -> ErrorKind {
    match e {
        ManioError::Io(_) => ErrorKind::IoFailure,
        ManioError::Corrupt(_) | ManioError::Protocol(_) => ErrorKind::ProtocolViolation,
        ManioError::ResourceExhausted(_) => ErrorKind::ResourceExhausted,
    }
}

fn lock_kind(e: &LockError) -> ErrorKind {
    match e {
        LockError::Io { .. } => ErrorKind::LockFailure,
        LockError::Timeout { .. } => ErrorKind::LockTimeout,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn kinds_follow_the_leaf_error() {
        let io = || io::Error::new(io::ErrorKind::Other, "boom");

        assert_eq!(Error::from(ManioError::Io(io())).kind(), ErrorKind::IoFailure);
        assert_eq!(
            Error::from(ManioError::Protocol("x".into())).kind(),
            ErrorKind::ProtocolViolation
        );
        assert_eq!(
            Error::from(ManioError::Corrupt("x".into())).kind(),
            ErrorKind::ProtocolViolation
        );

        let reserve = Vec::<u8>::new().try_reserve(usize::MAX).unwrap_err();
        assert_eq!(
            Error::from(SparseError::Manio(ManioError::from(reserve))).kind(),
            ErrorKind::ResourceExhausted
        );

        let timeout = LockError::Timeout {
            path: PathBuf::from("sparse.lock"),
            attempts: 3,
            waited: Duration::from_secs(6),
        };
        assert_eq!(Error::from(SparseError::Lock(timeout)).kind(), ErrorKind::LockTimeout);

        let hard = LockError::Io {
            path: PathBuf::from("sparse.lock"),
            source: io(),
        };
        assert_eq!(Error::from(hard).kind(), ErrorKind::LockFailure);

        let sparse_io = SparseError::Io {
            path: PathBuf::from("h1/00000000"),
            source: io(),
        };
        assert_eq!(Error::from(sparse_io).kind(), ErrorKind::IoFailure);

        let overlap = Error::Overlap {
            name: "changed",
            input: PathBuf::from("run/changed"),
            output: PathBuf::from("run/changed/out"),
        };
        assert_eq!(overlap.kind(), ErrorKind::ProtocolViolation);
    }
}

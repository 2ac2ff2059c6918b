use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "phase3",
    version,
    about = "Consolidate backup manifests and maintain the sparse index"
)]
pub(crate) struct Cli {
    /// Path to a YAML configuration file (defaults apply when omitted)
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub(crate) enum Commands {
    /// Merge the changed and unchanged manifests and update the sparse indexes
    Reconcile {
        /// Manifest of entries whose content changed
        #[arg(long)]
        changed: PathBuf,

        /// Manifest of entries carried over unchanged
        #[arg(long)]
        unchanged: PathBuf,

        /// Directory the merged manifest is written to
        #[arg(long)]
        manifest_dir: PathBuf,

        /// Data directory holding the global sparse index
        #[arg(long)]
        global_dir: PathBuf,
    },

    /// Merge two sparse indexes (or copy one) into a new file
    Merge {
        /// First index
        a: PathBuf,

        /// Second index; wins on equal fingerprints
        b: Option<PathBuf>,

        /// Destination file
        #[arg(short, long)]
        out: PathBuf,
    },

    /// Report whether a lock file is currently held
    LockStatus {
        /// Lock file, e.g. <data dir>/sparse.lock
        path: PathBuf,
    },

    /// Print the records of a sparse index or hook file
    Dump {
        path: PathBuf,
    },
}

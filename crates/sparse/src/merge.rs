use std::cmp::Ordering;
use std::io::{Read, Write};
use std::path::Path;
use tracing::debug;

use manio::{HookReader, HookRecord, HookWriter, Pull};

use crate::{open_hooks, Result};

/// Where the records of one merge came from.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MergeStats {
    pub from_left: u64,
    pub from_right: u64,
    /// Fingerprint sets present on both sides, written once from the right.
    pub collapsed: u64,
}

impl MergeStats {
    pub fn written(&self) -> u64 {
        self.from_left + self.from_right
    }
}

/// One input of a merge with its lazily pulled pending record.
struct Side<R: Read> {
    reader: Option<HookReader<R>>,
    pending: Option<HookRecord>,
}

impl<R: Read> Side<R> {
    fn new(reader: Option<HookReader<R>>) -> Self {
        Self {
            reader,
            pending: None,
        }
    }

    fn live(&self) -> bool {
        self.reader.is_some() || self.pending.is_some()
    }

    fn fill(&mut self) -> Result<()> {
        if self.pending.is_some() {
            return Ok(());
        }
        if let Some(reader) = self.reader.as_mut() {
            match reader.next_hook()? {
                Pull::Item(hook) => self.pending = Some(hook),
                Pull::EndOfStream => self.reader = None,
            }
        }
        Ok(())
    }
}

/// Merges two fingerprint-sorted hook streams into `out`.
///
/// On equal fingerprint sets only the right-hand record is written: it is
/// the fresher of the two. A missing right side copies the left through.
pub fn merge_hooks<A: Read, B: Read, W: Write>(
    left: HookReader<A>,
    right: Option<HookReader<B>>,
    out: &mut HookWriter<W>,
) -> Result<MergeStats> {
    let mut left = Side::new(Some(left));
    let mut right = Side::new(right);
    let mut stats = MergeStats::default();

    while left.live() || right.live() {
        left.fill()?;
        right.fill()?;

        match (left.pending.take(), right.pending.take()) {
            (None, None) => {}
            (Some(l), None) => {
                out.write_hook(&l)?;
                stats.from_left += 1;
            }
            (None, Some(r)) => {
                out.write_hook(&r)?;
                stats.from_right += 1;
            }
            (Some(l), Some(r)) => match l.cmp_fingerprints(&r) {
                Ordering::Equal => {
                    out.write_hook(&r)?;
                    stats.from_right += 1;
                    stats.collapsed += 1;
                }
                Ordering::Less => {
                    out.write_hook(&l)?;
                    stats.from_left += 1;
                    right.pending = Some(r);
                }
                Ordering::Greater => {
                    out.write_hook(&r)?;
                    stats.from_right += 1;
                    left.pending = Some(l);
                }
            },
        }
    }

    Ok(stats)
}

/// Merges the sparse index files `srca` and `srcb` into a new file `dst`.
///
/// `dst`'s parent directory is created if needed; an existing `dst` is
/// truncated.
pub fn merge_sparse_indexes(
    srca: &Path,
    srcb: Option<&Path>,
    dst: &Path,
    sync: bool,
) -> Result<MergeStats> {
    let left = open_hooks(srca)?;
    let right = srcb.map(open_hooks).transpose()?;
    let mut out = HookWriter::create(dst)?;

    let stats = merge_hooks(left, right, &mut out)?;
    out.finish_file(sync)?;

    debug!(
        a = %srca.display(),
        b = ?srcb,
        dst = %dst.display(),
        written = stats.written(),
        collapsed = stats.collapsed,
        "merged sparse indexes"
    );
    Ok(stats)
}

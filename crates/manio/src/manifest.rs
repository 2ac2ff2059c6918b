use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use hooktable::HookTable;
use std::fs::{self, File};
use std::io::{self, BufWriter};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::naming::{chunk_name, chunk_path, parse_chunk_name, HOOKS_DIR};
use crate::{
    Cmd, Fingerprint, HookRecord, HookWriter, ManioError, Pull, RecordReader, RecordWriter,
    Result,
};

/// One filesystem-object record of a manifest. Manifests are sorted by
/// `path` with no duplicates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEntry {
    pub path: Vec<u8>,
    /// Opaque stat blob, carried through unchanged.
    pub attribs: Vec<u8>,
}

impl StreamEntry {
    pub fn new(path: impl Into<Vec<u8>>, attribs: impl Into<Vec<u8>>) -> Self {
        Self {
            path: path.into(),
            attribs: attribs.into(),
        }
    }

    fn encode(&self) -> Result<Vec<u8>> {
        let path_len = u32::try_from(self.path.len())
            .map_err(|_| ManioError::Protocol("path too long".into()))?;
        let mut buf = Vec::new();
        buf.try_reserve(4 + self.path.len() + self.attribs.len())?;
        buf.write_u32::<LittleEndian>(path_len)?;
        buf.extend_from_slice(&self.path);
        buf.extend_from_slice(&self.attribs);
        Ok(buf)
    }

    fn decode(payload: &[u8]) -> Result<Self> {
        let mut br = payload;
        let path_len = br
            .read_u32::<LittleEndian>()
            .map_err(|_| ManioError::Corrupt("entry record too short".into()))?
            as usize;
        if br.len() < path_len {
            return Err(ManioError::Corrupt(format!(
                "entry path length {path_len} exceeds record"
            )));
        }
        let (path, attribs) = br.split_at(path_len);
        Ok(Self {
            path: path.to_vec(),
            attribs: attribs.to_vec(),
        })
    }
}

/// What a manifest stream yields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamItem {
    Entry(StreamEntry),
    /// Signature block owned by the most recent entry.
    Signature(Fingerprint),
}

#[derive(Debug, Clone)]
pub struct ManifestOptions {
    /// Entries per chunk file; each chunk gets one hook file.
    pub entries_per_chunk: usize,
    /// fsync each chunk and hook file when it is closed.
    pub sync: bool,
}

impl Default for ManifestOptions {
    fn default() -> Self {
        Self {
            entries_per_chunk: 1,
            sync: true,
        }
    }
}

/// Writes a manifest directory of numbered chunk files plus one
/// fingerprint-sorted hook file per chunk under `hooks/`.
pub struct ManifestWriter {
    dir: PathBuf,
    hooks_dir: PathBuf,
    options: ManifestOptions,
    chunk: Option<RecordWriter<BufWriter<File>>>,
    chunk_count: u64,
    entries_in_chunk: usize,
    entry_count: u64,
    hooks: HookTable,
}

impl ManifestWriter {
    /// Prepares `dir` for a fresh manifest.
    ///
    /// Chunk files and a `hooks/` directory left behind by an aborted run are
    /// removed first.
    pub fn create<P: AsRef<Path>>(dir: P, options: ManifestOptions) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        remove_stale_chunks(&dir)?;
        let hooks_dir = dir.join(HOOKS_DIR);
        fs::create_dir_all(&hooks_dir)?;

        Ok(Self {
            dir,
            hooks_dir,
            options: ManifestOptions {
                entries_per_chunk: options.entries_per_chunk.max(1),
                ..options
            },
            chunk: None,
            chunk_count: 0,
            entries_in_chunk: 0,
            entry_count: 0,
            hooks: HookTable::new(),
        })
    }

    /// Appends an entry, starting a new chunk first if the current one is full.
    pub fn write_entry(&mut self, entry: &StreamEntry) -> Result<()> {
        if self.chunk.is_none() || self.entries_in_chunk >= self.options.entries_per_chunk {
            self.rotate()?;
        }
        let payload = entry.encode()?;
        self.current_chunk()?.append(Cmd::Entry, &payload)?;
        self.entries_in_chunk += 1;
        self.entry_count += 1;
        Ok(())
    }

    /// Appends a signature block to the most recent entry.
    pub fn write_signature(&mut self, fp: &Fingerprint) -> Result<()> {
        self.current_chunk()?.append(Cmd::Signature, fp.as_bytes())
    }

    /// Buffers the most recent entry's hook for this chunk's hook file.
    pub fn write_hook(&mut self, hook: HookRecord) -> Result<()> {
        if self.chunk.is_none() {
            return Err(ManioError::Protocol("hook written before any entry".into()));
        }
        if !hook.is_empty() {
            let path = hook.path.clone();
            self.hooks.insert(hook.into_fingerprints(), path);
        }
        Ok(())
    }

    /// Closes the last chunk and reports what was written.
    ///
    /// `chunk_count` equals the number of hook files, which sizes the
    /// sparse index reduction.
    pub fn set_read_mode(mut self) -> Result<ManifestSummary> {
        self.close_chunk()?;
        debug!(
            dir = %self.dir.display(),
            chunks = self.chunk_count,
            entries = self.entry_count,
            "manifest finalized"
        );
        Ok(ManifestSummary {
            dir: self.dir,
            chunk_count: self.chunk_count,
            entry_count: self.entry_count,
        })
    }

    pub fn entry_count(&self) -> u64 {
        self.entry_count
    }

    fn current_chunk(&mut self) -> Result<&mut RecordWriter<BufWriter<File>>> {
        self.chunk
            .as_mut()
            .ok_or_else(|| ManioError::Protocol("signature written before any entry".into()))
    }

    fn rotate(&mut self) -> Result<()> {
        self.close_chunk()?;
        let path = chunk_path(&self.dir, self.chunk_count);
        self.chunk = Some(RecordWriter::create(path)?);
        self.chunk_count += 1;
        self.entries_in_chunk = 0;
        Ok(())
    }

    fn close_chunk(&mut self) -> Result<()> {
        let Some(chunk) = self.chunk.take() else {
            return Ok(());
        };
        chunk.finish_file(self.options.sync)?;

        let index = self.chunk_count - 1;
        let mut hooks = HookWriter::create(self.hooks_dir.join(chunk_name(index)))?;
        for (fingerprints, path) in self.hooks.iter() {
            hooks.write_hook(&HookRecord::from_parts(path.clone(), fingerprints.clone())?)?;
        }
        let written = hooks.finish_file(self.options.sync)?;
        debug!(
            chunk = index,
            hooks = written,
            bytes = self.hooks.approx_size(),
            "closed manifest chunk"
        );
        self.hooks.clear();
        Ok(())
    }
}

fn remove_stale_chunks(dir: &Path) -> Result<()> {
    let mut removed = 0usize;
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        if name == HOOKS_DIR && entry.file_type()?.is_dir() {
            fs::remove_dir_all(entry.path())?;
            removed += 1;
        } else if parse_chunk_name(name).is_some() && entry.file_type()?.is_file() {
            fs::remove_file(entry.path())?;
            removed += 1;
        }
    }
    if removed > 0 {
        warn!(dir = %dir.display(), removed, "removed leftovers of an earlier manifest");
    }
    Ok(())
}

/// A finalized manifest.
#[derive(Debug, Clone)]
pub struct ManifestSummary {
    pub dir: PathBuf,
    pub chunk_count: u64,
    pub entry_count: u64,
}

impl ManifestSummary {
    pub fn open_reader(&self) -> ManifestReader {
        ManifestReader::open(&self.dir)
    }
}

/// Reads a manifest directory's chunks in index order.
pub struct ManifestReader {
    dir: PathBuf,
    next_chunk: u64,
    current: Option<RecordReader<File>>,
    done: bool,
}

impl ManifestReader {
    /// No I/O happens until the first read; a missing directory reads as an
    /// empty manifest.
    pub fn open<P: AsRef<Path>>(dir: P) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            next_chunk: 0,
            current: None,
            done: false,
        }
    }

    pub fn directory(&self) -> &Path {
        &self.dir
    }

    /// Drains the rest of the manifest into `(entry, signatures)` pairs.
    pub fn collect_entries(&mut self) -> Result<Vec<(StreamEntry, Vec<Fingerprint>)>> {
        let mut out: Vec<(StreamEntry, Vec<Fingerprint>)> = Vec::new();
        while let Pull::Item(item) = self.read_next()? {
            match item {
                StreamItem::Entry(e) => out.push((e, Vec::new())),
                StreamItem::Signature(fp) => match out.last_mut() {
                    Some((_, sigs)) => sigs.push(fp),
                    None => {
                        return Err(ManioError::Protocol("signature before any entry".into()))
                    }
                },
            }
        }
        Ok(out)
    }

    /// Pulls the next entry or signature block.
    pub fn read_next(&mut self) -> Result<Pull<StreamItem>> {
        loop {
            if self.done {
                return Ok(Pull::EndOfStream);
            }
            if self.current.is_none() {
                let path = chunk_path(&self.dir, self.next_chunk);
                match RecordReader::open(&path) {
                    Ok(r) => {
                        self.next_chunk += 1;
                        self.current = Some(r);
                    }
                    Err(ManioError::Io(e)) if e.kind() == io::ErrorKind::NotFound => {
                        if let Some(later) = last_chunk_after(&self.dir, self.next_chunk)? {
                            return Err(ManioError::Protocol(format!(
                                "{}: chunk {} is missing but {} exists",
                                self.dir.display(),
                                chunk_name(self.next_chunk),
                                chunk_name(later)
                            )));
                        }
                        self.done = true;
                        continue;
                    }
                    Err(e) => return Err(e),
                }
            }
            let Some(reader) = self.current.as_mut() else {
                continue;
            };
            match reader.next_record()? {
                Pull::Item(record) => {
                    return decode_item(record.cmd, &record.payload).map(Pull::Item)
                }
                Pull::EndOfStream => self.current = None,
            }
        }
    }
}

/// Highest chunk index in `dir` above `missing`, if any.
fn last_chunk_after(dir: &Path, missing: u64) -> Result<Option<u64>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let mut last = None;
    for entry in entries {
        let name = entry?.file_name();
        if let Some(index) = name.to_str().and_then(parse_chunk_name) {
            if index > missing && last.map_or(true, |l| index > l) {
                last = Some(index);
            }
        }
    }
    Ok(last)
}

fn decode_item(cmd: Cmd, payload: &[u8]) -> Result<StreamItem> {
    match cmd {
        Cmd::Entry => Ok(StreamItem::Entry(StreamEntry::decode(payload)?)),
        Cmd::Signature => Ok(StreamItem::Signature(Fingerprint::from_slice(payload)?)),
        other => Err(ManioError::Protocol(format!(
            "unexpected {other:?} record in manifest stream"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::HookReader;
    use tempfile::tempdir;

    fn fp(n: u64) -> Fingerprint {
        Fingerprint::from_u64(n)
    }

    /// Writes entries with their signatures the way a reconciler would.
    fn write_manifest(
        dir: &Path,
        per_chunk: usize,
        entries: &[(&str, Vec<u64>)],
    ) -> Result<ManifestSummary> {
        let mut w = ManifestWriter::create(
            dir,
            ManifestOptions {
                entries_per_chunk: per_chunk,
                sync: false,
            },
        )?;
        for (path, sigs) in entries {
            w.write_entry(&StreamEntry::new(path.as_bytes(), b"attr".to_vec()))?;
            let mut hook = HookRecord::new(path.as_bytes().to_vec());
            for &s in sigs.iter() {
                w.write_signature(&fp(s))?;
                hook.push(&fp(s))?;
            }
            w.write_hook(hook)?;
        }
        w.set_read_mode()
    }

    fn read_hook_file(path: &Path) -> Result<Vec<HookRecord>> {
        let mut r = HookReader::open(path)?;
        let mut out = Vec::new();
        while let Pull::Item(h) = r.next_hook()? {
            out.push(h);
        }
        Ok(out)
    }

    // -------------------- Write / read back --------------------

    #[test]
    fn entries_and_signatures_read_back_in_order() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let summary = write_manifest(
            dir.path(),
            1,
            &[("a", vec![1, 2]), ("b", vec![]), ("c", vec![3])],
        )?;
        assert_eq!(summary.entry_count, 3);
        assert_eq!(summary.chunk_count, 3);

        let got = summary.open_reader().collect_entries()?;
        let shape: Vec<_> = got
            .iter()
            .map(|(e, sigs)| (e.path.clone(), sigs.clone()))
            .collect();
        assert_eq!(
            shape,
            vec![
                (b"a".to_vec(), vec![fp(1), fp(2)]),
                (b"b".to_vec(), vec![]),
                (b"c".to_vec(), vec![fp(3)]),
            ]
        );
        assert_eq!(got[0].0.attribs, b"attr".to_vec());
        Ok(())
    }

    #[test]
    fn chunking_groups_entries() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let entries: Vec<(String, Vec<u64>)> =
            (0..7u64).map(|i| (format!("f{i}"), vec![i])).collect();
        let refs: Vec<(&str, Vec<u64>)> = entries
            .iter()
            .map(|(p, s)| (p.as_str(), s.clone()))
            .collect();
        let summary = write_manifest(dir.path(), 3, &refs)?;
        assert_eq!(summary.chunk_count, 3);
        assert!(dir.path().join("00000002").is_file());
        assert!(!dir.path().join("00000003").exists());
        assert_eq!(summary.open_reader().collect_entries()?.len(), 7);
        Ok(())
    }

    #[test]
    fn empty_manifest_has_no_chunks() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let summary = write_manifest(dir.path(), 1, &[])?;
        assert_eq!(summary.chunk_count, 0);
        assert!(summary.open_reader().collect_entries()?.is_empty());
        Ok(())
    }

    #[test]
    fn missing_directory_reads_as_empty() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let mut r = ManifestReader::open(dir.path().join("nope"));
        assert_eq!(r.read_next()?, Pull::EndOfStream);
        Ok(())
    }

    // -------------------- Hook files --------------------

    #[test]
    fn hook_files_are_sorted_by_fingerprint_per_chunk() -> anyhow::Result<()> {
        let dir = tempdir()?;
        write_manifest(
            dir.path(),
            3,
            &[("a", vec![30]), ("b", vec![10]), ("c", vec![20]), ("d", vec![5])],
        )?;

        let first = read_hook_file(&dir.path().join("hooks/00000000"))?;
        let paths: Vec<_> = first.iter().map(|h| h.path.clone()).collect();
        assert_eq!(paths, vec![b"b".to_vec(), b"c".to_vec(), b"a".to_vec()]);

        let second = read_hook_file(&dir.path().join("hooks/00000001"))?;
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].path, b"d".to_vec());
        Ok(())
    }

    #[test]
    fn entry_without_signatures_gets_empty_hook_file() -> anyhow::Result<()> {
        let dir = tempdir()?;
        write_manifest(dir.path(), 1, &[("dir/", vec![])])?;
        let hooks = dir.path().join("hooks/00000000");
        assert!(hooks.is_file());
        assert!(read_hook_file(&hooks)?.is_empty());
        Ok(())
    }

    #[test]
    fn identical_fingerprints_in_one_chunk_collapse() -> anyhow::Result<()> {
        let dir = tempdir()?;
        write_manifest(dir.path(), 4, &[("a", vec![1, 2]), ("b", vec![1, 2])])?;
        let hooks = read_hook_file(&dir.path().join("hooks/00000000"))?;
        assert_eq!(hooks.len(), 1);
        assert_eq!(hooks[0].path, b"b".to_vec());
        Ok(())
    }

    // -------------------- Misuse and recovery --------------------

    #[test]
    fn signature_before_entry_is_protocol_error() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let mut w = ManifestWriter::create(dir.path(), ManifestOptions::default())?;
        assert!(matches!(w.write_signature(&fp(1)), Err(ManioError::Protocol(_))));
        Ok(())
    }

    #[test]
    fn hook_record_in_manifest_is_protocol_error() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let mut w = RecordWriter::create(dir.path().join("00000000"))?;
        w.append(Cmd::Manifest, b"a")?;
        w.finish_file(false)?;

        let mut r = ManifestReader::open(dir.path());
        assert!(matches!(r.read_next(), Err(ManioError::Protocol(_))));
        Ok(())
    }

    #[test]
    fn gap_in_chunk_numbers_is_protocol_error() -> anyhow::Result<()> {
        let dir = tempdir()?;
        write_manifest(dir.path(), 1, &[("a", vec![1]), ("b", vec![2]), ("c", vec![3])])?;
        fs::remove_file(dir.path().join("00000001"))?;

        let mut r = ManifestReader::open(dir.path());
        assert!(matches!(r.read_next()?, Pull::Item(StreamItem::Entry(_))));
        assert!(matches!(r.read_next()?, Pull::Item(StreamItem::Signature(_))));
        let err = r.read_next().unwrap_err();
        assert!(matches!(&err, ManioError::Protocol(msg) if msg.contains("00000002")));
        Ok(())
    }

    #[test]
    fn create_removes_leftovers_but_keeps_other_files() -> anyhow::Result<()> {
        let dir = tempdir()?;
        write_manifest(dir.path(), 1, &[("a", vec![1]), ("b", vec![2]), ("c", vec![3])])?;
        fs::write(dir.path().join("notes.txt"), b"keep")?;

        let summary = write_manifest(dir.path(), 1, &[("z", vec![9])])?;
        assert_eq!(summary.chunk_count, 1);
        assert!(!dir.path().join("00000001").exists());
        assert!(!dir.path().join("hooks/00000001").exists());
        assert!(dir.path().join("notes.txt").exists());
        assert_eq!(summary.open_reader().collect_entries()?.len(), 1);
        Ok(())
    }
}

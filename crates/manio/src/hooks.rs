use std::cmp::Ordering;
use std::fs::File;
use std::io::{BufWriter, Read, Write};
use std::path::Path;

use crate::naming::ensure_parent_dir;
use crate::{Cmd, Fingerprint, ManioError, Pull, RecordReader, RecordWriter, Result, FINGERPRINT_LEN};

/// An entry's path paired with the concatenation of its fingerprints.
///
/// Hook records are ordered by fingerprint bytes, never by path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HookRecord {
    pub path: Vec<u8>,
    fingerprints: Vec<u8>,
}

impl HookRecord {
    pub fn new(path: Vec<u8>) -> Self {
        Self {
            path,
            fingerprints: Vec::new(),
        }
    }

    /// Rebuilds a record from stored concatenated fingerprints.
    pub fn from_parts(path: Vec<u8>, fingerprints: Vec<u8>) -> Result<Self> {
        if fingerprints.len() % FINGERPRINT_LEN != 0 {
            return Err(ManioError::Protocol(format!(
                "fingerprint run of {} bytes is not a multiple of {FINGERPRINT_LEN}",
                fingerprints.len()
            )));
        }
        Ok(Self { path, fingerprints })
    }

    /// Appends one fingerprint.
    ///
    /// # Errors
    ///
    /// Returns [`ManioError::ResourceExhausted`] if the buffer cannot grow.
    pub fn push(&mut self, fp: &Fingerprint) -> Result<()> {
        self.fingerprints.try_reserve(FINGERPRINT_LEN)?;
        self.fingerprints.extend_from_slice(fp.as_bytes());
        Ok(())
    }

    pub fn fingerprints(&self) -> &[u8] {
        &self.fingerprints
    }

    pub fn into_fingerprints(self) -> Vec<u8> {
        self.fingerprints
    }

    /// Iterates over the individual fingerprints.
    pub fn iter(&self) -> impl Iterator<Item = Fingerprint> + '_ {
        self.fingerprints
            .chunks_exact(FINGERPRINT_LEN)
            .filter_map(|c| Fingerprint::from_slice(c).ok())
    }

    pub fn fingerprint_count(&self) -> usize {
        self.fingerprints.len() / FINGERPRINT_LEN
    }

    pub fn is_empty(&self) -> bool {
        self.fingerprints.is_empty()
    }

    /// Compares two hooks by fingerprint bytes.
    pub fn cmp_fingerprints(&self, other: &HookRecord) -> Ordering {
        self.fingerprints.cmp(&other.fingerprints)
    }
}

/// Writes hook records: one `m` header followed by one `F` per fingerprint.
pub struct HookWriter<W: Write> {
    inner: RecordWriter<W>,
    hooks: u64,
}

impl HookWriter<BufWriter<File>> {
    /// Creates `path` (and its parent directory) for writing.
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        ensure_parent_dir(path.as_ref())?;
        Ok(Self {
            inner: RecordWriter::create(path)?,
            hooks: 0,
        })
    }

    /// Flushes, optionally fsyncs, and returns the number of hooks written.
    pub fn finish_file(self, sync: bool) -> Result<u64> {
        self.inner.finish_file(sync)?;
        Ok(self.hooks)
    }
}

impl<W: Write> HookWriter<W> {
    pub fn new(out: W) -> Self {
        Self {
            inner: RecordWriter::new(out),
            hooks: 0,
        }
    }

    pub fn write_hook(&mut self, hook: &HookRecord) -> Result<()> {
        self.inner.append(Cmd::Manifest, &hook.path)?;
        for fp in hook.fingerprints.chunks_exact(FINGERPRINT_LEN) {
            self.inner.append(Cmd::Fingerprint, fp)?;
        }
        self.hooks += 1;
        Ok(())
    }

    pub fn hooks_written(&self) -> u64 {
        self.hooks
    }

    pub fn into_inner(self) -> Result<W> {
        self.inner.into_inner()
    }
}

/// Reads hook records back, one header plus its fingerprints at a time.
pub struct HookReader<R: Read> {
    inner: RecordReader<R>,
    /// Header read ahead while finishing the previous hook.
    pending: Option<HookRecord>,
    done: bool,
}

impl HookReader<File> {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Ok(Self::from_records(RecordReader::open(path)?))
    }
}

impl<R: Read> HookReader<R> {
    pub fn from_reader(reader: R) -> Self {
        Self::from_records(RecordReader::from_reader(reader))
    }

    fn from_records(inner: RecordReader<R>) -> Self {
        Self {
            inner,
            pending: None,
            done: false,
        }
    }

    /// Pulls the next complete hook.
    ///
    /// Headers without any fingerprints are skipped.
    ///
    /// # Errors
    ///
    /// A fingerprint before any header, a fingerprint of the wrong width, or
    /// a record of any other kind is a protocol violation.
    pub fn next_hook(&mut self) -> Result<Pull<HookRecord>> {
        if self.done {
            return Ok(Pull::EndOfStream);
        }
        loop {
            let record = match self.inner.next_record()? {
                Pull::Item(r) => r,
                Pull::EndOfStream => {
                    self.done = true;
                    return Ok(match self.pending.take() {
                        Some(hook) if !hook.is_empty() => Pull::Item(hook),
                        _ => Pull::EndOfStream,
                    });
                }
            };
            match record.cmd {
                Cmd::Manifest => {
                    let next = HookRecord::new(record.payload);
                    match self.pending.replace(next) {
                        Some(hook) if !hook.is_empty() => return Ok(Pull::Item(hook)),
                        _ => continue,
                    }
                }
                Cmd::Fingerprint => {
                    let fp = Fingerprint::from_slice(&record.payload)?;
                    match self.pending.as_mut() {
                        Some(hook) => hook.push(&fp)?,
                        None => {
                            return Err(ManioError::Protocol(
                                "fingerprint record before any manifest record".into(),
                            ))
                        }
                    }
                }
                other => {
                    return Err(ManioError::Protocol(format!(
                        "unexpected {other:?} record in hook stream"
                    )))
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hook(path: &str, fps: &[u64]) -> HookRecord {
        let mut h = HookRecord::new(path.as_bytes().to_vec());
        for &f in fps {
            h.push(&Fingerprint::from_u64(f)).unwrap();
        }
        h
    }

    fn encode(hooks: &[HookRecord]) -> Vec<u8> {
        let mut w = HookWriter::new(Vec::new());
        for h in hooks {
            w.write_hook(h).unwrap();
        }
        w.into_inner().unwrap()
    }

    fn decode(bytes: &[u8]) -> Result<Vec<HookRecord>> {
        let mut r = HookReader::from_reader(bytes);
        let mut out = Vec::new();
        while let Pull::Item(h) = r.next_hook()? {
            out.push(h);
        }
        Ok(out)
    }

    // -------------------- Reading back --------------------

    #[test]
    fn hooks_read_back_in_written_order() -> Result<()> {
        let hooks = vec![hook("a", &[1, 2]), hook("b", &[3]), hook("c", &[4, 5, 6])];
        assert_eq!(decode(&encode(&hooks))?, hooks);
        Ok(())
    }

    #[test]
    fn header_without_fingerprints_is_skipped() -> Result<()> {
        let mut w = RecordWriter::new(Vec::new());
        w.append(Cmd::Manifest, b"dir/")?;
        w.append(Cmd::Manifest, b"file")?;
        w.append(Cmd::Fingerprint, Fingerprint::from_u64(9).as_bytes())?;
        w.append(Cmd::Manifest, b"trailing-dir/")?;
        let bytes = w.into_inner()?;

        assert_eq!(decode(&bytes)?, vec![hook("file", &[9])]);
        Ok(())
    }

    #[test]
    fn end_of_stream_is_sticky() -> Result<()> {
        let bytes = encode(&[hook("a", &[1])]);
        let mut r = HookReader::from_reader(&bytes[..]);
        assert!(matches!(r.next_hook()?, Pull::Item(_)));
        assert_eq!(r.next_hook()?, Pull::EndOfStream);
        assert_eq!(r.next_hook()?, Pull::EndOfStream);
        Ok(())
    }

    // -------------------- Malformed streams --------------------

    #[test]
    fn fingerprint_before_header_is_protocol_error() -> Result<()> {
        let mut w = RecordWriter::new(Vec::new());
        w.append(Cmd::Fingerprint, Fingerprint::from_u64(1).as_bytes())?;
        let bytes = w.into_inner()?;
        assert!(matches!(decode(&bytes), Err(ManioError::Protocol(_))));
        Ok(())
    }

    #[test]
    fn short_fingerprint_is_protocol_error() -> Result<()> {
        let mut w = RecordWriter::new(Vec::new());
        w.append(Cmd::Manifest, b"a")?;
        w.append(Cmd::Fingerprint, b"ABC")?;
        let bytes = w.into_inner()?;
        assert!(matches!(decode(&bytes), Err(ManioError::Protocol(_))));
        Ok(())
    }

    #[test]
    fn manifest_entry_in_hook_stream_is_protocol_error() -> Result<()> {
        let mut w = RecordWriter::new(Vec::new());
        w.append(Cmd::Entry, b"\x01\x00\x00\x00a")?;
        let bytes = w.into_inner()?;
        assert!(matches!(decode(&bytes), Err(ManioError::Protocol(_))));
        Ok(())
    }

    #[test]
    fn from_parts_enforces_width() {
        assert!(HookRecord::from_parts(b"p".to_vec(), vec![b'0'; 32]).is_ok());
        assert!(matches!(
            HookRecord::from_parts(b"p".to_vec(), vec![b'0'; 20]),
            Err(ManioError::Protocol(_))
        ));
    }

    #[test]
    fn ordering_uses_fingerprints_not_paths() {
        let a = hook("zzz", &[1]);
        let b = hook("aaa", &[2]);
        assert_eq!(a.cmp_fingerprints(&b), Ordering::Less);
        assert_eq!(a.iter().count(), 1);
        assert_eq!(b.fingerprint_count(), 1);
    }
}

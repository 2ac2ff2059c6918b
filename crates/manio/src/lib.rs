//! # Manio
//!
//! Manifest I/O for the phase-three consolidation stage: record framing,
//! manifest chunk streams, hook files and the on-disk naming contract.
//!
//! ## Frame layout
//!
//! ```text
//! ┌──────────────────┬───────────────┬──────────┬───────────────────────┐
//! │ record_len (u32) │ crc32 (u32)   │ cmd (u8) │ payload               │
//! └──────────────────┴───────────────┴──────────┴───────────────────────┘
//! ```
//!
//! `record_len` counts everything after itself; the CRC covers `cmd` and
//! `payload`. All integers are little-endian.

mod fingerprint;
mod hooks;
mod manifest;
pub mod naming;

pub use fingerprint::{Fingerprint, FINGERPRINT_LEN};
pub use hooks::{HookReader, HookRecord, HookWriter};
pub use manifest::{
    ManifestOptions, ManifestReader, ManifestSummary, ManifestWriter, StreamEntry, StreamItem,
};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use crc32fast::Hasher as Crc32;
use std::collections::TryReserveError;
use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::Path;

use thiserror::Error;

/// Bytes counted by `record_len` that are not payload: crc (4) + cmd (1).
const FRAME_OVERHEAD: u32 = 4 + 1;

/// Upper bound on `record_len`; anything larger is treated as corruption.
pub const MAX_RECORD_LEN: u32 = 16 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum ManioError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("corrupt record: {0}")]
    Corrupt(String),
    #[error("protocol violation: {0}")]
    Protocol(String),
    #[error("out of memory: {0}")]
    ResourceExhausted(#[from] TryReserveError),
}

pub type Result<T> = std::result::Result<T, ManioError>;

/// Outcome of pulling from a sorted stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Pull<T> {
    Item(T),
    EndOfStream,
}

/// Record kinds understood by every stream in this crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cmd {
    /// Manifest entry: `path_len (u32) | path | attribs`.
    Entry,
    /// Signature block trailing a manifest entry.
    Signature,
    /// Hook header carrying the entry path.
    Manifest,
    /// One fingerprint of the preceding hook header.
    Fingerprint,
}

impl Cmd {
    pub fn as_byte(self) -> u8 {
        match self {
            Cmd::Entry => b'E',
            Cmd::Signature => b'S',
            Cmd::Manifest => b'm',
            Cmd::Fingerprint => b'F',
        }
    }

    pub fn from_byte(b: u8) -> Option<Cmd> {
        match b {
            b'E' => Some(Cmd::Entry),
            b'S' => Some(Cmd::Signature),
            b'm' => Some(Cmd::Manifest),
            b'F' => Some(Cmd::Fingerprint),
            _ => None,
        }
    }
}

/// One framed record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub cmd: Cmd,
    pub payload: Vec<u8>,
}

impl Record {
    pub fn new(cmd: Cmd, payload: Vec<u8>) -> Self {
        Self { cmd, payload }
    }
}

/// Appends framed records to any writer.
pub struct RecordWriter<W: Write> {
    out: W,
    count: u64,
}

impl RecordWriter<BufWriter<File>> {
    /// Creates (or truncates) `path` for writing.
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)?;
        Ok(Self::new(BufWriter::new(file)))
    }

    /// Flushes buffers and, if `sync` is set, forces the file to stable
    /// storage.
    pub fn finish_file(mut self, sync: bool) -> Result<u64> {
        self.out.flush()?;
        if sync {
            self.out.get_ref().sync_all()?;
        }
        Ok(self.count)
    }
}

impl<W: Write> RecordWriter<W> {
    pub fn new(out: W) -> Self {
        Self { out, count: 0 }
    }

    pub fn append(&mut self, cmd: Cmd, payload: &[u8]) -> Result<()> {
        let mut hasher = Crc32::new();
        hasher.update(&[cmd.as_byte()]);
        hasher.update(payload);
        let crc = hasher.finalize();

        let record_len = u32::try_from(payload.len())
            .ok()
            .and_then(|n| n.checked_add(FRAME_OVERHEAD))
            .filter(|n| *n <= MAX_RECORD_LEN)
            .ok_or_else(|| {
                ManioError::Protocol(format!("payload of {} bytes too large", payload.len()))
            })?;

        self.out.write_u32::<LittleEndian>(record_len)?;
        self.out.write_u32::<LittleEndian>(crc)?;
        self.out.write_u8(cmd.as_byte())?;
        self.out.write_all(payload)?;
        self.count += 1;
        Ok(())
    }

    /// Number of records appended so far.
    pub fn count(&self) -> u64 {
        self.count
    }

    /// Flushes and returns the inner writer.
    pub fn into_inner(mut self) -> Result<W> {
        self.out.flush()?;
        Ok(self.out)
    }
}

/// Reads framed records in sequence. Stops cleanly on EOF at a frame boundary.
pub struct RecordReader<R: Read> {
    rdr: BufReader<R>,
}

impl RecordReader<File> {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<RecordReader<File>> {
        let f = File::open(path)?;
        Ok(RecordReader {
            rdr: BufReader::new(f),
        })
    }
}

impl<R: Read> RecordReader<R> {
    pub fn from_reader(reader: R) -> Self {
        RecordReader {
            rdr: BufReader::new(reader),
        }
    }

    /// Pulls the next record.
    ///
    /// Returns `Pull::EndOfStream` only when EOF falls exactly on a frame
    /// boundary; a frame cut short is reported as corruption.
    pub fn next_record(&mut self) -> Result<Pull<Record>> {
        let mut len_buf = [0u8; 4];
        let mut filled = 0;
        while filled < len_buf.len() {
            match self.rdr.read(&mut len_buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        match filled {
            0 => return Ok(Pull::EndOfStream),
            4 => {}
            n => return Err(ManioError::Corrupt(format!("truncated frame header ({n} bytes)"))),
        }
        let record_len = u32::from_le_bytes(len_buf);
        if !(FRAME_OVERHEAD..=MAX_RECORD_LEN).contains(&record_len) {
            return Err(ManioError::Corrupt(format!(
                "record length {record_len} out of range"
            )));
        }

        let crc = self.read_frame_u32()?;
        let cmd_byte = self.read_frame_u8()?;
        let mut payload = Vec::new();
        payload.try_reserve_exact((record_len - FRAME_OVERHEAD) as usize)?;
        payload.resize((record_len - FRAME_OVERHEAD) as usize, 0);
        self.rdr.read_exact(&mut payload).map_err(truncated)?;

        let mut hasher = Crc32::new();
        hasher.update(&[cmd_byte]);
        hasher.update(&payload);
        if hasher.finalize() != crc {
            return Err(ManioError::Corrupt("crc mismatch".into()));
        }

        let cmd = Cmd::from_byte(cmd_byte)
            .ok_or_else(|| ManioError::Corrupt(format!("unknown cmd byte 0x{cmd_byte:02x}")))?;
        Ok(Pull::Item(Record { cmd, payload }))
    }

    fn read_frame_u32(&mut self) -> Result<u32> {
        self.rdr.read_u32::<LittleEndian>().map_err(truncated)
    }

    fn read_frame_u8(&mut self) -> Result<u8> {
        self.rdr.read_u8().map_err(truncated)
    }
}

fn truncated(e: io::Error) -> ManioError {
    if e.kind() == io::ErrorKind::UnexpectedEof {
        ManioError::Corrupt("truncated frame".into())
    } else {
        ManioError::Io(e)
    }
}

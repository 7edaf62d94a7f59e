//! Write-ahead log: every `SaveVersion` appends its [`ChangeSet`] here before
//! the version is considered durable, independent of when it reaches the
//! commitment store (§4.6).
//!
//! Grounded on the reference's `storage::wal` (length-prefixed
//! bincode-framed records, `fsync`'d on append) and `v1/wal.go` (index-based
//! compaction). The on-disk framing is this crate's own design — unlike
//! §4.1/§4.2, the WAL format has no cross-implementation compatibility
//! requirement, since it never leaves this process.

use crate::changeset::ChangeSet;
use crate::error::{Error, Result};
use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::info;

#[derive(Debug, serde::Serialize, serde::Deserialize)]
struct WalRecordHeader {
    index: u64,
    data_len: u64,
    crc: u32,
}

/// Appends [`ChangeSet`] records and fsyncs after each one.
pub struct WalWriter {
    path: PathBuf,
    file: Mutex<BufWriter<File>>,
    next_index: Mutex<u64>,
}

impl WalWriter {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)?;
        let mut next_index = 0u64;
        for record in WalReader::open(&path)? {
            next_index = record?.index + 1;
        }
        Ok(Self {
            path,
            file: Mutex::new(BufWriter::new(file)),
            next_index: Mutex::new(next_index),
        })
    }

    /// Appends one change set, returning the WAL index it was assigned.
    pub fn append(&self, change_set: &ChangeSet) -> Result<u64> {
        let data = bincode::serialize(change_set)
            .map_err(|e| Error::Corruption(format!("wal encode failed: {e}")))?;
        let crc = crc32(&data);

        let mut next_index = self.next_index.lock().expect("wal index lock poisoned");
        let index = *next_index;

        let header = WalRecordHeader {
            index,
            data_len: data.len() as u64,
            crc,
        };
        let header_bytes = bincode::serialize(&header)
            .map_err(|e| Error::Corruption(format!("wal header encode failed: {e}")))?;

        let mut file = self.file.lock().expect("wal file lock poisoned");
        file.write_all(&(header_bytes.len() as u32).to_be_bytes())?;
        file.write_all(&header_bytes)?;
        file.write_all(&data)?;
        file.flush()?;
        file.get_ref().sync_data()?;

        *next_index = index + 1;
        crate::metrics::metrics().observe_wal_append(data.len() as u64);
        Ok(index)
    }

    /// Drops every record with index `< min_index`, compacting the log file
    /// in place via a rename swap.
    pub fn compact(&self, min_index: u64) -> Result<()> {
        let mut file = self.file.lock().expect("wal file lock poisoned");
        file.flush()?;

        let tmp_path = self.path.with_extension("wal.compact");
        {
            let mut out = BufWriter::new(
                OpenOptions::new()
                    .create(true)
                    .write(true)
                    .truncate(true)
                    .open(&tmp_path)?,
            );
            for record in WalReader::open(&self.path)? {
                let record = record?;
                if record.index < min_index {
                    continue;
                }
                let header = WalRecordHeader {
                    index: record.index,
                    data_len: record.raw.len() as u64,
                    crc: crc32(&record.raw),
                };
                let header_bytes = bincode::serialize(&header)
                    .map_err(|e| Error::Corruption(format!("wal header encode failed: {e}")))?;
                out.write_all(&(header_bytes.len() as u32).to_be_bytes())?;
                out.write_all(&header_bytes)?;
                out.write_all(&record.raw)?;
            }
            out.flush()?;
            out.get_ref().sync_data()?;
        }

        std::fs::rename(&tmp_path, &self.path)?;
        let reopened = OpenOptions::new().create(true).append(true).open(&self.path)?;
        *file = BufWriter::new(reopened);
        info!(target: "cowavl::wal", min_index, "compacted wal");
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

struct RawRecord {
    index: u64,
    raw: Vec<u8>,
}

/// Iterates decoded [`ChangeSet`] records from a WAL file in append order.
pub struct WalReader {
    reader: BufReader<File>,
}

impl WalReader {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = OpenOptions::new().create(true).read(true).open(path)?;
        Ok(Self {
            reader: BufReader::new(file),
        })
    }

    fn next_raw(&mut self) -> Result<Option<RawRecord>> {
        let mut len_bytes = [0u8; 4];
        match self.reader.read_exact(&mut len_bytes) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }
        let header_len = u32::from_be_bytes(len_bytes) as usize;
        let mut header_bytes = vec![0u8; header_len];
        self.reader.read_exact(&mut header_bytes)?;
        let header: WalRecordHeader = bincode::deserialize(&header_bytes)
            .map_err(|e| Error::Corruption(format!("wal header decode failed: {e}")))?;

        let mut data = vec![0u8; header.data_len as usize];
        self.reader.read_exact(&mut data)?;
        if crc32(&data) != header.crc {
            return Err(Error::Corruption(format!(
                "wal record {} failed crc check",
                header.index
            )));
        }
        Ok(Some(RawRecord {
            index: header.index,
            raw: data,
        }))
    }
}

impl Iterator for WalReader {
    type Item = Result<RecordRef>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.next_raw() {
            Ok(Some(raw)) => {
                let change_set = match bincode::deserialize::<ChangeSet>(&raw.raw) {
                    Ok(cs) => cs,
                    Err(e) => {
                        return Some(Err(Error::Corruption(format!(
                            "wal record decode failed: {e}"
                        ))))
                    }
                };
                Some(Ok(RecordRef {
                    index: raw.index,
                    change_set,
                }))
            }
            Ok(None) => None,
            Err(e) => Some(Err(e)),
        }
    }
}

/// A decoded WAL entry.
pub struct RecordRef {
    pub index: u64,
    pub change_set: ChangeSet,
}

fn crc32(data: &[u8]) -> u32 {
    // CRC-32 (IEEE 802.3), computed without a lookup table since WAL records
    // are small and this isn't a hot path next to the fsync it guards.
    let mut crc: u32 = 0xFFFF_FFFF;
    for &byte in data {
        crc ^= byte as u32;
        for _ in 0..8 {
            let mask = (crc & 1).wrapping_neg();
            crc = (crc >> 1) ^ (0xEDB8_8320 & mask);
        }
    }
    !crc
}

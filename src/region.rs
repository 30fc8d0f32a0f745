//! Append-only blob log. Two of these back a cache; at any time one is
//! active (accepting appends) and the other is readable but frozen until
//! the next flip wipes it.
//!
//! # File Format
//!
//! ```text
//! +--------------------+
//! | magic (4 bytes)    |
//! +--------------------+
//! | Record 1           |
//! +--------------------+
//! | Record 2           |
//! +--------------------+
//! | ...                |
//! +--------------------+
//! ```
//!
//! ## Record Format
//!
//! ```text
//! +---------+-------------+-----------------+------------+----------+
//! | key:i64 | checksum:u32| chain_offset:u32| length:u32 | payload  |
//! +---------+-------------+-----------------+------------+----------+
//! | 8 bytes |   4 bytes   |     4 bytes     |  4 bytes   | variable |
//! +---------+-------------+-----------------+------------+----------+
//! ```
//!
//! - All integers are little-endian
//! - The checksum covers key, length, and payload; `chain_offset` is patched
//!   in from the bucket head after the checksum is computed
//! - `chain_offset` addresses the previous same-bucket record in this file,
//!   0 if none. Chains only point backwards: a valid `chain_offset` is
//!   strictly smaller than the offset of the record carrying it

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::checksum::Checksum;
use crate::error::Result;
use crate::Error;

/// Size of the region file header (the magic alone).
pub const DATA_HEADER_SIZE: usize = 4;

/// Size of the fixed header preceding each blob payload.
pub const BLOB_HEADER_SIZE: usize = 20;

const DATA_MAGIC: u32 = u32::from_le_bytes(*b"BCD1");

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BlobHeader {
    pub key: i64,
    pub checksum: u32,
    pub chain_offset: u32,
    pub length: u32,
}

/// Checksum over the fields a record commits to: key, length, payload.
pub fn blob_checksum(key: i64, payload: &[u8]) -> u32 {
    let mut state = Checksum::new();
    state.update(&key.to_le_bytes());
    state.update(&(payload.len() as u32).to_le_bytes());
    state.update(payload);
    state.value()
}

pub struct DataRegion {
    file: File,
    path: PathBuf,
    len: u64,
    max_bytes: u32,
}

impl std::fmt::Debug for DataRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataRegion")
            .field("path", &self.path)
            .field("len", &self.len)
            .finish()
    }
}

impl DataRegion {
    /// Creates a fresh region file containing only the magic.
    pub fn create(path: &Path, max_bytes: u32) -> Result<Self> {
        let mut file = File::options()
            .create(true)
            .read(true)
            .write(true)
            .truncate(true)
            .open(path)?;

        file.write_u32::<LittleEndian>(DATA_MAGIC)?;
        file.sync_all()?;

        Ok(Self {
            file,
            path: path.to_path_buf(),
            len: DATA_HEADER_SIZE as u64,
            max_bytes,
        })
    }

    /// Opens an existing region file and validates its magic.
    pub fn open(path: &Path, max_bytes: u32) -> Result<Self> {
        let mut file = File::options().read(true).write(true).open(path)?;
        let len = file.metadata()?.len();

        if len < DATA_HEADER_SIZE as u64 {
            return Err(Error::InvalidMagic);
        }
        file.seek(SeekFrom::Start(0))?;
        if file.read_u32::<LittleEndian>()? != DATA_MAGIC {
            return Err(Error::InvalidMagic);
        }

        Ok(Self {
            file,
            path: path.to_path_buf(),
            len,
            max_bytes,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current file length in bytes, including the magic.
    pub fn len(&self) -> u64 {
        self.len
    }

    /// Appends a record and returns its offset. The caller flips before the
    /// region runs out of room and owns the bucket head passed as
    /// `chain_offset`; an append that would exceed the region capacity is
    /// refused here as well.
    pub fn append(&mut self, key: i64, payload: &[u8], chain_offset: u32) -> Result<u32> {
        if self.len + (BLOB_HEADER_SIZE + payload.len()) as u64 > self.max_bytes as u64 {
            return Err(Error::InvalidInput(format!(
                "record of {} bytes does not fit region at {} of {} bytes",
                BLOB_HEADER_SIZE + payload.len(),
                self.len,
                self.max_bytes
            )));
        }

        let mut record = Vec::with_capacity(BLOB_HEADER_SIZE + payload.len());
        record.write_i64::<LittleEndian>(key)?;
        record.write_u32::<LittleEndian>(blob_checksum(key, payload))?;
        record.write_u32::<LittleEndian>(chain_offset)?;
        record.write_u32::<LittleEndian>(payload.len() as u32)?;
        record.extend_from_slice(payload);

        let offset = self.len;
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(&record)?;
        self.len += record.len() as u64;

        Ok(offset as u32)
    }

    /// Reads the record header at `offset` without touching the payload.
    /// Out-of-range offsets report corruption, never panic: offsets come
    /// from slot tables and chain fields that may themselves be damaged.
    pub fn header_at(&mut self, offset: u32) -> Result<BlobHeader> {
        let start = offset as u64;
        if start < DATA_HEADER_SIZE as u64 || start + BLOB_HEADER_SIZE as u64 > self.len {
            return Err(Error::Corrupted(format!(
                "record offset {} out of range for region of {} bytes",
                offset, self.len
            )));
        }

        self.file.seek(SeekFrom::Start(start))?;
        let key = self.read_or_corrupt(|f| f.read_i64::<LittleEndian>())?;
        let checksum = self.read_or_corrupt(|f| f.read_u32::<LittleEndian>())?;
        let chain_offset = self.read_or_corrupt(|f| f.read_u32::<LittleEndian>())?;
        let length = self.read_or_corrupt(|f| f.read_u32::<LittleEndian>())?;

        Ok(BlobHeader {
            key,
            checksum,
            chain_offset,
            length,
        })
    }

    /// Reads and validates the full record at `offset`. A checksum mismatch
    /// or an impossible length reports corruption.
    pub fn read_at(&mut self, offset: u32) -> Result<(BlobHeader, Vec<u8>)> {
        let header = self.header_at(offset)?;

        let payload_start = offset as u64 + BLOB_HEADER_SIZE as u64;
        let payload_end = payload_start + header.length as u64;
        if payload_end > self.len {
            return Err(Error::Corrupted(format!(
                "record at {} claims {} payload bytes past end of region",
                offset, header.length
            )));
        }

        let mut payload = vec![0u8; header.length as usize];
        self.file.seek(SeekFrom::Start(payload_start))?;
        if let Err(e) = self.file.read_exact(&mut payload) {
            return match e.kind() {
                std::io::ErrorKind::UnexpectedEof => Err(Error::Corrupted(
                    "unexpected EOF while reading payload".to_string(),
                )),
                _ => Err(e.into()),
            };
        }

        if blob_checksum(header.key, &payload) != header.checksum {
            return Err(Error::ChecksumMismatch);
        }

        Ok((header, payload))
    }

    /// Truncates back to the magic. The single point where blob data is
    /// destroyed; called when this region becomes active again after a flip.
    pub fn reset(&mut self) -> Result<()> {
        self.file.set_len(DATA_HEADER_SIZE as u64)?;
        self.len = DATA_HEADER_SIZE as u64;
        Ok(())
    }

    /// Discards a torn tail found at open, restoring the last length the
    /// index header recorded.
    pub fn truncate_to(&mut self, len: u64) -> Result<()> {
        self.file.set_len(len)?;
        self.len = len;
        Ok(())
    }

    pub fn sync(&mut self) -> Result<()> {
        Ok(self.file.sync_all()?)
    }

    fn read_or_corrupt<T>(&mut self, read: impl FnOnce(&mut File) -> std::io::Result<T>) -> Result<T> {
        match read(&mut self.file) {
            Ok(v) => Ok(v),
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Err(Error::Corrupted(
                "unexpected EOF while reading record header".to_string(),
            )),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn create_temp_region() -> (tempfile::TempDir, DataRegion) {
        let dir = tempdir().expect("Failed to create temp dir");
        let path = dir.path().join("region.0");
        let region = DataRegion::create(&path, 4096).expect("Failed to create region");
        (dir, region)
    }

    #[test]
    fn test_create_and_reopen() {
        let (dir, region) = create_temp_region();
        let path = region.path().to_path_buf();
        assert_eq!(region.len(), DATA_HEADER_SIZE as u64);
        drop(region);

        let reopened = DataRegion::open(&path, 4096).expect("Failed to reopen region");
        assert_eq!(reopened.len(), DATA_HEADER_SIZE as u64);
        drop(dir);
    }

    #[test]
    fn test_open_rejects_bad_magic() {
        let dir = tempdir().expect("Failed to create temp dir");
        let path = dir.path().join("region.0");
        std::fs::write(&path, b"NOPE").expect("Failed to write file");

        match DataRegion::open(&path, 4096) {
            Err(Error::InvalidMagic) => {}
            other => panic!("Expected InvalidMagic, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_append_refuses_to_exceed_capacity() {
        let dir = tempdir().expect("Failed to create temp dir");
        let path = dir.path().join("region.0");
        // Room for exactly one 4-byte payload: 4 + 20 + 4.
        let mut region = DataRegion::create(&path, 28).expect("Failed to create region");

        region.append(1, b"full", 0).expect("Failed to append");
        assert!(matches!(
            region.append(2, b"more", 0),
            Err(Error::InvalidInput(_))
        ));
        assert_eq!(region.len(), 28);
    }

    #[test]
    fn test_append_and_read_round_trip() {
        let (_dir, mut region) = create_temp_region();

        let offset = region.append(42, b"hello", 0).expect("Failed to append");
        assert_eq!(offset, DATA_HEADER_SIZE as u32);

        let (header, payload) = region.read_at(offset).expect("Failed to read");
        assert_eq!(header.key, 42);
        assert_eq!(header.chain_offset, 0);
        assert_eq!(header.length, 5);
        assert_eq!(payload, b"hello");
    }

    #[test]
    fn test_empty_payload() {
        let (_dir, mut region) = create_temp_region();

        let offset = region.append(-7, &[], 0).expect("Failed to append");
        let (header, payload) = region.read_at(offset).expect("Failed to read");
        assert_eq!(header.key, -7);
        assert_eq!(header.length, 0);
        assert!(payload.is_empty());
    }

    #[test]
    fn test_chain_offsets_thread_backwards() {
        let (_dir, mut region) = create_temp_region();

        let first = region.append(1, b"one", 0).expect("Failed to append");
        let second = region.append(11, b"eleven", first).expect("Failed to append");
        assert!(second > first);

        let header = region.header_at(second).expect("Failed to read header");
        assert_eq!(header.chain_offset, first);
        let header = region.header_at(first).expect("Failed to read header");
        assert_eq!(header.chain_offset, 0);
    }

    #[test]
    fn test_corrupted_payload_detected() {
        let (_dir, mut region) = create_temp_region();

        let offset = region.append(5, b"payload", 0).expect("Failed to append");

        // Flip one payload byte behind the region's back.
        let payload_pos = offset as u64 + BLOB_HEADER_SIZE as u64;
        region.file.seek(SeekFrom::Start(payload_pos)).unwrap();
        region.file.write_all(b"q").unwrap();

        match region.read_at(offset) {
            Err(Error::ChecksumMismatch) => {}
            other => panic!("Expected ChecksumMismatch, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_out_of_range_offsets_report_corruption() {
        let (_dir, mut region) = create_temp_region();
        region.append(1, b"data", 0).expect("Failed to append");

        for offset in [0u32, 1, u32::MAX, region.len() as u32] {
            match region.read_at(offset) {
                Err(Error::Corrupted(_)) => {}
                other => panic!(
                    "Expected Corrupted for offset {}, got {:?}",
                    offset,
                    other.map(|_| ())
                ),
            }
        }
    }

    #[test]
    fn test_reset_truncates_to_magic() {
        let (_dir, mut region) = create_temp_region();

        let offset = region.append(9, b"gone soon", 0).expect("Failed to append");
        assert!(region.len() > DATA_HEADER_SIZE as u64);

        region.reset().expect("Failed to reset");
        assert_eq!(region.len(), DATA_HEADER_SIZE as u64);
        assert!(region.read_at(offset).is_err());

        // The region accepts appends again from the start.
        let offset = region.append(10, b"fresh", 0).expect("Failed to append");
        assert_eq!(offset, DATA_HEADER_SIZE as u32);
    }
}

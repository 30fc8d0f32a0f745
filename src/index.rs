//! The index file: a checksummed header plus one open-hash slot table per
//! data region, mapping `bucket -> newest record offset in that region`.
//!
//! # File Format
//!
//! ```text
//! +------------------------------+
//! | Header (32 bytes)            |
//! +------------------------------+
//! | Region 0 slot table          |  max_entries * 12 bytes
//! +------------------------------+
//! | Region 1 slot table          |  max_entries * 12 bytes
//! +------------------------------+
//! ```
//!
//! ## Header Layout (all fields u32, little-endian)
//!
//! ```text
//! Offset  Field
//! ------  -----
//!  0      magic
//!  4      max_entries
//!  8      max_bytes
//! 12      active_region (0 or 1)
//! 16      active_entries
//! 20      active_bytes
//! 24      version
//! 28      checksum over bytes 0..28
//! ```
//!
//! A slot is `key: i64` + `offset: u32`. `offset == 0` marks an empty slot;
//! no record can live at offset 0 because the data region magic occupies it.
//! The stored key is the key of the newest record pushed into the bucket;
//! older records (same key or colliding keys) are reached through each
//! record's `chain_offset`, so readers treat the slot as a chain head no
//! matter which key it records.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use crate::checksum::checksum;
use crate::error::Result;
use crate::region::DATA_HEADER_SIZE;
use crate::Error;

pub const INDEX_HEADER_SIZE: usize = 32;
pub const SLOT_SIZE: usize = 12;

const INDEX_MAGIC: u32 = u32::from_le_bytes(*b"BCI1");
const VERSION: u32 = 1;

/// Range of header bytes covered by the header checksum.
const CHECKSUM_RANGE: usize = 28;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IndexHeader {
    pub magic: u32,
    pub max_entries: u32,
    pub max_bytes: u32,
    pub active_region: u32,
    pub active_entries: u32,
    pub active_bytes: u32,
    pub version: u32,
}

impl IndexHeader {
    pub fn new(max_entries: u32, max_bytes: u32) -> Self {
        Self {
            magic: INDEX_MAGIC,
            max_entries,
            max_bytes,
            active_region: 0,
            active_entries: 0,
            active_bytes: DATA_HEADER_SIZE as u32,
            version: VERSION,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.magic != INDEX_MAGIC {
            return Err(Error::InvalidMagic);
        }
        if self.version != VERSION {
            return Err(Error::InvalidHeader);
        }
        if self.active_region > 1 {
            return Err(Error::InvalidHeader);
        }
        if self.active_entries > self.max_entries {
            return Err(Error::InvalidHeader);
        }
        if self.active_bytes < DATA_HEADER_SIZE as u32 || self.active_bytes > self.max_bytes {
            return Err(Error::InvalidHeader);
        }
        Ok(())
    }

    pub fn encode(&self) -> [u8; INDEX_HEADER_SIZE] {
        let mut buf = [0u8; INDEX_HEADER_SIZE];
        let mut cursor = &mut buf[..];
        cursor.write_u32::<LittleEndian>(self.magic).unwrap();
        cursor.write_u32::<LittleEndian>(self.max_entries).unwrap();
        cursor.write_u32::<LittleEndian>(self.max_bytes).unwrap();
        cursor.write_u32::<LittleEndian>(self.active_region).unwrap();
        cursor.write_u32::<LittleEndian>(self.active_entries).unwrap();
        cursor.write_u32::<LittleEndian>(self.active_bytes).unwrap();
        cursor.write_u32::<LittleEndian>(self.version).unwrap();

        let sum = checksum(&buf[..CHECKSUM_RANGE]);
        (&mut buf[CHECKSUM_RANGE..])
            .write_u32::<LittleEndian>(sum)
            .unwrap();
        buf
    }

    pub fn decode(buf: &[u8; INDEX_HEADER_SIZE]) -> Result<Self> {
        let mut cursor = &buf[..];
        let header = Self {
            magic: cursor.read_u32::<LittleEndian>()?,
            max_entries: cursor.read_u32::<LittleEndian>()?,
            max_bytes: cursor.read_u32::<LittleEndian>()?,
            active_region: cursor.read_u32::<LittleEndian>()?,
            active_entries: cursor.read_u32::<LittleEndian>()?,
            active_bytes: cursor.read_u32::<LittleEndian>()?,
            version: cursor.read_u32::<LittleEndian>()?,
        };

        if header.magic != INDEX_MAGIC {
            return Err(Error::InvalidMagic);
        }
        let stored = (&buf[CHECKSUM_RANGE..]).read_u32::<LittleEndian>()?;
        if checksum(&buf[..CHECKSUM_RANGE]) != stored {
            return Err(Error::ChecksumMismatch);
        }
        header.validate()?;
        Ok(header)
    }
}

pub struct IndexStore {
    file: File,
    header: IndexHeader,
}

impl std::fmt::Debug for IndexStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexStore").field("header", &self.header).finish()
    }
}

impl IndexStore {
    /// Writes a fresh index: default header, both slot tables zeroed.
    pub fn create(path: &Path, max_entries: u32, max_bytes: u32) -> Result<Self> {
        let mut file = File::options()
            .create(true)
            .read(true)
            .write(true)
            .truncate(true)
            .open(path)?;

        let header = IndexHeader::new(max_entries, max_bytes);
        file.write_all(&header.encode())?;

        let mut remaining = max_entries as usize * SLOT_SIZE * 2;
        let zeros = vec![0u8; remaining.min(64 * 1024)];
        while remaining > 0 {
            let n = remaining.min(zeros.len());
            file.write_all(&zeros[..n])?;
            remaining -= n;
        }
        file.sync_all()?;

        Ok(Self { file, header })
    }

    /// Opens an existing index and validates the header against the limits
    /// the caller expects. Any mismatch is an error; the caller decides
    /// whether to fall back to a reset.
    pub fn open(path: &Path, max_entries: u32, max_bytes: u32) -> Result<Self> {
        let mut file = File::options().read(true).write(true).open(path)?;

        let mut buf = [0u8; INDEX_HEADER_SIZE];
        if let Err(e) = file.read_exact(&mut buf) {
            return match e.kind() {
                std::io::ErrorKind::UnexpectedEof => Err(Error::InvalidHeader),
                _ => Err(e.into()),
            };
        }
        let header = IndexHeader::decode(&buf)?;

        if header.max_entries != max_entries || header.max_bytes != max_bytes {
            return Err(Error::Corrupted(format!(
                "index limits ({}, {}) do not match requested ({}, {})",
                header.max_entries, header.max_bytes, max_entries, max_bytes
            )));
        }

        let expected = INDEX_HEADER_SIZE as u64 + max_entries as u64 * SLOT_SIZE as u64 * 2;
        let actual = file.metadata()?.len();
        if actual != expected {
            return Err(Error::Corrupted(format!(
                "index file is {} bytes, expected {}",
                actual, expected
            )));
        }

        Ok(Self { file, header })
    }

    pub fn active_region(&self) -> u32 {
        self.header.active_region
    }

    pub fn active_entries(&self) -> u32 {
        self.header.active_entries
    }

    pub fn active_bytes(&self) -> u32 {
        self.header.active_bytes
    }

    /// Bucket for a key; `rem_euclid` keeps negative keys in range.
    pub fn bucket_of(&self, key: i64) -> u32 {
        key.rem_euclid(self.header.max_entries as i64) as u32
    }

    /// Reads a bucket's slot: the recorded key and the chain head offset
    /// (0 if the bucket is empty).
    pub fn slot(&mut self, region: u32, bucket: u32) -> Result<(i64, u32)> {
        self.file.seek(SeekFrom::Start(self.slot_pos(region, bucket)))?;
        let key = self.file.read_i64::<LittleEndian>()?;
        let offset = self.file.read_u32::<LittleEndian>()?;
        Ok((key, offset))
    }

    /// Overwrites a bucket's head pointer; the previous head stays reachable
    /// through the new record's chain_offset.
    pub fn set_slot(&mut self, region: u32, bucket: u32, key: i64, offset: u32) -> Result<()> {
        self.file.seek(SeekFrom::Start(self.slot_pos(region, bucket)))?;
        self.file.write_i64::<LittleEndian>(key)?;
        self.file.write_u32::<LittleEndian>(offset)?;
        Ok(())
    }

    /// Zeroes a region's whole slot table. Offsets into a wiped region are
    /// meaningless, so this precedes every activation.
    pub fn clear_region(&mut self, region: u32) -> Result<()> {
        self.file.seek(SeekFrom::Start(self.slot_pos(region, 0)))?;

        let mut remaining = self.header.max_entries as usize * SLOT_SIZE;
        let zeros = vec![0u8; remaining.min(64 * 1024)];
        while remaining > 0 {
            let n = remaining.min(zeros.len());
            self.file.write_all(&zeros[..n])?;
            remaining -= n;
        }
        Ok(())
    }

    /// Makes `region` the active one, zeroing the live counters.
    pub fn set_active_region(&mut self, region: u32) -> Result<()> {
        self.header.active_region = region;
        self.header.active_entries = 0;
        self.header.active_bytes = DATA_HEADER_SIZE as u32;
        self.write_header()
    }

    /// Records the active region's live entry count and byte length.
    pub fn set_active_counters(&mut self, entries: u32, bytes: u32) -> Result<()> {
        self.header.active_entries = entries;
        self.header.active_bytes = bytes;
        self.write_header()
    }

    pub fn sync(&mut self) -> Result<()> {
        Ok(self.file.sync_all()?)
    }

    fn slot_pos(&self, region: u32, bucket: u32) -> u64 {
        INDEX_HEADER_SIZE as u64
            + (region as u64 * self.header.max_entries as u64 + bucket as u64) * SLOT_SIZE as u64
    }

    fn write_header(&mut self) -> Result<()> {
        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(&self.header.encode())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn create_temp_index(max_entries: u32) -> (tempfile::TempDir, IndexStore) {
        let dir = tempdir().expect("Failed to create temp dir");
        let path = dir.path().join("cache.idx");
        let index =
            IndexStore::create(&path, max_entries, 4096).expect("Failed to create index");
        (dir, index)
    }

    #[test]
    fn test_header_encoding_decoding() {
        let mut header = IndexHeader::new(128, 4096);
        header.active_region = 1;
        header.active_entries = 17;
        header.active_bytes = 512;

        let encoded = header.encode();
        assert_eq!(encoded.len(), INDEX_HEADER_SIZE);

        let decoded = IndexHeader::decode(&encoded).expect("Failed to decode header");
        assert_eq!(header, decoded);
    }

    #[test]
    fn test_header_magic_validation() {
        let header = IndexHeader::new(128, 4096);
        let mut encoded = header.encode();
        encoded[0] ^= 0xff;

        match IndexHeader::decode(&encoded) {
            Err(Error::InvalidMagic) => {}
            other => panic!("Expected InvalidMagic, got {:?}", other),
        }
    }

    #[test]
    fn test_header_checksum_validation() {
        let header = IndexHeader::new(128, 4096);
        let mut encoded = header.encode();
        // Flip a bit inside the checksummed range, past the magic.
        encoded[13] ^= 0x01;

        match IndexHeader::decode(&encoded) {
            Err(Error::ChecksumMismatch) => {}
            other => panic!("Expected ChecksumMismatch, got {:?}", other),
        }
    }

    #[test]
    fn test_slot_round_trip() {
        let (_dir, mut index) = create_temp_index(16);

        assert_eq!(index.slot(0, 3).expect("Failed to read slot"), (0, 0));

        index.set_slot(0, 3, -99, 1234).expect("Failed to set slot");
        assert_eq!(index.slot(0, 3).expect("Failed to read slot"), (-99, 1234));

        // The other region's table is untouched.
        assert_eq!(index.slot(1, 3).expect("Failed to read slot"), (0, 0));
    }

    #[test]
    fn test_bucket_of_negative_keys() {
        let (_dir, index) = create_temp_index(10);

        assert_eq!(index.bucket_of(23), 3);
        assert_eq!(index.bucket_of(-1), 9);
        assert_eq!(index.bucket_of(-10), 0);
        assert_eq!(index.bucket_of(i64::MIN), index.bucket_of(i64::MIN + 10));
    }

    #[test]
    fn test_clear_region() {
        let (_dir, mut index) = create_temp_index(8);

        for bucket in 0..8 {
            index.set_slot(0, bucket, bucket as i64, 100 + bucket).expect("Failed to set slot");
            index.set_slot(1, bucket, bucket as i64, 200 + bucket).expect("Failed to set slot");
        }

        index.clear_region(0).expect("Failed to clear region");

        for bucket in 0..8 {
            assert_eq!(index.slot(0, bucket).expect("Failed to read slot"), (0, 0));
            assert_eq!(
                index.slot(1, bucket).expect("Failed to read slot"),
                (bucket as i64, 200 + bucket)
            );
        }
    }

    #[test]
    fn test_active_region_persists_across_reopen() {
        let dir = tempdir().expect("Failed to create temp dir");
        let path = dir.path().join("cache.idx");

        let mut index = IndexStore::create(&path, 16, 4096).expect("Failed to create index");
        index.set_active_region(1).expect("Failed to set active region");
        index.set_active_counters(3, 64).expect("Failed to set counters");
        index.sync().expect("Failed to sync");
        drop(index);

        let index = IndexStore::open(&path, 16, 4096).expect("Failed to reopen index");
        assert_eq!(index.active_region(), 1);
        assert_eq!(index.active_entries(), 3);
        assert_eq!(index.active_bytes(), 64);
    }

    #[test]
    fn test_open_rejects_mismatched_limits() {
        let dir = tempdir().expect("Failed to create temp dir");
        let path = dir.path().join("cache.idx");

        IndexStore::create(&path, 16, 4096).expect("Failed to create index");

        assert!(matches!(
            IndexStore::open(&path, 32, 4096),
            Err(Error::Corrupted(_))
        ));
        assert!(matches!(
            IndexStore::open(&path, 16, 8192),
            Err(Error::Corrupted(_))
        ));
    }

    #[test]
    fn test_open_rejects_truncated_file() {
        let dir = tempdir().expect("Failed to create temp dir");
        let path = dir.path().join("cache.idx");

        IndexStore::create(&path, 16, 4096).expect("Failed to create index");
        let full = std::fs::metadata(&path).unwrap().len();
        let file = File::options().write(true).open(&path).unwrap();
        file.set_len(full - 12).unwrap();
        drop(file);

        assert!(matches!(
            IndexStore::open(&path, 16, 4096),
            Err(Error::Corrupted(_))
        ));
    }
}

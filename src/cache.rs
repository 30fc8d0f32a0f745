//! The cache façade: one index, two data regions, one mutex.
//!
//! Inserts append to the active region and push the record onto its bucket
//! chain. Lookups walk the active region's chain first, then the previous
//! region's; a hit found only in the previous region is copied forward
//! ("promoted") into the active region so it survives the next flip. When
//! the active region runs out of byte capacity, or half its buckets are in
//! use, a flip wipes the other region and makes it active — the single
//! point of bulk eviction. Reads are therefore the retention signal:
//! entries not read between two flips of their region are lost.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::config::CacheConfig;
use crate::error::Result;
use crate::index::IndexStore;
use crate::region::{DataRegion, BLOB_HEADER_SIZE, DATA_HEADER_SIZE};
use crate::Error;

/// Buffer-reusing lookup argument. On a hit the payload lands in `buffer`:
/// copied in place when the caller's buffer is long enough, otherwise the
/// buffer is replaced by an owned one. `length` is the payload length
/// either way. On a miss the request is untouched.
#[derive(Debug, Default)]
pub struct LookupRequest {
    pub key: i64,
    pub buffer: Option<Vec<u8>>,
    pub length: usize,
}

impl LookupRequest {
    pub fn new(key: i64) -> Self {
        Self {
            key,
            buffer: None,
            length: 0,
        }
    }
}

/// Disk-resident key->blob cache with two-generation eviction.
///
/// A cache named `base` owns three files: `base.idx`, `base.0`, `base.1`.
/// One process opens a given cache path at a time; within the process the
/// internal mutex serializes all operations, so a flip is atomic from every
/// caller's point of view.
pub struct BlobCache {
    inner: Mutex<CacheInner>,
}

struct CacheInner {
    index: IndexStore,
    regions: [DataRegion; 2],
    max_entries: u32,
    max_bytes: u32,
}

impl BlobCache {
    /// Opens the cache at `path` (the base name of its three files).
    ///
    /// With `reset` the files are wiped and recreated unconditionally. Without
    /// it they must exist and validate (index header checksum, both region
    /// magics, stored limits equal to the arguments); any failure is returned
    /// as an error and the caller chooses whether to retry with `reset`.
    pub fn open(
        path: impl AsRef<Path>,
        max_entries: u32,
        max_bytes: u32,
        reset: bool,
    ) -> Result<Self> {
        Self::open_with_config(path, CacheConfig::new(max_entries, max_bytes).reset(reset))
    }

    pub fn open_with_config(path: impl AsRef<Path>, config: CacheConfig) -> Result<Self> {
        if config.max_entries == 0 {
            return Err(Error::InvalidInput("max_entries must be positive".to_string()));
        }
        if config.max_bytes as usize <= DATA_HEADER_SIZE + BLOB_HEADER_SIZE {
            return Err(Error::InvalidInput(format!(
                "max_bytes of {} cannot hold any record",
                config.max_bytes
            )));
        }

        let base = path.as_ref();
        if config.reset {
            Self::create(base, &config)
        } else {
            Self::open_existing(base, &config)
        }
    }

    fn create(base: &Path, config: &CacheConfig) -> Result<Self> {
        let index = IndexStore::create(
            &cache_file(base, "idx"),
            config.max_entries,
            config.max_bytes,
        )?;
        let regions = [
            DataRegion::create(&cache_file(base, "0"), config.max_bytes)?,
            DataRegion::create(&cache_file(base, "1"), config.max_bytes)?,
        ];

        tracing::info!(
            path = %base.display(),
            max_entries = config.max_entries,
            max_bytes = config.max_bytes,
            "Created blob cache"
        );

        Ok(Self {
            inner: Mutex::new(CacheInner {
                index,
                regions,
                max_entries: config.max_entries,
                max_bytes: config.max_bytes,
            }),
        })
    }

    fn open_existing(base: &Path, config: &CacheConfig) -> Result<Self> {
        let index = IndexStore::open(
            &cache_file(base, "idx"),
            config.max_entries,
            config.max_bytes,
        )?;
        let regions = [
            DataRegion::open(&cache_file(base, "0"), config.max_bytes)?,
            DataRegion::open(&cache_file(base, "1"), config.max_bytes)?,
        ];

        let mut inner = CacheInner {
            index,
            regions,
            max_entries: config.max_entries,
            max_bytes: config.max_bytes,
        };

        // A crash between a data append and the header rewrite leaves a tail
        // the index knows nothing about; drop it. A region shorter than the
        // header claims cannot be explained that way and invalidates the
        // cache.
        let active = inner.index.active_region() as usize;
        let recorded = inner.index.active_bytes() as u64;
        let actual = inner.regions[active].len();
        if actual < recorded {
            return Err(Error::Corrupted(format!(
                "active region is {} bytes but the index records {}",
                actual, recorded
            )));
        }
        if actual > recorded {
            tracing::warn!(
                region = active,
                dropped = actual - recorded,
                "Truncating torn tail from active region"
            );
            inner.regions[active].truncate_to(recorded)?;
        }

        tracing::info!(
            path = %base.display(),
            active_region = active,
            active_entries = inner.index.active_entries(),
            "Opened blob cache"
        );

        Ok(Self {
            inner: Mutex::new(inner),
        })
    }

    /// Stores `data` under `key`. Inserting an existing key shadows the old
    /// record; the newest entry wins on lookup.
    pub fn insert(&self, key: i64, data: &[u8]) -> Result<()> {
        self.inner.lock()?.insert(key, data)
    }

    /// Returns the newest valid blob for `key`, or `None`. Damaged records
    /// read as absent; they are never surfaced as errors.
    pub fn lookup(&self, key: i64) -> Result<Option<Vec<u8>>> {
        self.inner.lock()?.lookup(key)
    }

    /// Buffer-reusing variant of [`lookup`](Self::lookup). Returns whether
    /// the key was found; see [`LookupRequest`].
    pub fn lookup_into(&self, request: &mut LookupRequest) -> Result<bool> {
        let Some(payload) = self.inner.lock()?.lookup(request.key)? else {
            return Ok(false);
        };

        request.length = payload.len();
        match request.buffer.as_mut() {
            Some(buffer) if buffer.len() >= payload.len() => {
                buffer[..payload.len()].copy_from_slice(&payload);
            }
            _ => request.buffer = Some(payload),
        }
        Ok(true)
    }

    /// Number of distinct keys whose chain head lies in the active region.
    /// Entries reachable only through the previous region do not count.
    pub fn active_count(&self) -> Result<u32> {
        Ok(self.inner.lock()?.index.active_entries())
    }

    /// Forces the index and both regions to stable storage. An explicit
    /// durability checkpoint; callers decide when to pay for it.
    pub fn sync_all(&self) -> Result<()> {
        self.inner.lock()?.sync_all()
    }

    /// Syncs and closes the cache. Equivalent to dropping it, made explicit
    /// for callers tying the cache to an owner's lifecycle.
    pub fn close(self) {}
}

impl Drop for BlobCache {
    fn drop(&mut self) {
        if let Ok(mut inner) = self.inner.lock() {
            let _ = inner.sync_all();
        }
    }
}

impl CacheInner {
    fn insert(&mut self, key: i64, data: &[u8]) -> Result<()> {
        let max_blob = self.max_bytes as usize - DATA_HEADER_SIZE - BLOB_HEADER_SIZE;
        if data.len() > max_blob {
            return Err(Error::BlobTooLarge {
                size: data.len(),
                max: max_blob,
            });
        }

        if self.needs_flip(data.len()) {
            self.flip()?;
        }
        self.append_active(key, data)
    }

    fn lookup(&mut self, key: i64) -> Result<Option<Vec<u8>>> {
        let active = self.index.active_region();
        if let Some(payload) = self.find_in_region(active, key)? {
            return Ok(Some(payload));
        }

        let Some(payload) = self.find_in_region(1 - active, key)? else {
            return Ok(None);
        };

        // Copy the entry forward so it survives the next flip. Promotion is
        // write amplification for durability; its failure must not change
        // the lookup result.
        if let Err(e) = self.promote(key, &payload) {
            tracing::warn!(key, error = %e, "Failed to promote entry into active region");
        }
        Ok(Some(payload))
    }

    /// Walks one region's bucket chain for `key`. Corruption anywhere along
    /// the chain aborts the walk and reads as a miss for this region;
    /// genuine I/O errors propagate.
    fn find_in_region(&mut self, region_id: u32, key: i64) -> Result<Option<Vec<u8>>> {
        let bucket = self.index.bucket_of(key);
        let (_, mut offset) = self.index.slot(region_id, bucket)?;

        while offset != 0 {
            match self.regions[region_id as usize].read_at(offset) {
                Ok((header, payload)) => {
                    if header.key == key {
                        return Ok(Some(payload));
                    }
                    if header.chain_offset >= offset {
                        tracing::warn!(
                            region = region_id,
                            offset,
                            "Chain offset does not decrease; treating as miss"
                        );
                        return Ok(None);
                    }
                    offset = header.chain_offset;
                }
                Err(e) if e.is_corruption() => {
                    tracing::warn!(
                        region = region_id,
                        offset,
                        error = %e,
                        "Corrupt record in chain; treating as miss"
                    );
                    return Ok(None);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(None)
    }

    /// Appends into the active region and pushes the record onto its bucket
    /// chain. Shared by insert and promotion; the caller has already made
    /// room.
    fn append_active(&mut self, key: i64, data: &[u8]) -> Result<()> {
        let region_id = self.index.active_region();
        let bucket = self.index.bucket_of(key);
        let (_, head) = self.index.slot(region_id, bucket)?;

        let overwrite = self.chain_contains(region_id, head, key);
        let offset = self.regions[region_id as usize].append(key, data, head)?;
        self.index.set_slot(region_id, bucket, key, offset)?;

        let entries = self.index.active_entries() + u32::from(!overwrite);
        let bytes = self.regions[region_id as usize].len() as u32;
        self.index.set_active_counters(entries, bytes)
    }

    fn promote(&mut self, key: i64, data: &[u8]) -> Result<()> {
        if self.needs_flip(data.len()) {
            self.flip()?;
        }
        self.append_active(key, data)
    }

    fn needs_flip(&self, payload_len: usize) -> bool {
        let projected =
            self.index.active_bytes() as u64 + (BLOB_HEADER_SIZE + payload_len) as u64;
        projected > self.max_bytes as u64
            || self.index.active_entries() as u64 * 2 >= self.max_entries as u64
    }

    /// Swaps generations: wipes the other region and makes it active. The
    /// header is rewritten last so a crash mid-flip leaves the old header
    /// pointing at untouched old-region state.
    fn flip(&mut self) -> Result<()> {
        let old_active = self.index.active_region();
        let new_active = 1 - old_active;

        self.regions[new_active as usize].reset()?;
        self.index.clear_region(new_active)?;
        self.index.set_active_region(new_active)?;

        tracing::info!(from = old_active, to = new_active, "Flipped active region");
        Ok(())
    }

    /// Header-only walk to tell an overwrite from a first insert, for the
    /// active entry count. Corruption reads as "not present": the count is
    /// bookkeeping, the chain itself stays intact either way.
    fn chain_contains(&mut self, region_id: u32, mut offset: u32, key: i64) -> bool {
        while offset != 0 {
            match self.regions[region_id as usize].header_at(offset) {
                Ok(header) => {
                    if header.key == key {
                        return true;
                    }
                    if header.chain_offset >= offset {
                        return false;
                    }
                    offset = header.chain_offset;
                }
                Err(_) => return false,
            }
        }
        false
    }

    fn sync_all(&mut self) -> Result<()> {
        self.index.sync()?;
        self.regions[0].sync()?;
        self.regions[1].sync()
    }
}

fn cache_file(base: &Path, ext: &str) -> PathBuf {
    let mut name = base.as_os_str().to_os_string();
    name.push(".");
    name.push(ext);
    PathBuf::from(name)
}

//! # blobcache
//!
//! A disk-resident, crash-tolerant key->blob cache. Callers hand it a
//! 64-bit key (typically a content hash) and a byte blob; the cache
//! persists them across process restarts so expensive work — thumbnail
//! decoding, metadata extraction — is not redone. Entries may be lost
//! across an eviction flip or a crash; a key that validates never returns
//! wrong data.
//!
//! ## On-Disk Layout
//!
//! A cache named `base` owns three files:
//!
//! ```text
//! +-----------------------+     +------------------+------------------+
//! | base.idx              |     | base.0           | base.1           |
//! |  header (32 bytes)    |     |  magic (4 bytes) |  magic (4 bytes) |
//! |  region 0 slot table  | --> |  blob records    |  blob records    |
//! |  region 1 slot table  | --> |  (append-only)   |  (append-only)   |
//! +-----------------------+     +------------------+------------------+
//! ```
//!
//! Exactly one data region is active at a time. Inserts append to it and
//! push the record onto an on-disk bucket chain threaded through the
//! records themselves. When the active region fills up, a flip wipes the
//! other region and switches to it; everything not copied forward by a
//! promoting read since the last flip is discarded in bulk. No per-entry
//! eviction bookkeeping exists — reads are the retention signal.

pub mod cache;
pub mod checksum;
pub mod config;
pub mod error;
pub mod index;
pub mod region;

pub use cache::{BlobCache, LookupRequest};
pub use config::CacheConfig;
pub use error::{Error, Result};

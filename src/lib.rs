// SPDX-License-Identifier: MIT
//! # Startup Cache
//!
//! A persistent, compressed key/blob cache for memoizing expensive startup
//! artifacts (compiled scripts, parsed resources) across runs of the same
//! program.
//!
//! ## How it works
//!
//! During a run the process looks entries up with [`BlobStore::get`] and adds
//! new ones with [`BlobStore::put`]. Values are write-once: the first value
//! stored under a key wins. The store remembers the order in which entries
//! were first requested, and once activity goes quiet it writes the
//! requested entries, in that order, to a single archive file that is
//! memory-mapped by the next run.
//!
//! - **Lazy decompression**: each entry is its own zstd frame, decoded only
//!   when it is first requested
//! - **Access-ordered layout**: the next run reads the file roughly front to
//!   back, and a background prefetch warms the page cache
//! - **Self-pruning**: entries nobody asked for are dropped on the next
//!   write once the archive is less than 80% utilized
//! - **Fail-safe**: any corruption discards the whole cache; callers only
//!   ever see "not cached"
//!
//! ## Archive Format
//!
//! ```text
//! Startup Cache Archive v1
//! ========================
//!
//! Magic:        "STARTUPCACHE0001" (16 bytes)
//! Header Len:   u32 LE, byte length of the records that follow
//! Records (repeated, little-endian):
//! - Offset:            u32, frame start relative to the data region
//! - Compressed Size:   u32
//! - Uncompressed Size: u32
//! - Key Len:           u16
//! - Key:               UTF-8 bytes, no terminator
//! Data region:  one zstd frame per record, contiguous, in record order
//! ```
//!
//! ## Usage
//!
//! ```no_run
//! use startup_cache::{BlobStore, CacheConfig};
//!
//! let store = BlobStore::open(CacheConfig::from_env("/tmp/startupCache.bin")).unwrap();
//!
//! let script = match store.get("resource://app/main.js") {
//!     Ok(bytes) => bytes,
//!     Err(_) => {
//!         let compiled = b"compiled bytecode".to_vec();
//!         store.put("resource://app/main.js", compiled.clone()).unwrap();
//!         compiled.into()
//!     }
//! };
//! assert!(!script.is_empty());
//!
//! // Dropping the store persists anything the timer has not written yet
//! drop(store);
//! ```

pub mod codec;
pub mod config;
pub mod error;
pub mod format;
pub mod prefetch;
pub mod reader;
pub mod scheduler;
pub mod stats;
pub mod store;
pub mod table;
pub mod writer;

// Re-export main types
pub use codec::{CodecError, FrameDecoder, FrameEncoder};
pub use config::CacheConfig;
pub use error::CacheError;
pub use format::{parse_archive, ArchiveIndex, EntryRecord, FormatError, ARCHIVE_MAGIC};
pub use reader::{MappedArchive, ReadError};
pub use stats::{CacheStats, LookupOutcome, MemoryReport, StatsSink, StatsSnapshot};
pub use store::{BlobStore, CacheState};
pub use writer::{write_archive, PendingEntry, WriteError, WriteSummary};

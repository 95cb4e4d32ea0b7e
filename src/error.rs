// SPDX-License-Identifier: MIT
//! Errors surfaced by the cache store
//!
//! Archive and codec failures never leave the store as raw I/O or zstd
//! errors; they are folded into the classes below. Every one of them means
//! "behave as if the value was not cached".

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CacheError {
    /// No entry under this key
    #[error("no cache entry for {key:?}")]
    NotFound { key: String },

    /// The entry exists but cannot be produced right now
    #[error("cache entry {key:?} is temporarily unavailable")]
    Unavailable { key: String },

    /// The entry's stored bytes were bad; the whole table was dropped
    #[error("cache entry {key:?} is corrupt: {reason}")]
    Corrupted { key: String, reason: String },

    #[error("key of {len} bytes exceeds maximum of {max}")]
    KeyTooLong { len: usize, max: usize },

    #[error("value of {size} bytes exceeds maximum of {max}")]
    EntryTooLarge { size: usize, max: u64 },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Failure while starting the store's worker threads
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

// SPDX-License-Identifier: MIT
//! Lookup counters and memory accounting hooks
//!
//! The store reports through these; nothing here feeds back into cache
//! behaviour.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// How a single `get` was answered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LookupOutcome {
    /// Bytes were already in memory
    HitMemory,
    /// Bytes were decoded from the mapped archive
    HitDisk,
    /// Nothing usable was returned
    Miss,
}

/// Receiver for per-lookup events
pub trait StatsSink: Send + Sync {
    fn record_lookup(&self, outcome: LookupOutcome);
}

/// Sink that drops everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopStats;

impl StatsSink for NoopStats {
    fn record_lookup(&self, _outcome: LookupOutcome) {}
}

/// Atomic lookup counters
#[derive(Debug, Default)]
pub struct CacheStats {
    hit_memory: AtomicU64,
    hit_disk: AtomicU64,
    miss: AtomicU64,
}

impl CacheStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            hit_memory: self.hit_memory.load(Ordering::Relaxed),
            hit_disk: self.hit_disk.load(Ordering::Relaxed),
            miss: self.miss.load(Ordering::Relaxed),
        }
    }
}

impl StatsSink for CacheStats {
    fn record_lookup(&self, outcome: LookupOutcome) {
        let counter = match outcome {
            LookupOutcome::HitMemory => &self.hit_memory,
            LookupOutcome::HitDisk => &self.hit_disk,
            LookupOutcome::Miss => &self.miss,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub hit_memory: u64,
    pub hit_disk: u64,
    pub miss: u64,
}

impl StatsSnapshot {
    pub fn lookups(&self) -> u64 {
        self.hit_memory + self.hit_disk + self.miss
    }
}

/// Approximate footprint of the store
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MemoryReport {
    /// Keys, entry metadata and decoded bytes of the live table
    pub table_bytes: usize,
    /// Size of the currently mapped archive
    pub mapped_bytes: usize,
    /// Invalidated tables still pinned by callers
    pub retained_tables: usize,
    /// Buffers of those tables that are still alive
    pub retained_buffers: usize,
}

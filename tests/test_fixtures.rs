//! Shared test fixtures and utilities for the integration tests
#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tempfile::TempDir;

use startup_cache::{
    parse_archive, write_archive, BlobStore, CacheConfig, CacheStats, FrameEncoder, PendingEntry,
};

/// Isolated profile directory with a cache path inside it
pub struct TestEnvironment {
    pub dir: TempDir,
    pub config: CacheConfig,
}

impl TestEnvironment {
    /// Long write delay and no prefetch, so tests drive writes explicitly
    pub fn new() -> Self {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let config = CacheConfig::new(dir.path().join("startupCache.bin"))
            .with_write_delay(Duration::from_secs(3600))
            .with_prefetch(false);
        Self { dir, config }
    }

    pub fn with_write_delay(mut self, delay: Duration) -> Self {
        self.config = self.config.with_write_delay(delay);
        self
    }

    pub fn with_prefetch(mut self, prefetch: bool) -> Self {
        self.config = self.config.with_prefetch(prefetch);
        self
    }

    pub fn archive_path(&self) -> &Path {
        &self.config.path
    }

    pub fn open(&self) -> BlobStore {
        BlobStore::open(self.config.clone()).expect("Failed to open store")
    }

    pub fn open_with_stats(&self) -> (BlobStore, Arc<CacheStats>) {
        let stats = Arc::new(CacheStats::new());
        let store = BlobStore::with_stats(self.config.clone(), stats.clone())
            .expect("Failed to open store");
        (store, stats)
    }

    /// Write an archive as a previous run would have left it
    pub fn seed_archive(&self, entries: &[(&str, &[u8])]) {
        let pending: Vec<PendingEntry> = entries
            .iter()
            .map(|(key, data)| PendingEntry::new(*key, data.to_vec()))
            .collect();
        write_archive(self.archive_path(), &pending, &FrameEncoder::default())
            .expect("Failed to seed archive");
    }

    /// Keys of the archive on disk, in file order
    pub fn archive_keys(&self) -> Vec<String> {
        let bytes = std::fs::read(self.archive_path()).expect("Failed to read archive");
        parse_archive(&bytes)
            .expect("Archive should parse")
            .records
            .into_iter()
            .map(|record| record.key)
            .collect()
    }
}

/// Value used for key `key` in generated fixtures
pub fn value_for(key: &str) -> Vec<u8> {
    format!("compiled bytes for {key} ").repeat(8).into_bytes()
}

/// `count` keys of the form `resource://app/module{i}.js`
pub fn numbered_keys(count: usize) -> Vec<String> {
    (0..count)
        .map(|i| format!("resource://app/module{i}.js"))
        .collect()
}

/// Overwrite the compressed frame of `key` with zeros
pub fn zero_frame(path: &Path, key: &str) {
    let mut bytes = std::fs::read(path).expect("Failed to read archive");
    let index = parse_archive(&bytes).expect("Archive should parse");
    let record = index
        .records
        .iter()
        .find(|record| record.key == key)
        .expect("Key should be in archive");
    let start = index.data_start + record.offset as usize;
    let end = start + record.compressed_size as usize;
    bytes[start..end].fill(0);
    std::fs::write(path, bytes).expect("Failed to write archive");
}

/// Poll `condition` until it holds or `timeout` passes
pub fn wait_for(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    condition()
}


// SPDX-License-Identifier: MIT
//! The process-wide blob store
//!
//! `BlobStore` owns the entry table, the mapped archive and the worker
//! threads around them. All table and mapping state sits behind one mutex,
//! and every operation that takes it first waits for an in-flight write-back
//! to finish, so the writer only ever races against its own snapshot.
//!
//! Lifecycle of one run:
//!
//! 1. `open` maps the archive left by the previous run, if it is valid, and
//!    starts warming its pages in the background.
//! 2. `get` decodes entries on demand and records the order they were first
//!    requested in. `put` adds new entries.
//! 3. Sixty seconds after the last change the timer fires and a background
//!    writer persists the requested entries, in request order, to a fresh
//!    archive. At most one write happens per run.
//! 4. Dropping the store writes synchronously if the timer never got to.

use std::fs;
use std::io::ErrorKind;
use std::path::Path;
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::codec::{FrameDecoder, FrameEncoder};
use crate::config::CacheConfig;
use crate::error::CacheError;
use crate::format::MAX_KEY_LEN;
use crate::prefetch::PrefetchWorker;
use crate::reader::{FrameLocation, MappedArchive, ReadError};
use crate::scheduler::DebounceTimer;
use crate::stats::{LookupOutcome, MemoryReport, NoopStats, StatsSink};
use crate::table::{Entry, EntryTable, RetainedTable};
use crate::writer::{write_archive, WriteError, WriteSummary};

const TIMER_THREAD_NAME: &str = "startup-cache-timer";
const WRITER_THREAD_NAME: &str = "startup-cache-writer";

/// Coarse lifecycle state, mostly useful in tests and diagnostics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheState {
    /// No archive loaded and nothing new put
    Empty,
    /// Serving from a previous run's archive, nothing new to persist
    Loaded,
    /// Has changes that no write has persisted yet
    Dirty,
    /// This run's one write-back has completed
    Written,
}

type WriterHandle = JoinHandle<Result<WriteSummary, WriteError>>;

struct StoreState {
    table: EntryTable,
    archive: Option<MappedArchive>,
    /// Created on the first disk read and reused for the rest of the run
    decoder: Option<FrameDecoder>,
    writer: Option<WriterHandle>,
    prefetch: Option<PrefetchWorker>,
    retained: Vec<RetainedTable>,
    generation: u64,
    dirty: bool,
    written_once: bool,
    /// Set when the archive is known bad or could not be removed; cleared
    /// only by a successful removal
    ignore_disk_cache: bool,
}

impl StoreState {
    fn new() -> Self {
        Self {
            table: EntryTable::new(),
            archive: None,
            decoder: None,
            writer: None,
            prefetch: None,
            retained: Vec::new(),
            generation: 0,
            dirty: false,
            written_once: false,
            ignore_disk_cache: false,
        }
    }
}

/// Why a disk-resident entry could not be produced
enum DecodeFailure {
    Unavailable,
    Corrupt(String),
}

struct StoreShared {
    config: CacheConfig,
    encoder: FrameEncoder,
    stats: Arc<dyn StatsSink>,
    state: Mutex<StoreState>,
}

impl StoreShared {
    fn path(&self) -> &Path {
        &self.config.path
    }

    /// Map the archive at the configured path into an empty table
    fn load_archive(&self, state: &mut StoreState) {
        if state.ignore_disk_cache {
            debug!(path = %self.path().display(), "ignoring on-disk archive");
            return;
        }

        match MappedArchive::open(self.path()) {
            Ok((archive, records)) => {
                state.table = EntryTable::from_records(&records);
                info!(
                    path = %self.path().display(),
                    entries = records.len(),
                    bytes = archive.mapped_len(),
                    "loaded startup cache archive"
                );
                if self.config.prefetch {
                    match PrefetchWorker::spawn(archive.mapping()) {
                        Ok(worker) => state.prefetch = Some(worker),
                        Err(e) => warn!(error = %e, "failed to start prefetch worker"),
                    }
                }
                state.archive = Some(archive);
            }
            Err(ReadError::Missing) => {
                debug!(path = %self.path().display(), "no startup cache archive");
            }
            Err(ReadError::Corrupt(e)) => {
                warn!(
                    path = %self.path().display(),
                    error = %e,
                    "startup cache archive is corrupt; ignoring it"
                );
                state.ignore_disk_cache = true;
            }
            Err(ReadError::Io(e)) => {
                warn!(
                    path = %self.path().display(),
                    error = %e,
                    "failed to open startup cache archive"
                );
            }
        }
    }

    /// Wait for the prefetch worker, then drop the mapping
    fn release_mapping(&self, state: &mut StoreState) {
        if let Some(mut worker) = state.prefetch.take() {
            worker.join();
        }
        state.archive = None;
    }

    /// Wait for an in-flight write and apply its outcome.
    ///
    /// Returns `None` if no write was running, otherwise whether it
    /// succeeded.
    fn join_writer(&self, state: &mut StoreState) -> Option<bool> {
        let handle = state.writer.take()?;
        let result = match handle.join() {
            Ok(result) => result,
            Err(_) => {
                error!("startup cache writer panicked");
                Err(WriteError::Io(std::io::Error::other(
                    "writer thread panicked",
                )))
            }
        };
        Some(self.apply_write_outcome(state, result))
    }

    fn apply_write_outcome(
        &self,
        state: &mut StoreState,
        result: Result<WriteSummary, WriteError>,
    ) -> bool {
        match result {
            Ok(summary) => {
                state.dirty = false;
                state.written_once = true;
                info!(
                    path = %self.path().display(),
                    entries = summary.entries,
                    bytes = summary.file_len(),
                    uncompressed_bytes = summary.uncompressed_len,
                    "wrote startup cache archive"
                );
                true
            }
            Err(e) => {
                warn!(
                    path = %self.path().display(),
                    error = %e,
                    "failed to write startup cache archive"
                );
                self.remap_after_failed_write(state);
                false
            }
        }
    }

    /// Map the old archive again after a failed write so disk-resident
    /// entries stay readable. Adopted only if it still matches the table.
    fn remap_after_failed_write(&self, state: &mut StoreState) {
        if state.archive.is_some() || state.ignore_disk_cache {
            return;
        }
        let Ok((archive, records)) = MappedArchive::open(self.path()) else {
            return;
        };
        let matches_table = records.iter().all(|record| {
            state.table.get(&record.key).and_then(Entry::location)
                == Some(FrameLocation::from(record))
        });
        if matches_table {
            debug!(path = %self.path().display(), "remapped previous archive");
            state.archive = Some(archive);
        }
    }

    /// Start the background write if this run still owes one.
    ///
    /// Returns `true` if a writer thread was spawned.
    fn start_write(&self, state: &mut StoreState) -> bool {
        if state.written_once {
            debug!("startup cache already written this run");
            return false;
        }

        let compact = apply_compaction_rule(state);
        if state.archive.is_some() && !compact {
            debug!(
                entries = state.table.len(),
                requested = state.table.requested_count(),
                "archive still well utilized; skipping write"
            );
            return false;
        }
        if !state.dirty {
            return false;
        }

        let entries = state.table.requested_entries();
        self.release_mapping(state);

        let path = self.config.path.clone();
        let encoder = self.encoder;
        debug!(entries = entries.len(), compact, "starting startup cache write");
        let spawned = std::thread::Builder::new()
            .name(WRITER_THREAD_NAME.to_string())
            .spawn(move || write_archive(&path, &entries, &encoder));

        match spawned {
            Ok(handle) => {
                state.writer = Some(handle);
                true
            }
            Err(e) => {
                warn!(error = %e, "failed to start startup cache writer");
                self.remap_after_failed_write(state);
                false
            }
        }
    }

    /// Timer callback
    fn on_write_timeout(&self) {
        let mut state = self.state.lock();
        self.join_writer(&mut state);
        self.start_write(&mut state);
    }

    /// Write on the calling thread if changes are still unpersisted
    fn write_synchronously(&self, state: &mut StoreState) {
        self.join_writer(state);
        if state.written_once {
            return;
        }
        apply_compaction_rule(state);
        if !state.dirty {
            return;
        }

        let entries = state.table.requested_entries();
        self.release_mapping(state);
        let started = Instant::now();
        let result = write_archive(self.path(), &entries, &self.encoder);
        if self.apply_write_outcome(state, result) {
            debug!(
                elapsed_ms = started.elapsed().as_millis() as u64,
                "flushed startup cache before exit"
            );
        }
    }

    fn invalidate_locked(&self, state: &mut StoreState, memory_only: bool) {
        self.join_writer(state);
        self.release_mapping(state);

        state.generation += 1;
        if let Some(retained) = state.table.retire(state.generation) {
            state.retained.push(retained);
        }
        state.retained.retain(RetainedTable::is_alive);
        if state.retained.len() > self.config.retained_table_warn_threshold {
            warn!(
                retained = state.retained.len(),
                live_buffers = state.retained.iter().map(RetainedTable::live_buffers).sum::<usize>(),
                oldest_generation = state.retained.first().map_or(0, RetainedTable::generation),
                current_generation = state.generation,
                "many invalidated startup cache tables are still referenced"
            );
        }
        state.dirty = false;
        state.written_once = false;

        if !memory_only {
            match fs::remove_file(self.path()) {
                Ok(()) => state.ignore_disk_cache = false,
                Err(e) if e.kind() == ErrorKind::NotFound => state.ignore_disk_cache = false,
                Err(e) => {
                    warn!(
                        path = %self.path().display(),
                        error = %e,
                        "failed to remove startup cache archive; ignoring it from now on"
                    );
                    state.ignore_disk_cache = true;
                }
            }
        }

        self.load_archive(state);
        info!(
            generation = state.generation,
            memory_only,
            entries = state.table.len(),
            "invalidated startup cache"
        );
    }

    /// Produce the bytes for `key`, decoding from the mapping if needed.
    ///
    /// Returns the bytes and whether this was the key's first request.
    fn lookup(&self, state: &mut StoreState, key: &str) -> Result<(Arc<[u8]>, bool), CacheError> {
        let decoded = {
            let StoreState {
                table,
                archive,
                decoder,
                ..
            } = &mut *state;

            let Some(entry) = table.get_mut(key) else {
                self.stats.record_lookup(LookupOutcome::Miss);
                return Err(CacheError::NotFound {
                    key: key.to_string(),
                });
            };

            match entry.data() {
                Some(data) => Ok((Arc::clone(data), LookupOutcome::HitMemory)),
                None => decode_entry(archive.as_ref(), decoder, entry).map(|bytes| {
                    let data: Arc<[u8]> = Arc::from(bytes);
                    entry.set_data(Arc::clone(&data));
                    (data, LookupOutcome::HitDisk)
                }),
            }
        };

        match decoded {
            Ok((data, outcome)) => {
                self.stats.record_lookup(outcome);
                let first_request = state.table.mark_requested(key);
                Ok((data, first_request))
            }
            Err(DecodeFailure::Unavailable) => {
                self.stats.record_lookup(LookupOutcome::Miss);
                Err(CacheError::Unavailable {
                    key: key.to_string(),
                })
            }
            Err(DecodeFailure::Corrupt(reason)) => {
                self.stats.record_lookup(LookupOutcome::Miss);
                error!(key, %reason, "corrupt startup cache entry; invalidating cache");
                self.invalidate_locked(state, false);
                Err(CacheError::Corrupted {
                    key: key.to_string(),
                    reason,
                })
            }
        }
    }
}

/// Mark the table dirty when the loaded archive is mostly unused.
///
/// Returns whether the archive should be rewritten down to the requested
/// entries. Both the timer and the shutdown write go through here.
fn apply_compaction_rule(state: &mut StoreState) -> bool {
    let compact = state.archive.is_some() && state.table.should_compact();
    if compact {
        state.dirty = true;
    }
    compact
}

fn decode_entry(
    archive: Option<&MappedArchive>,
    decoder: &mut Option<FrameDecoder>,
    entry: &Entry,
) -> Result<Vec<u8>, DecodeFailure> {
    let (Some(archive), Some(location)) = (archive, entry.location()) else {
        return Err(DecodeFailure::Unavailable);
    };
    let frame = archive
        .frame(location)
        .map_err(|e| DecodeFailure::Corrupt(e.to_string()))?;

    if decoder.is_none() {
        match FrameDecoder::new() {
            Ok(created) => *decoder = Some(created),
            Err(e) => {
                warn!(error = %e, "failed to create decompression context");
                return Err(DecodeFailure::Unavailable);
            }
        }
    }
    let Some(decoder) = decoder.as_mut() else {
        return Err(DecodeFailure::Unavailable);
    };

    decoder
        .decode_frame(frame, entry.uncompressed_size() as usize)
        .map_err(|e| DecodeFailure::Corrupt(e.to_string()))
}

/// Persistent, compressed key to blob cache.
///
/// One instance is meant to live for the whole process. It is `Send` and
/// `Sync`; all operations serialize on an internal lock.
pub struct BlobStore {
    shared: Arc<StoreShared>,
    timer: Option<DebounceTimer>,
}

impl BlobStore {
    /// Open the cache described by `config`, loading the previous run's
    /// archive if it is present and valid.
    pub fn open(config: CacheConfig) -> Result<Self, CacheError> {
        Self::with_stats(config, Arc::new(NoopStats))
    }

    /// Like `open`, reporting every lookup to `stats`
    pub fn with_stats(config: CacheConfig, stats: Arc<dyn StatsSink>) -> Result<Self, CacheError> {
        config.validate().map_err(CacheError::InvalidConfig)?;

        let shared = Arc::new(StoreShared {
            encoder: FrameEncoder::new(config.compression_level, config.chunk_size),
            config,
            stats,
            state: Mutex::new(StoreState::new()),
        });
        shared.load_archive(&mut shared.state.lock());

        let weak: Weak<StoreShared> = Arc::downgrade(&shared);
        let timer = DebounceTimer::spawn(TIMER_THREAD_NAME, shared.config.write_delay, move || {
            if let Some(shared) = weak.upgrade() {
                shared.on_write_timeout();
            }
        })?;

        Ok(Self {
            shared,
            timer: Some(timer),
        })
    }

    fn arm_write_timer(&self) {
        if let Some(timer) = &self.timer {
            timer.reset();
        }
    }

    /// True if `key` is in the table, whether or not its bytes are loaded
    pub fn has(&self, key: &str) -> bool {
        let mut state = self.shared.state.lock();
        self.shared.join_writer(&mut state);
        state.table.contains(key)
    }

    /// Bytes stored under `key`.
    ///
    /// The first successful request for a key in this run marks it for
    /// persistence and pushes the write-back out. A corrupt entry drops the
    /// whole cache, including the file, before the error is returned.
    pub fn get(&self, key: &str) -> Result<Arc<[u8]>, CacheError> {
        let (data, first_request) = {
            let mut state = self.shared.state.lock();
            self.shared.join_writer(&mut state);
            self.shared.lookup(&mut state, key)?
        };
        if first_request {
            self.arm_write_timer();
        }
        Ok(data)
    }

    /// Store `data` under `key`.
    ///
    /// Values are never replaced: putting an existing key logs and leaves
    /// the stored value alone.
    pub fn put(&self, key: &str, data: impl Into<Arc<[u8]>>) -> Result<(), CacheError> {
        let data: Arc<[u8]> = data.into();
        if key.len() > MAX_KEY_LEN {
            return Err(CacheError::KeyTooLong {
                len: key.len(),
                max: MAX_KEY_LEN,
            });
        }
        if data.len() as u64 > u32::MAX as u64 {
            return Err(CacheError::EntryTooLarge {
                size: data.len(),
                max: u32::MAX as u64,
            });
        }

        {
            let mut state = self.shared.state.lock();
            self.shared.join_writer(&mut state);
            if !state.table.insert_new(key, data) {
                warn!(key, "startup cache entry already exists; keeping stored value");
                return Ok(());
            }
            state.dirty = true;
        }
        self.arm_write_timer();
        Ok(())
    }

    /// Drop every entry and reload from disk.
    ///
    /// Unless `memory_only`, the archive file is removed first, so the
    /// reload comes back empty. Buffers already handed out stay valid.
    pub fn invalidate(&self, memory_only: bool) {
        let mut state = self.shared.state.lock();
        self.shared.invalidate_locked(&mut state, memory_only);
    }

    /// Run the write-back now instead of waiting for the timer.
    ///
    /// Returns `true` if an archive was written by this call.
    pub fn write_now(&self) -> bool {
        let mut state = self.shared.state.lock();
        self.shared.join_writer(&mut state);
        self.shared.start_write(&mut state) && self.shared.join_writer(&mut state) == Some(true)
    }

    /// Finish any running write and persist outstanding changes on the
    /// calling thread. Called automatically on drop.
    pub fn flush_and_wait_for_write_before_exit(&self) {
        let mut state = self.shared.state.lock();
        self.shared.write_synchronously(&mut state);
    }

    pub fn state(&self) -> CacheState {
        let mut state = self.shared.state.lock();
        self.shared.join_writer(&mut state);
        if state.written_once {
            CacheState::Written
        } else if state.dirty {
            CacheState::Dirty
        } else if state.archive.is_some() {
            CacheState::Loaded
        } else {
            CacheState::Empty
        }
    }

    pub fn len(&self) -> usize {
        self.shared.state.lock().table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shared.state.lock().table.is_empty()
    }

    /// Number of distinct keys requested this generation
    pub fn requested_count(&self) -> u32 {
        self.shared.state.lock().table.requested_count()
    }

    pub fn path(&self) -> &Path {
        self.shared.path()
    }

    pub fn config(&self) -> &CacheConfig {
        &self.shared.config
    }

    /// True while the on-disk archive is being ignored for this process
    pub fn is_ignoring_disk_cache(&self) -> bool {
        self.shared.state.lock().ignore_disk_cache
    }

    /// True if the write-back timer is armed
    pub fn is_write_pending(&self) -> bool {
        self.timer.as_ref().is_some_and(DebounceTimer::is_armed)
    }

    /// Time left before the armed write-back fires
    pub fn time_until_write(&self) -> Option<Duration> {
        self.timer.as_ref().and_then(DebounceTimer::time_until_fire)
    }

    /// Invalidated tables whose buffers are still held by callers
    pub fn retained_table_count(&self) -> usize {
        let mut state = self.shared.state.lock();
        state.retained.retain(RetainedTable::is_alive);
        state.retained.len()
    }

    pub fn memory_report(&self) -> MemoryReport {
        let mut state = self.shared.state.lock();
        state.retained.retain(RetainedTable::is_alive);
        MemoryReport {
            table_bytes: state.table.heap_size(),
            mapped_bytes: state.archive.as_ref().map_or(0, MappedArchive::mapped_len),
            retained_tables: state.retained.len(),
            retained_buffers: state.retained.iter().map(RetainedTable::live_buffers).sum(),
        }
    }
}

impl Drop for BlobStore {
    fn drop(&mut self) {
        // The timer thread may be waiting on the store lock
        if let Some(mut timer) = self.timer.take() {
            timer.shutdown();
        }
        self.flush_and_wait_for_write_before_exit();
    }
}

impl std::fmt::Debug for BlobStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlobStore")
            .field("path", &self.shared.config.path)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::CacheStats;
    use tempfile::TempDir;

    fn test_config(dir: &TempDir) -> CacheConfig {
        CacheConfig::new(dir.path().join("startupCache.bin"))
            .with_write_delay(Duration::from_secs(3600))
            .with_prefetch(false)
    }

    #[test]
    fn test_open_without_archive_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = BlobStore::open(test_config(&dir)).unwrap();
        assert_eq!(store.state(), CacheState::Empty);
        assert!(store.is_empty());
        assert!(!store.is_write_pending());
        assert!(store.time_until_write().is_none());
    }

    #[test]
    fn test_open_rejects_invalid_config() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(&dir).with_chunk_size(0);
        assert!(matches!(
            BlobStore::open(config),
            Err(CacheError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_put_then_get_from_memory() {
        let dir = tempfile::tempdir().unwrap();
        let stats = Arc::new(CacheStats::new());
        let store = BlobStore::with_stats(test_config(&dir), stats.clone()).unwrap();

        store.put("chrome://a.js", b"alpha".to_vec()).unwrap();
        assert!(store.has("chrome://a.js"));
        assert_eq!(store.state(), CacheState::Dirty);
        assert!(store.is_write_pending());
        assert!(store.time_until_write().unwrap() > Duration::from_secs(3500));

        let data = store.get("chrome://a.js").unwrap();
        assert_eq!(&*data, b"alpha");
        assert_eq!(stats.snapshot().hit_memory, 1);
    }

    #[test]
    fn test_get_missing_key() {
        let dir = tempfile::tempdir().unwrap();
        let stats = Arc::new(CacheStats::new());
        let store = BlobStore::with_stats(test_config(&dir), stats.clone()).unwrap();

        assert!(matches!(
            store.get("nope"),
            Err(CacheError::NotFound { .. })
        ));
        assert_eq!(stats.snapshot().miss, 1);
    }

    #[test]
    fn test_put_limits() {
        let dir = tempfile::tempdir().unwrap();
        let store = BlobStore::open(test_config(&dir)).unwrap();

        let key = "k".repeat(MAX_KEY_LEN + 1);
        assert!(matches!(
            store.put(&key, b"v".to_vec()),
            Err(CacheError::KeyTooLong { .. })
        ));
        assert!(!store.has(&key));

        let key = "k".repeat(MAX_KEY_LEN);
        store.put(&key, b"v".to_vec()).unwrap();
        assert!(store.has(&key));
    }

    #[test]
    fn test_write_now_persists_and_only_once() {
        let dir = tempfile::tempdir().unwrap();
        let store = BlobStore::open(test_config(&dir)).unwrap();
        store.put("a", b"1".to_vec()).unwrap();

        assert!(store.write_now());
        assert_eq!(store.state(), CacheState::Written);
        assert!(store.path().exists());

        store.put("b", b"2".to_vec()).unwrap();
        assert!(!store.write_now());
        assert_eq!(store.state(), CacheState::Written);
    }

    #[test]
    fn test_write_now_with_nothing_dirty() {
        let dir = tempfile::tempdir().unwrap();
        let store = BlobStore::open(test_config(&dir)).unwrap();
        assert!(!store.write_now());
        assert!(!store.path().exists());
    }

    #[test]
    fn test_memory_report() {
        let dir = tempfile::tempdir().unwrap();
        let store = BlobStore::open(test_config(&dir)).unwrap();
        store.put("a", vec![0u8; 1000]).unwrap();

        let report = store.memory_report();
        assert!(report.table_bytes >= 1000);
        assert_eq!(report.mapped_bytes, 0);
        assert_eq!(report.retained_tables, 0);
    }

    #[test]
    fn test_drop_flushes_dirty_table() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = BlobStore::open(test_config(&dir)).unwrap();
            store.put("a", b"persisted".to_vec()).unwrap();
        }

        let store = BlobStore::open(test_config(&dir)).unwrap();
        assert_eq!(store.state(), CacheState::Loaded);
        assert_eq!(&*store.get("a").unwrap(), b"persisted");
    }
}

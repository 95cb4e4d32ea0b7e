// SPDX-License-Identifier: MIT
//! In-memory entry table
//!
//! Maps keys to entry metadata and, once available, entry bytes. Tracks
//! which entries were requested during this run and in what order, which
//! decides both what gets persisted and where it lands on disk.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use crate::format::EntryRecord;
use crate::reader::FrameLocation;
use crate::writer::PendingEntry;

/// Fraction of entries that must be requested for an archive to count as
/// well utilized
pub const COMPACTION_THRESHOLD: f64 = 0.8;

/// One cached value
#[derive(Debug, Clone)]
pub struct Entry {
    /// Frame position in the mapped archive; `None` for entries put this run
    location: Option<FrameLocation>,
    uncompressed_size: u32,
    data: Option<Arc<[u8]>>,
    requested_order: Option<u32>,
}

impl Entry {
    fn from_record(record: &EntryRecord) -> Self {
        Self {
            location: Some(FrameLocation::from(record)),
            uncompressed_size: record.uncompressed_size,
            data: None,
            requested_order: None,
        }
    }

    pub fn location(&self) -> Option<FrameLocation> {
        self.location
    }

    pub fn uncompressed_size(&self) -> u32 {
        self.uncompressed_size
    }

    pub fn data(&self) -> Option<&Arc<[u8]>> {
        self.data.as_ref()
    }

    pub fn is_requested(&self) -> bool {
        self.requested_order.is_some()
    }

    pub fn requested_order(&self) -> Option<u32> {
        self.requested_order
    }

    /// Attach bytes decoded from disk
    pub fn set_data(&mut self, data: Arc<[u8]>) {
        self.data = Some(data);
    }

    /// True while a caller still holds a buffer handed out from this entry
    fn is_referenced(&self) -> bool {
        self.data
            .as_ref()
            .is_some_and(|data| Arc::strong_count(data) > 1)
    }
}

/// Key to entry mapping for the current generation
#[derive(Debug, Default)]
pub struct EntryTable {
    entries: HashMap<String, Entry>,
    requested_count: u32,
}

impl EntryTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a table of disk-resident entries from a parsed index
    pub fn from_records(records: &[EntryRecord]) -> Self {
        let entries = records
            .iter()
            .map(|record| (record.key.clone(), Entry::from_record(record)))
            .collect();
        Self {
            entries,
            requested_count: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn get(&self, key: &str) -> Option<&Entry> {
        self.entries.get(key)
    }

    pub fn get_mut(&mut self, key: &str) -> Option<&mut Entry> {
        self.entries.get_mut(key)
    }

    pub fn requested_count(&self) -> u32 {
        self.requested_count
    }

    /// Insert a brand-new, already requested entry.
    ///
    /// Returns `false` without touching the table if `key` exists; stored
    /// values are never replaced.
    pub fn insert_new(&mut self, key: &str, data: Arc<[u8]>) -> bool {
        if self.entries.contains_key(key) {
            return false;
        }
        self.requested_count += 1;
        let entry = Entry {
            location: None,
            uncompressed_size: data.len() as u32,
            data: Some(data),
            requested_order: Some(self.requested_count),
        };
        self.entries.insert(key.to_owned(), entry);
        true
    }

    /// Mark `key` requested, assigning the next order on first request.
    ///
    /// Returns `true` only the first time the entry is requested.
    pub fn mark_requested(&mut self, key: &str) -> bool {
        let Some(entry) = self.entries.get_mut(key) else {
            return false;
        };
        if entry.requested_order.is_some() {
            return false;
        }
        self.requested_count += 1;
        entry.requested_order = Some(self.requested_count);
        true
    }

    /// Whether the on-disk set was broad enough that rewriting only the
    /// requested subset is worthwhile
    pub fn should_compact(&self) -> bool {
        (self.requested_count as f64) < COMPACTION_THRESHOLD * self.entries.len() as f64
    }

    /// Requested entries with bytes, in ascending request order
    pub fn requested_entries(&self) -> Vec<PendingEntry> {
        let mut selected: Vec<(u32, &String, &Arc<[u8]>)> = self
            .entries
            .iter()
            .filter_map(|(key, entry)| {
                let order = entry.requested_order?;
                let data = entry.data.as_ref()?;
                Some((order, key, data))
            })
            .collect();
        selected.sort_unstable_by_key(|(order, _, _)| *order);
        selected
            .into_iter()
            .map(|(_, key, data)| PendingEntry {
                key: key.clone(),
                data: Arc::clone(data),
            })
            .collect()
    }

    /// Approximate heap bytes held by the table
    pub fn heap_size(&self) -> usize {
        self.entries
            .iter()
            .map(|(key, entry)| {
                key.capacity()
                    + std::mem::size_of::<Entry>()
                    + entry.data.as_ref().map_or(0, |d| d.len())
            })
            .sum()
    }

    /// Empty the table, returning a snapshot of the buffers callers still
    /// hold, if there are any.
    pub fn retire(&mut self, generation: u64) -> Option<RetainedTable> {
        let buffers: Vec<Weak<[u8]>> = self
            .entries
            .values()
            .filter(|entry| entry.is_referenced())
            .filter_map(|entry| entry.data.as_ref().map(Arc::downgrade))
            .collect();
        self.entries.clear();
        self.requested_count = 0;

        if buffers.is_empty() {
            None
        } else {
            Some(RetainedTable {
                generation,
                buffers,
            })
        }
    }
}

/// Buffers of an invalidated table that callers were still holding.
///
/// Lives only as long as at least one of those buffers does.
#[derive(Debug)]
pub struct RetainedTable {
    generation: u64,
    buffers: Vec<Weak<[u8]>>,
}

impl RetainedTable {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Buffers from this table still alive somewhere
    pub fn live_buffers(&self) -> usize {
        self.buffers.iter().filter(|b| b.strong_count() > 0).count()
    }

    pub fn is_alive(&self) -> bool {
        self.buffers.iter().any(|b| b.strong_count() > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn records(keys: &[&str]) -> Vec<EntryRecord> {
        keys.iter()
            .enumerate()
            .map(|(i, key)| EntryRecord {
                offset: i as u32 * 10,
                compressed_size: 10,
                uncompressed_size: 20,
                key: key.to_string(),
            })
            .collect()
    }

    #[test]
    fn test_from_records_is_disk_resident() {
        let table = EntryTable::from_records(&records(&["a", "b"]));
        assert_eq!(table.len(), 2);
        let entry = table.get("b").unwrap();
        assert_eq!(
            entry.location(),
            Some(FrameLocation {
                offset: 10,
                compressed_size: 10
            })
        );
        assert!(entry.data().is_none());
        assert!(!entry.is_requested());
    }

    #[test]
    fn test_insert_new_first_writer_wins() {
        let mut table = EntryTable::new();
        assert!(table.insert_new("k", Arc::from(&b"first"[..])));
        assert!(!table.insert_new("k", Arc::from(&b"second"[..])));

        let entry = table.get("k").unwrap();
        assert_eq!(&**entry.data().unwrap(), b"first");
        assert_eq!(entry.requested_order(), Some(1));
        assert_eq!(table.requested_count(), 1);
    }

    #[test]
    fn test_mark_requested_once() {
        let mut table = EntryTable::from_records(&records(&["a", "b"]));
        assert!(table.mark_requested("b"));
        assert!(!table.mark_requested("b"));
        assert!(table.mark_requested("a"));
        assert!(!table.mark_requested("missing"));

        assert_eq!(table.get("b").unwrap().requested_order(), Some(1));
        assert_eq!(table.get("a").unwrap().requested_order(), Some(2));
    }

    #[test]
    fn test_requested_entries_order_and_filter() {
        let mut table = EntryTable::from_records(&records(&["a", "b", "c"]));
        for key in ["c", "a"] {
            table.get_mut(key).unwrap().set_data(Arc::from(key.as_bytes()));
            table.mark_requested(key);
        }
        table.insert_new("d", Arc::from(&b"dd"[..]));

        let keys: Vec<String> = table.requested_entries().into_iter().map(|e| e.key).collect();
        assert_eq!(keys, ["c", "a", "d"]);
    }

    #[test]
    fn test_should_compact() {
        let keys: Vec<String> = (0..10).map(|i| format!("k{i}")).collect();
        let key_refs: Vec<&str> = keys.iter().map(String::as_str).collect();
        let mut table = EntryTable::from_records(&records(&key_refs));
        assert!(table.should_compact());

        for key in &key_refs[..7] {
            table.mark_requested(key);
        }
        assert!(table.should_compact());

        table.mark_requested(key_refs[7]);
        assert!(!table.should_compact());
    }

    #[test]
    fn test_empty_table_does_not_compact() {
        assert!(!EntryTable::new().should_compact());
    }

    #[test]
    fn test_retire_without_references() {
        let mut table = EntryTable::new();
        table.insert_new("k", Arc::from(&b"v"[..]));
        assert!(table.retire(1).is_none());
        assert!(table.is_empty());
        assert_eq!(table.requested_count(), 0);
    }

    #[test]
    fn test_retire_keeps_outstanding_buffers() {
        let mut table = EntryTable::new();
        table.insert_new("held", Arc::from(&b"held"[..]));
        table.insert_new("free", Arc::from(&b"free"[..]));
        let held = Arc::clone(table.get("held").unwrap().data().unwrap());

        let retained = table.retire(7).unwrap();
        assert_eq!(retained.generation(), 7);
        assert_eq!(retained.live_buffers(), 1);
        assert!(retained.is_alive());

        drop(held);
        assert!(!retained.is_alive());
    }
}

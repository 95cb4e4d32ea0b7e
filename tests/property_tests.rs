//! Property-based tests using proptest
//!
//! These tests generate many random inputs to check that archive parsing
//! never panics and that whatever the store persists comes back intact.

use proptest::prelude::*;
use std::collections::BTreeMap;
use std::io::Cursor;
use std::time::Duration;

use startup_cache::writer::write_contents;
use startup_cache::{
    parse_archive, BlobStore, CacheConfig, FrameDecoder, FrameEncoder, PendingEntry, ARCHIVE_MAGIC,
};

/// Strategy for generating cache keys shaped like resource URLs
fn key_strategy() -> impl Strategy<Value = String> {
    "(chrome|resource)://[a-z]{1,12}/[a-zA-Z0-9_./-]{0,40}"
}

/// Strategy for generating small entry payloads, empty ones included
fn value_strategy() -> impl Strategy<Value = Vec<u8>> {
    prop_oneof![
        Just(Vec::new()),
        prop::collection::vec(any::<u8>(), 1..512),
        // Highly compressible
        (any::<u8>(), 1usize..4096).prop_map(|(b, n)| vec![b; n]),
    ]
}

fn entries_strategy() -> impl Strategy<Value = BTreeMap<String, Vec<u8>>> {
    prop::collection::btree_map(key_strategy(), value_strategy(), 0..16)
}

proptest! {
    /// Arbitrary bytes never panic the parser
    #[test]
    fn parse_never_panics(bytes in prop::collection::vec(any::<u8>(), 0..256)) {
        let _ = parse_archive(&bytes);
    }

    /// Garbage after a valid magic is rejected or parsed, never panics
    #[test]
    fn parse_with_magic_never_panics(tail in prop::collection::vec(any::<u8>(), 0..256)) {
        let mut bytes = ARCHIVE_MAGIC.to_vec();
        bytes.extend_from_slice(&tail);
        if let Ok(index) = parse_archive(&bytes) {
            // Whatever parsed must describe frames inside the file
            let end = index.data_start as u64 + index.data_len();
            prop_assert!(end <= bytes.len() as u64);
        }
    }

    /// Every written entry decodes back to its original bytes
    #[test]
    fn written_archive_decodes(entries in entries_strategy()) {
        let pending: Vec<PendingEntry> = entries
            .iter()
            .map(|(k, v)| PendingEntry::new(k.clone(), v.clone()))
            .collect();
        let mut cursor = Cursor::new(Vec::new());
        write_contents(&mut cursor, &pending, &FrameEncoder::default()).unwrap();
        let bytes = cursor.into_inner();

        let index = parse_archive(&bytes).unwrap();
        prop_assert_eq!(index.records.len(), entries.len());

        let data = &bytes[index.data_start..];
        let mut decoder = FrameDecoder::new().unwrap();
        for (record, entry) in index.records.iter().zip(&pending) {
            prop_assert_eq!(&record.key, &entry.key);
            let start = record.offset as usize;
            let frame = &data[start..start + record.compressed_size as usize];
            let decoded = decoder.decode_frame(frame, record.uncompressed_size as usize).unwrap();
            prop_assert_eq!(&decoded[..], &*entry.data);
        }
    }

    /// Flipping any single data byte never yields wrong bytes silently
    #[test]
    fn corrupted_frame_is_detected(value in prop::collection::vec(any::<u8>(), 16..256), flip in any::<prop::sample::Index>()) {
        let mut cursor = Cursor::new(Vec::new());
        write_contents(&mut cursor, &[PendingEntry::new("k", value.clone())], &FrameEncoder::default()).unwrap();
        let mut bytes = cursor.into_inner();

        let index = parse_archive(&bytes).unwrap();
        let record = &index.records[0];
        let position = index.data_start + flip.index(record.compressed_size as usize);
        bytes[position] ^= 0xFF;

        let frame = &bytes[index.data_start..];
        let mut decoder = FrameDecoder::new().unwrap();
        if let Ok(decoded) = decoder.decode_frame(frame, record.uncompressed_size as usize) {
            prop_assert_eq!(decoded, value);
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    /// Entries put in one run are all readable in the next
    #[test]
    fn store_persists_across_runs(entries in entries_strategy()) {
        let dir = tempfile::tempdir().unwrap();
        let config = CacheConfig::new(dir.path().join("startupCache.bin"))
            .with_write_delay(Duration::from_secs(3600))
            .with_prefetch(false);

        {
            let store = BlobStore::open(config.clone()).unwrap();
            for (key, value) in &entries {
                store.put(key, value.clone()).unwrap();
            }
        }

        let store = BlobStore::open(config).unwrap();
        prop_assert_eq!(store.len(), entries.len());
        for (key, value) in &entries {
            let data = store.get(key).unwrap();
            prop_assert_eq!(&*data, value.as_slice());
        }
    }
}

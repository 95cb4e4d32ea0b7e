// SPDX-License-Identifier: MIT
//! Startup cache archive format
//!
//! Defines the on-disk layout of the archive and the single bounds-checking
//! routine shared by the parse path and the read path.
//!
//! ```text
//! [16 bytes]  magic "STARTUPCACHE0001"
//! [4 bytes]   header length N (u32, little-endian)
//! [N bytes]   header records:
//!               offset:u32, compressed_size:u32, uncompressed_size:u32,
//!               key_len:u16, key: key_len bytes of UTF-8
//! [rest]      data region: back-to-back zstd frames, one per record
//! ```

use std::collections::HashSet;
use std::io::Write;
use std::ops::Range;

/// Archive magic bytes
pub const ARCHIVE_MAGIC: &[u8; 16] = b"STARTUPCACHE0001";

/// Size of the header length field that follows the magic
pub const HEADER_LEN_FIELD_SIZE: usize = 4;

/// Bytes preceding the header records
pub const PREAMBLE_SIZE: usize = ARCHIVE_MAGIC.len() + HEADER_LEN_FIELD_SIZE;

/// Longest key a record can carry
pub const MAX_KEY_LEN: usize = u16::MAX as usize;

/// Structural problems found while parsing or addressing an archive.
///
/// Every variant means the file must be treated as absent.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FormatError {
    #[error("archive too small: {len} bytes")]
    TooSmall { len: usize },

    #[error("invalid magic bytes")]
    BadMagic,

    #[error("header length {header_len} exceeds available {available} bytes")]
    HeaderOutOfBounds { header_len: usize, available: usize },

    #[error("record truncated at header position {position}")]
    TruncatedRecord { position: usize },

    #[error("key at header position {position} is not valid UTF-8")]
    InvalidKey { position: usize },

    #[error("duplicate key {key:?}")]
    DuplicateKey { key: String },

    #[error("entry {key:?} starts at {actual}, expected {expected}")]
    NonContiguous {
        key: String,
        expected: u64,
        actual: u64,
    },

    #[error("span {offset}+{len} exceeds region of {bound} bytes")]
    OutOfBounds { offset: u64, len: u64, bound: usize },
}

/// Validate `offset..offset + len` against a region of `bound` bytes.
///
/// Both the archive parser and the entry read path go through here; nothing
/// else slices the mapped file.
#[inline]
pub fn checked_range(offset: u64, len: u64, bound: usize) -> Result<Range<usize>, FormatError> {
    let out_of_bounds = || FormatError::OutOfBounds { offset, len, bound };
    let end = offset.checked_add(len).ok_or_else(out_of_bounds)?;
    if end > bound as u64 {
        return Err(out_of_bounds());
    }
    Ok(offset as usize..end as usize)
}

/// One header record describing an entry in the data region.
///
/// `offset` is relative to the start of the data region, not the file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryRecord {
    pub offset: u32,
    pub compressed_size: u32,
    pub uncompressed_size: u32,
    pub key: String,
}

impl EntryRecord {
    /// Fixed bytes per record before the key bytes
    pub const FIXED_SIZE: usize = 4 + 4 + 4 + 2;

    /// Record for an entry whose frame has not been written yet
    pub fn placeholder(key: impl Into<String>, uncompressed_size: u32) -> Self {
        Self {
            offset: 0,
            compressed_size: 0,
            uncompressed_size,
            key: key.into(),
        }
    }

    /// Encoded size of this record
    #[inline]
    pub fn encoded_len(&self) -> usize {
        Self::FIXED_SIZE + self.key.len()
    }

    /// Write the record. Callers guarantee `key.len() <= MAX_KEY_LEN`.
    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<(), std::io::Error> {
        let key_len = u16::try_from(self.key.len()).map_err(|_| {
            std::io::Error::new(std::io::ErrorKind::InvalidInput, "key too long")
        })?;
        writer.write_all(&self.offset.to_le_bytes())?;
        writer.write_all(&self.compressed_size.to_le_bytes())?;
        writer.write_all(&self.uncompressed_size.to_le_bytes())?;
        writer.write_all(&key_len.to_le_bytes())?;
        writer.write_all(self.key.as_bytes())?;
        Ok(())
    }

    /// Decode one record at `*position`, advancing it past the record.
    pub fn decode(header: &[u8], position: &mut usize) -> Result<Self, FormatError> {
        let start = *position;
        let truncated = || FormatError::TruncatedRecord { position: start };

        let fixed = header
            .get(start..start + Self::FIXED_SIZE)
            .ok_or_else(truncated)?;
        let offset = read_u32(&fixed[0..4]);
        let compressed_size = read_u32(&fixed[4..8]);
        let uncompressed_size = read_u32(&fixed[8..12]);
        let key_len = u16::from_le_bytes([fixed[12], fixed[13]]) as usize;

        let key_start = start + Self::FIXED_SIZE;
        let key_bytes = header
            .get(key_start..key_start + key_len)
            .ok_or_else(truncated)?;
        let key = std::str::from_utf8(key_bytes)
            .map_err(|_| FormatError::InvalidKey { position: start })?
            .to_owned();

        *position = key_start + key_len;
        Ok(Self {
            offset,
            compressed_size,
            uncompressed_size,
            key,
        })
    }
}

#[inline]
fn read_u32(bytes: &[u8]) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(bytes);
    u32::from_le_bytes(buf)
}

/// Parsed archive index; no entry bytes are decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveIndex {
    /// Records in file order
    pub records: Vec<EntryRecord>,

    /// Byte offset of the data region from the start of the file
    pub data_start: usize,
}

impl ArchiveIndex {
    /// Length of the data region described by the records
    pub fn data_len(&self) -> u64 {
        self.records
            .iter()
            .map(|r| r.compressed_size as u64)
            .sum()
    }
}

/// Parse and validate an archive image.
///
/// Any violation discards everything parsed so far.
pub fn parse_archive(bytes: &[u8]) -> Result<ArchiveIndex, FormatError> {
    if bytes.len() < PREAMBLE_SIZE {
        return Err(FormatError::TooSmall { len: bytes.len() });
    }
    if &bytes[..ARCHIVE_MAGIC.len()] != ARCHIVE_MAGIC {
        return Err(FormatError::BadMagic);
    }

    let header_len = read_u32(&bytes[ARCHIVE_MAGIC.len()..PREAMBLE_SIZE]) as usize;
    let header_range = checked_range(PREAMBLE_SIZE as u64, header_len as u64, bytes.len())
        .map_err(|_| FormatError::HeaderOutOfBounds {
            header_len,
            available: bytes.len() - PREAMBLE_SIZE,
        })?;
    let data_start = header_range.end;
    let header = &bytes[header_range];
    let data_len = bytes.len() - data_start;

    let mut records = Vec::new();
    let mut seen = HashSet::new();
    let mut position = 0;
    let mut expected_offset: u64 = 0;

    while position < header.len() {
        let record = EntryRecord::decode(header, &mut position)?;

        if record.offset as u64 != expected_offset {
            return Err(FormatError::NonContiguous {
                key: record.key,
                expected: expected_offset,
                actual: record.offset as u64,
            });
        }
        checked_range(
            record.offset as u64,
            record.compressed_size as u64,
            data_len,
        )?;
        if !seen.insert(record.key.clone()) {
            return Err(FormatError::DuplicateKey { key: record.key });
        }

        expected_offset += record.compressed_size as u64;
        records.push(record);
    }

    Ok(ArchiveIndex {
        records,
        data_start,
    })
}

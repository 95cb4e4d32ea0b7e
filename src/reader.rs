// SPDX-License-Identifier: MIT
//! Memory-mapped archive reader

use std::fs::File;
use std::path::Path;
use std::sync::Arc;

use memmap2::Mmap;

use crate::format::{checked_range, parse_archive, ArchiveIndex, EntryRecord, FormatError, PREAMBLE_SIZE};

/// Errors that can occur while opening an archive
#[derive(Debug, thiserror::Error)]
pub enum ReadError {
    #[error("archive not found")]
    Missing,

    #[error("corrupt archive: {0}")]
    Corrupt(#[from] FormatError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Location of one entry's frame inside the data region
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameLocation {
    pub offset: u32,
    pub compressed_size: u32,
}

impl From<&EntryRecord> for FrameLocation {
    fn from(record: &EntryRecord) -> Self {
        Self {
            offset: record.offset,
            compressed_size: record.compressed_size,
        }
    }
}

/// A validated archive mapped read-only into memory.
///
/// The mapping is reference counted so a prefetch worker can walk it while
/// the owner keeps serving reads.
#[derive(Debug)]
pub struct MappedArchive {
    mmap: Arc<Mmap>,
    data_start: usize,
}

impl MappedArchive {
    /// Map and validate the archive at `path`, returning it with its index.
    pub fn open(path: &Path) -> Result<(Self, Vec<EntryRecord>), ReadError> {
        let file = match File::open(path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Err(ReadError::Missing),
            Err(e) => return Err(ReadError::Io(e)),
        };

        // Zero-length maps are rejected on some platforms
        let len = file.metadata()?.len() as usize;
        if len < PREAMBLE_SIZE {
            return Err(FormatError::TooSmall { len }.into());
        }

        // SAFETY: the archive is only replaced by rename, never written in place
        let mmap = unsafe { Mmap::map(&file)? };
        let ArchiveIndex {
            records,
            data_start,
        } = parse_archive(&mmap)?;

        Ok((
            Self {
                mmap: Arc::new(mmap),
                data_start,
            },
            records,
        ))
    }

    /// Bytes of the data region
    #[inline]
    pub fn data(&self) -> &[u8] {
        &self.mmap[self.data_start..]
    }

    /// Compressed frame for an entry, bounds-checked against the data region
    pub fn frame(&self, location: FrameLocation) -> Result<&[u8], FormatError> {
        let data = self.data();
        let range = checked_range(
            location.offset as u64,
            location.compressed_size as u64,
            data.len(),
        )?;
        Ok(&data[range])
    }

    /// Shared handle to the whole mapping
    pub fn mapping(&self) -> Arc<Mmap> {
        Arc::clone(&self.mmap)
    }

    /// Size of the mapped file
    pub fn mapped_len(&self) -> usize {
        self.mmap.len()
    }
}

// SPDX-License-Identifier: MIT
//! Archive writer
//!
//! Serializes the requested entries into a fresh archive. The header is
//! written first with placeholder offsets, frames are streamed after it, and
//! the header is rewritten once every frame's position and length is known.

use std::fs::{self, File};
use std::io::{BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, warn};
use uuid::Uuid;

use crate::codec::{CodecError, FrameEncoder};
use crate::format::{EntryRecord, ARCHIVE_MAGIC, MAX_KEY_LEN};

/// Errors that can occur during writing
#[derive(Debug, thiserror::Error)]
pub enum WriteError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Compression error: {0}")]
    Compression(#[from] CodecError),

    #[error("Archive too large: {0}")]
    TooLarge(String),

    #[error("Invalid entry: {0}")]
    InvalidEntry(String),
}

/// An entry selected for persistence, already in final on-disk order
#[derive(Debug, Clone)]
pub struct PendingEntry {
    pub key: String,
    pub data: Arc<[u8]>,
}

impl PendingEntry {
    pub fn new(key: impl Into<String>, data: impl Into<Arc<[u8]>>) -> Self {
        Self {
            key: key.into(),
            data: data.into(),
        }
    }
}

/// Outcome of a completed write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteSummary {
    pub entries: usize,
    pub header_len: u32,
    pub data_len: u64,
    pub uncompressed_len: u64,
}

impl WriteSummary {
    /// Total archive size in bytes
    pub fn file_len(&self) -> u64 {
        (ARCHIVE_MAGIC.len() + 4) as u64 + self.header_len as u64 + self.data_len
    }
}

/// Write `entries` to `path`, replacing any existing archive.
///
/// The archive is built in a sibling temp file and renamed into place, so a
/// failure leaves the previous file untouched.
pub fn write_archive(
    path: &Path,
    entries: &[PendingEntry],
    encoder: &FrameEncoder,
) -> Result<WriteSummary, WriteError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }

    let temp_path = temp_path_for(path);
    debug!(path = %temp_path.display(), entries = entries.len(), "writing archive to temp file");

    let result = (|| {
        let mut out = BufWriter::new(File::create(&temp_path)?);
        let summary = write_contents(&mut out, entries, encoder)?;
        let file = out.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()?;
        Ok::<_, WriteError>(summary)
    })();

    let summary = match result {
        Ok(summary) => summary,
        Err(e) => {
            warn!(path = %temp_path.display(), error = %e, "archive write failed");
            // Best effort cleanup
            let _ = fs::remove_file(&temp_path);
            return Err(e);
        }
    };

    if let Err(e) = fs::rename(&temp_path, path) {
        let _ = fs::remove_file(&temp_path);
        return Err(WriteError::Io(e));
    }

    Ok(summary)
}

fn temp_path_for(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "startup-cache".to_string());
    path.with_file_name(format!(".{}.{}.tmp", name, Uuid::new_v4()))
}

/// Serialize an archive into any seekable sink positioned at its start.
pub fn write_contents<W: Write + Seek>(
    out: &mut W,
    entries: &[PendingEntry],
    encoder: &FrameEncoder,
) -> Result<WriteSummary, WriteError> {
    let mut records = Vec::with_capacity(entries.len());
    for entry in entries {
        if entry.key.len() > MAX_KEY_LEN {
            return Err(WriteError::InvalidEntry(format!(
                "key of {} bytes exceeds {}",
                entry.key.len(),
                MAX_KEY_LEN
            )));
        }
        let size = u32::try_from(entry.data.len()).map_err(|_| {
            WriteError::TooLarge(format!("entry {:?} is {} bytes", entry.key, entry.data.len()))
        })?;
        records.push(EntryRecord::placeholder(entry.key.as_str(), size));
    }

    let header_len: usize = records.iter().map(EntryRecord::encoded_len).sum();
    let header_len = u32::try_from(header_len)
        .map_err(|_| WriteError::TooLarge(format!("header of {} bytes", header_len)))?;

    out.write_all(ARCHIVE_MAGIC)?;
    out.write_all(&header_len.to_le_bytes())?;
    let header_start = out.stream_position()?;
    for record in &records {
        record.write_to(out)?;
    }

    let mut offset: u64 = 0;
    let mut uncompressed_len: u64 = 0;
    for (record, entry) in records.iter_mut().zip(entries) {
        let frame_len = encoder.encode_frame(&entry.data, &mut *out)?;
        record.offset = u32::try_from(offset)
            .map_err(|_| WriteError::TooLarge(format!("data region passes {} bytes", u32::MAX)))?;
        record.compressed_size = u32::try_from(frame_len)
            .map_err(|_| WriteError::TooLarge(format!("frame for {:?}", entry.key)))?;
        offset += frame_len;
        uncompressed_len += entry.data.len() as u64;
    }
    if offset > u32::MAX as u64 {
        return Err(WriteError::TooLarge(format!("data region of {} bytes", offset)));
    }

    out.seek(SeekFrom::Start(header_start))?;
    for record in &records {
        record.write_to(out)?;
    }
    out.seek(SeekFrom::End(0))?;
    out.flush()?;

    Ok(WriteSummary {
        entries: records.len(),
        header_len,
        data_len: offset,
        uncompressed_len,
    })
}

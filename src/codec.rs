// SPDX-License-Identifier: MIT
//! Per-entry zstd framing
//!
//! Every entry is compressed into its own independent zstd frame so any one
//! entry can be decoded without its neighbours. Decoding reuses a single
//! decompression context for the life of the store.

use std::io::Write;

use zstd::stream::raw::{Decoder, InBuffer, Operation, OutBuffer};

/// Default zstd level for new frames
pub const DEFAULT_COMPRESSION_LEVEL: i32 = 3;

/// Default amount of uncompressed input fed to the encoder per call
pub const DEFAULT_CHUNK_SIZE: usize = 128 * 1024;

/// Errors that can occur while encoding or decoding a frame
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Decompression error: {0}")]
    Decompression(String),

    #[error("Frame decoded to {actual} bytes, expected {expected}")]
    LengthMismatch { expected: usize, actual: usize },

    #[error("Frame has {trailing} trailing bytes")]
    TrailingData { trailing: usize },
}

/// Writer adapter that counts bytes passed through
struct CountingWriter<W> {
    inner: W,
    written: u64,
}

impl<W: Write> Write for CountingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

/// Frame compressor settings
#[derive(Debug, Clone, Copy)]
pub struct FrameEncoder {
    level: i32,
    chunk_size: usize,
}

impl FrameEncoder {
    pub fn new(level: i32, chunk_size: usize) -> Self {
        Self {
            level,
            chunk_size: chunk_size.max(1),
        }
    }

    /// Compress `data` into one complete frame written to `out`.
    ///
    /// Input is fed in `chunk_size` pieces to cap the encoder's working set.
    /// Returns the number of bytes the frame occupies in `out`.
    pub fn encode_frame<W: Write>(&self, data: &[u8], out: W) -> Result<u64, CodecError> {
        let counter = CountingWriter {
            inner: out,
            written: 0,
        };
        let mut encoder = zstd::stream::write::Encoder::new(counter, self.level)?;
        encoder.include_checksum(true)?;
        encoder.set_pledged_src_size(Some(data.len() as u64))?;

        for chunk in data.chunks(self.chunk_size) {
            encoder.write_all(chunk)?;
        }

        let counter = encoder.finish()?;
        Ok(counter.written)
    }
}

impl Default for FrameEncoder {
    fn default() -> Self {
        Self::new(DEFAULT_COMPRESSION_LEVEL, DEFAULT_CHUNK_SIZE)
    }
}

/// Long-lived decompression context
pub struct FrameDecoder {
    context: Decoder<'static>,
    frames_decoded: u64,
}

impl FrameDecoder {
    pub fn new() -> Result<Self, CodecError> {
        Ok(Self {
            context: Decoder::new()?,
            frames_decoded: 0,
        })
    }

    /// Number of frames decoded through this context
    pub fn frames_decoded(&self) -> u64 {
        self.frames_decoded
    }

    /// Decode exactly one frame that must expand to `expected_len` bytes.
    ///
    /// The frame header's declared content size must agree with
    /// `expected_len` before any output buffer is allocated.
    pub fn decode_frame(&mut self, frame: &[u8], expected_len: usize) -> Result<Vec<u8>, CodecError> {
        check_content_size(frame, expected_len)?;
        self.context.reinit()?;

        let mut output = vec![0u8; expected_len];
        let mut input = InBuffer::around(frame);
        let mut out = OutBuffer::around(output.as_mut_slice());

        loop {
            let before = (input.pos(), out.pos());
            let remaining = self
                .context
                .run(&mut input, &mut out)
                .map_err(|e| CodecError::Decompression(e.to_string()))?;
            if remaining == 0 {
                break;
            }
            if (input.pos(), out.pos()) == before {
                // Input exhausted or output full before the frame ended
                return Err(CodecError::Decompression(format!(
                    "frame stalled: input {}/{} consumed, output {}/{} filled",
                    input.pos(),
                    frame.len(),
                    out.pos(),
                    expected_len
                )));
            }
        }

        let written = out.pos();
        let consumed = input.pos();
        drop(out);

        if written != expected_len {
            return Err(CodecError::LengthMismatch {
                expected: expected_len,
                actual: written,
            });
        }
        if consumed != frame.len() {
            return Err(CodecError::TrailingData {
                trailing: frame.len() - consumed,
            });
        }

        self.frames_decoded += 1;
        Ok(output)
    }
}

fn check_content_size(frame: &[u8], expected_len: usize) -> Result<(), CodecError> {
    let declared = zstd::zstd_safe::get_frame_content_size(frame)
        .map_err(|_| CodecError::Decompression("unreadable frame header".to_string()))?;
    match declared {
        Some(size) if size == expected_len as u64 => Ok(()),
        Some(size) => Err(CodecError::LengthMismatch {
            expected: expected_len,
            actual: usize::try_from(size).unwrap_or(usize::MAX),
        }),
        None if expected_len == 0 => Ok(()),
        None => Err(CodecError::Decompression(
            "frame does not declare its content size".to_string(),
        )),
    }
}

impl std::fmt::Debug for FrameDecoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameDecoder")
            .field("frames_decoded", &self.frames_decoded)
            .finish()
    }
}

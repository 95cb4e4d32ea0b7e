// SPDX-License-Identifier: MIT
//! Background page-cache warming for the mapped archive

use std::hint::black_box;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;

use memmap2::Mmap;
use tracing::{debug, error};

/// Stride used when touching the mapping
pub const PAGE_SIZE: usize = 4096;

/// Read one byte from every page of `bytes`, returning the number of pages
/// touched
pub fn touch_pages(bytes: &[u8]) -> usize {
    let mut sink = 0u8;
    let mut pages = 0;
    for offset in (0..bytes.len()).step_by(PAGE_SIZE) {
        sink ^= bytes[offset];
        pages += 1;
    }
    black_box(sink);
    pages
}

/// Read-only worker that faults in every page of a mapping.
///
/// Holds its own reference to the mapping and never touches the table. Must
/// be joined before the owner releases the mapping.
pub struct PrefetchWorker {
    handle: Option<JoinHandle<usize>>,
}

impl PrefetchWorker {
    pub fn spawn(mapping: Arc<Mmap>) -> std::io::Result<Self> {
        let handle = std::thread::Builder::new()
            .name("startup-cache-prefetch".to_string())
            .spawn(move || {
                let started = Instant::now();
                let pages = touch_pages(&mapping);
                debug!(
                    pages,
                    bytes = mapping.len(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "prefetched archive"
                );
                pages
            })?;
        Ok(Self {
            handle: Some(handle),
        })
    }

    /// Wait for the worker, returning the pages it touched
    pub fn join(&mut self) -> Option<usize> {
        let handle = self.handle.take()?;
        match handle.join() {
            Ok(pages) => Some(pages),
            Err(_) => {
                error!("prefetch worker panicked");
                None
            }
        }
    }
}

impl Drop for PrefetchWorker {
    fn drop(&mut self) {
        self.join();
    }
}

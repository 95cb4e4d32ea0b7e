// SPDX-License-Identifier: MIT
use std::path::PathBuf;

use anyhow::{bail, Context};
use clap::Parser;
use serde::Serialize;
use startup_cache::reader::FrameLocation;
use startup_cache::{FrameDecoder, MappedArchive};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// List and optionally verify the entries of a startup cache archive
#[derive(Parser)]
struct Cli {
    /// Archive to inspect
    path: PathBuf,

    /// Decompress every frame and check its length
    #[arg(long)]
    verify: bool,

    /// Print the report as JSON
    #[arg(long)]
    json: bool,
}

#[derive(Serialize)]
struct EntryReport {
    key: String,
    offset: u32,
    compressed_size: u32,
    uncompressed_size: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    verified: Option<bool>,
}

#[derive(Serialize)]
struct ArchiveReport {
    path: PathBuf,
    file_size: usize,
    entries: Vec<EntryReport>,
    total_compressed: u64,
    total_uncompressed: u64,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let cli = Cli::parse();

    let (archive, records) = MappedArchive::open(&cli.path)
        .with_context(|| format!("failed to open {}", cli.path.display()))?;
    info!(entries = records.len(), "archive parsed");

    let mut decoder = if cli.verify {
        Some(FrameDecoder::new().context("failed to create decompression context")?)
    } else {
        None
    };

    let mut failures = 0usize;
    let mut entries = Vec::with_capacity(records.len());
    for record in &records {
        let verified = decoder.as_mut().map(|decoder| {
            let result = archive
                .frame(FrameLocation::from(record))
                .map_err(anyhow::Error::from)
                .and_then(|frame| {
                    decoder
                        .decode_frame(frame, record.uncompressed_size as usize)
                        .map_err(anyhow::Error::from)
                });
            match result {
                Ok(_) => true,
                Err(e) => {
                    warn!(key = %record.key, error = %e, "entry failed verification");
                    failures += 1;
                    false
                }
            }
        });
        entries.push(EntryReport {
            key: record.key.clone(),
            offset: record.offset,
            compressed_size: record.compressed_size,
            uncompressed_size: record.uncompressed_size,
            verified,
        });
    }

    let report = ArchiveReport {
        path: cli.path.clone(),
        file_size: archive.mapped_len(),
        total_compressed: entries.iter().map(|e| e.compressed_size as u64).sum(),
        total_uncompressed: entries.iter().map(|e| e.uncompressed_size as u64).sum(),
        entries,
    };

    if cli.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("Archive: {}", report.path.display());
        println!("File size: {} bytes", report.file_size);
        println!("Entries: {}", report.entries.len());
        for entry in &report.entries {
            let status = match entry.verified {
                Some(true) => " ok",
                Some(false) => " CORRUPT",
                None => "",
            };
            println!(
                "  {:>10} {:>10} -> {:>10}  {}{}",
                entry.offset, entry.compressed_size, entry.uncompressed_size, entry.key, status
            );
        }
        println!(
            "Total: {} compressed, {} uncompressed",
            report.total_compressed, report.total_uncompressed
        );
    }

    if failures > 0 {
        bail!("{} of {} entries failed verification", failures, records.len());
    }
    Ok(())
}

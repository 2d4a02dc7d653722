//! Archive extraction.
//!
//! Vendor windows arrive as one tar archive (optionally gzipped, possibly
//! uploaded in several parts that concatenate into one file). Extraction
//! streams each contained CSV into its own staged object in bounded
//! chunks; the vendor's manifest and metadata entries are small and are
//! captured in memory so the producer can normalize them and write the
//! manifest last.

use std::io::{BufRead, BufReader, Read};

use flate2::read::GzDecoder;
use tar::Archive;
use tracing::debug;

use lode_staging::{MultipartWriter, StagingStore, WindowPrefix, CHUNK_SIZE};

use crate::ProducerError;

/// One data file extracted from the archive.
#[derive(Debug, Clone, PartialEq)]
pub struct DataFile {
    /// File name, relative to the window prefix.
    pub name: String,
    /// Data rows (newline count minus the header).
    pub rows: u64,
}

/// What extraction found in the archive.
#[derive(Debug, Default)]
pub struct ExtractSummary {
    /// Staged data files.
    pub data_files: Vec<DataFile>,
    /// The archive's own manifest entry, if present.
    pub vendor_manifest: Option<Vec<u8>>,
    /// The archive's metadata entry (`metadata.csv` / `metadata_full.csv`).
    pub metadata: Option<Vec<u8>>,
}

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

fn archive_err(e: impl std::fmt::Display) -> ProducerError {
    ProducerError::Archive(e.to_string())
}

fn is_manifest_name(name: &str) -> bool {
    matches!(name, "manifest.csv" | "log_manifest.csv" | "full_manifest.csv")
}

fn is_metadata_name(name: &str) -> bool {
    matches!(name, "metadata.csv" | "metadata_full.csv")
}

/// Extract the staged archive at `archive_key` into individual objects
/// under the window prefix.
pub async fn extract_window(
    staging: &dyn StagingStore,
    window: &WindowPrefix,
    archive_key: &str,
) -> Result<ExtractSummary, ProducerError> {
    let reader = staging
        .open_read(archive_key)
        .await
        .map_err(|e| ProducerError::Staging(e.to_string()))?
        .ok_or_else(|| archive_err(format!("archive missing at {archive_key}")))?;

    let mut buffered = BufReader::new(reader);
    let gzipped = buffered
        .fill_buf()
        .map_err(archive_err)?
        .starts_with(&GZIP_MAGIC);
    let reader: Box<dyn Read + Send> = if gzipped {
        Box::new(GzDecoder::new(buffered))
    } else {
        Box::new(buffered)
    };

    let mut archive = Archive::new(reader);
    let mut summary = ExtractSummary::default();
    for entry in archive.entries().map_err(archive_err)? {
        let mut entry = entry.map_err(archive_err)?;
        if !entry.header().entry_type().is_file() {
            continue;
        }
        let name = {
            let path = entry.path().map_err(archive_err)?;
            path.file_name()
                .and_then(|n| n.to_str())
                .map(str::to_string)
                .ok_or_else(|| archive_err("archive entry without a usable name"))?
        };

        if is_manifest_name(&name) {
            let mut bytes = Vec::new();
            entry.read_to_end(&mut bytes).map_err(archive_err)?;
            summary.vendor_manifest = Some(bytes);
        } else if is_metadata_name(&name) {
            let mut bytes = Vec::new();
            entry.read_to_end(&mut bytes).map_err(archive_err)?;
            summary.metadata = Some(bytes);
        } else if name.ends_with(".csv") {
            let key = window.data_key(&name);
            let writer = staging
                .start_multipart(&key)
                .await
                .map_err(|e| ProducerError::Staging(e.to_string()))?;
            let rows = pump_entry(&mut entry, writer).await?;
            summary.data_files.push(DataFile { name, rows });
        } else {
            debug!(entry = %name, "skipping non-csv archive entry");
        }
    }
    Ok(summary)
}

/// Stream one archive entry into a staged object, counting data rows.
async fn pump_entry(
    entry: &mut (impl Read + ?Sized),
    mut writer: Box<dyn MultipartWriter>,
) -> Result<u64, ProducerError> {
    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut newlines = 0u64;
    let mut last_byte = None;
    loop {
        let n = match entry.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                let _ = writer.abort().await;
                return Err(archive_err(e));
            }
        };
        newlines += buf[..n].iter().filter(|b| **b == b'\n').count() as u64;
        last_byte = Some(buf[n - 1]);
        if let Err(e) = writer.write_chunk(&buf[..n]).await {
            let _ = writer.abort().await;
            return Err(ProducerError::Staging(e.to_string()));
        }
    }
    writer
        .complete()
        .await
        .map_err(|e| ProducerError::Staging(e.to_string()))?;
    // A non-empty final line without a trailing newline is still a line.
    let mut lines = newlines;
    if matches!(last_byte, Some(b) if b != b'\n') {
        lines += 1;
    }
    // Minus the header.
    Ok(lines.saturating_sub(1))
}

//! Vendor feed contract.
//!
//! The real vendor API client lives outside the core; this module pins
//! down the interface the producer drives it through, plus a
//! directory-backed implementation for demos and tests.

use std::path::PathBuf;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::io::AsyncReadExt;

use lode_staging::CHUNK_SIZE;
use lode_types::{LoadType, StopTime};

/// One available window as advertised by the vendor.
#[derive(Debug, Clone, PartialEq)]
pub struct WindowDescriptor {
    /// Window family.
    pub load_type: LoadType,
    /// Vendor-assigned stop-time.
    pub logical_time: StopTime,
    /// Total data rows across the window; zero-row windows are skipped.
    pub row_count: u64,
    /// Opaque part identifiers, in concatenation order.
    pub parts: Vec<String>,
}

/// Chunked byte stream of one archive part.
#[async_trait]
pub trait PartStream: Send {
    /// Next chunk, or `None` at end of part.
    async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>>;
}

/// The vendor "Direct Data" feed.
#[async_trait]
pub trait VendorFeed: Send + Sync {
    /// Windows available strictly-after `from` (all windows when `None`),
    /// in no particular order.
    async fn list_windows(
        &self,
        load_type: LoadType,
        from: Option<StopTime>,
    ) -> Result<Vec<WindowDescriptor>>;

    /// Open one part of a window's archive for streaming.
    async fn fetch_part(
        &self,
        window: &WindowDescriptor,
        part: &str,
    ) -> Result<Box<dyn PartStream>>;
}

//─────────────────────────────
//  Directory-backed feed
//─────────────────────────────

/// Feed reading pre-built window archives from a local directory tree:
///
/// ```text
/// <root>/<load_type>/<logical_time_key>.tar[.gz]
/// <root>/<load_type>/<logical_time_key>.rowcount   (optional sidecar)
/// ```
///
/// Without a sidecar the row count defaults to 1 so the window is not
/// dropped as empty.
#[derive(Debug, Clone)]
pub struct DirectoryFeed {
    root: PathBuf,
}

impl DirectoryFeed {
    /// Build a feed over `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn archive_path(&self, window: &WindowDescriptor, part: &str) -> PathBuf {
        self.root.join(window.load_type.token()).join(part)
    }
}

#[async_trait]
impl VendorFeed for DirectoryFeed {
    async fn list_windows(
        &self,
        load_type: LoadType,
        from: Option<StopTime>,
    ) -> Result<Vec<WindowDescriptor>> {
        let dir = self.root.join(load_type.token());
        let mut windows = Vec::new();
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(windows),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            let Some(stem) = name
                .strip_suffix(".tar.gz")
                .or_else(|| name.strip_suffix(".tar"))
            else {
                continue;
            };
            let Ok(logical_time) = StopTime::parse_key(load_type, stem) else {
                continue;
            };
            if let Some(from) = from {
                if logical_time <= from {
                    continue;
                }
            }
            let row_count = match tokio::fs::read_to_string(
                dir.join(format!("{stem}.rowcount")),
            )
            .await
            {
                Ok(contents) => contents.trim().parse().unwrap_or(1),
                Err(_) => 1,
            };
            windows.push(WindowDescriptor {
                load_type,
                logical_time,
                row_count,
                parts: vec![name],
            });
        }
        Ok(windows)
    }

    async fn fetch_part(
        &self,
        window: &WindowDescriptor,
        part: &str,
    ) -> Result<Box<dyn PartStream>> {
        let path = self.archive_path(window, part);
        let file = tokio::fs::File::open(&path)
            .await
            .with_context(|| format!("failed to open archive part {}", path.display()))?;
        Ok(Box::new(FilePartStream { file }))
    }
}

struct FilePartStream {
    file: tokio::fs::File,
}

#[async_trait]
impl PartStream for FilePartStream {
    async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>> {
        let mut buf = vec![0u8; CHUNK_SIZE];
        let n = self.file.read(&mut buf).await?;
        if n == 0 {
            return Ok(None);
        }
        buf.truncate(n);
        Ok(Some(buf))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn lists_and_filters_windows_from_directory() {
        let dir = tempfile::tempdir().unwrap();
        let incr = dir.path().join("incr");
        std::fs::create_dir_all(&incr).unwrap();
        std::fs::write(incr.join("202401010015.tar.gz"), b"x").unwrap();
        std::fs::write(incr.join("202401010030.tar.gz"), b"x").unwrap();
        std::fs::write(incr.join("202401010030.rowcount"), b"42\n").unwrap();
        std::fs::write(incr.join("notes.txt"), b"ignored").unwrap();

        let feed = DirectoryFeed::new(dir.path());
        let mut windows = feed.list_windows(LoadType::Incr, None).await.unwrap();
        windows.sort_by_key(|w| w.logical_time);
        assert_eq!(windows.len(), 2);
        assert_eq!(windows[0].logical_time.minute_key(), "202401010015");
        assert_eq!(windows[0].row_count, 1);
        assert_eq!(windows[1].row_count, 42);

        let after = feed
            .list_windows(LoadType::Incr, Some(windows[0].logical_time))
            .await
            .unwrap();
        assert_eq!(after.len(), 1);
        assert_eq!(after[0].logical_time.minute_key(), "202401010030");
    }

    #[tokio::test]
    async fn streams_parts_in_bounded_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let incr = dir.path().join("incr");
        std::fs::create_dir_all(&incr).unwrap();
        std::fs::write(incr.join("202401010015.tar"), b"archive-bytes").unwrap();

        let feed = DirectoryFeed::new(dir.path());
        let windows = feed.list_windows(LoadType::Incr, None).await.unwrap();
        let mut stream = feed
            .fetch_part(&windows[0], &windows[0].parts[0])
            .await
            .unwrap();
        let mut collected = Vec::new();
        while let Some(chunk) = stream.next_chunk().await.unwrap() {
            collected.extend_from_slice(&chunk);
        }
        assert_eq!(collected, b"archive-bytes");
    }
}

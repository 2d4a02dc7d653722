#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **lode-staging** – Object staging layer for Lode.
//!
//! One write-once prefix per window holds the manifest and the data files
//! it references. The producer writes the manifest *last*, which makes
//! manifest presence the prefix's atomicity marker: a manifest exists only
//! if every data file it references exists.
//!
//! The trait is satisfied by any object store with streamed multipart
//! uploads and prefix listing; the bundled driver targets the local
//! filesystem. Incomplete multipart uploads are invisible to reads and
//! listings.

use std::path::PathBuf;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::fs;
use tokio::io::AsyncWriteExt;

pub mod layout;
pub mod manifest;
pub mod metadata;

pub use layout::WindowPrefix;
pub use manifest::{manifest_checksum, parse_manifest, write_manifest, ManifestError, ManifestRow};
pub use metadata::{parse_metadata, write_metadata, ObjectColumn};

/// Upload chunk size; bounds producer memory while streaming archives.
pub const CHUNK_SIZE: usize = 8 * 1024 * 1024;

/// Suffix of in-flight multipart uploads. Keys carrying it are hidden from
/// `get`, `exists` and `list_prefix`.
const PART_SUFFIX: &str = ".part";

//─────────────────────────────
//  Staging contract
//─────────────────────────────

/// In-flight streamed upload. Nothing is visible at the key until
/// `complete()`; `abort()` discards everything written so far. One of the
/// two must be called on every exit path.
#[async_trait]
pub trait MultipartWriter: Send {
    /// Append one chunk.
    async fn write_chunk(&mut self, chunk: &[u8]) -> Result<()>;
    /// Finish the upload and make the key visible.
    async fn complete(self: Box<Self>) -> Result<()>;
    /// Discard the upload.
    async fn abort(self: Box<Self>) -> Result<()>;
}

/// Durable write-once object staging.
#[async_trait]
pub trait StagingStore: Send + Sync {
    /// Store `bytes` at `key` in one call.
    async fn put(&self, key: &str, bytes: &[u8]) -> Result<()>;

    /// Fetch the object at `key`, or `None` when absent.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Whether an object exists at `key`.
    async fn exists(&self, key: &str) -> Result<bool>;

    /// All keys under `prefix`, ascending.
    async fn list_prefix(&self, prefix: &str) -> Result<Vec<String>>;

    /// Begin a streamed upload to `key`.
    async fn start_multipart(&self, key: &str) -> Result<Box<dyn MultipartWriter>>;

    /// Open a sequential reader over the object at `key`.
    ///
    /// Used for archive extraction, which wants a blocking `Read`; callers
    /// must not hold the reader across await points longer than necessary.
    async fn open_read(&self, key: &str) -> Result<Option<Box<dyn std::io::Read + Send>>>;
}

//─────────────────────────────
//  Local-filesystem driver
//─────────────────────────────

/// Staging driver rooted in a local directory.
#[derive(Debug, Clone)]
pub struct LocalFsStaging {
    root: PathBuf,
}

impl LocalFsStaging {
    /// Initialise a new driver rooted at `root` (created if absent).
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)
            .with_context(|| format!("failed to create staging root {}", root.display()))?;
        Ok(Self { root })
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }
}

#[async_trait]
impl StagingStore for LocalFsStaging {
    async fn put(&self, key: &str, bytes: &[u8]) -> Result<()> {
        let path = self.path_for(key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let mut file = fs::File::create(&path).await?;
        file.write_all(bytes).await?;
        file.flush().await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        if key.ends_with(PART_SUFFIX) {
            return Ok(None);
        }
        match fs::read(self.path_for(key)).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        if key.ends_with(PART_SUFFIX) {
            return Ok(false);
        }
        Ok(fs::try_exists(self.path_for(key)).await?)
    }

    async fn list_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        let mut pending = vec![self.root.clone()];
        while let Some(dir) = pending.pop() {
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                if entry.file_type().await?.is_dir() {
                    pending.push(path);
                    continue;
                }
                let Ok(rel) = path.strip_prefix(&self.root) else {
                    continue;
                };
                let key = rel
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");
                if key.starts_with(prefix) && !key.ends_with(PART_SUFFIX) {
                    keys.push(key);
                }
            }
        }
        keys.sort();
        Ok(keys)
    }

    async fn start_multipart(&self, key: &str) -> Result<Box<dyn MultipartWriter>> {
        let final_path = self.path_for(key);
        if let Some(parent) = final_path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let part_path = self.path_for(&format!("{key}{PART_SUFFIX}"));
        let file = fs::File::create(&part_path).await?;
        Ok(Box::new(LocalMultipart {
            file,
            part_path,
            final_path,
        }))
    }

    async fn open_read(&self, key: &str) -> Result<Option<Box<dyn std::io::Read + Send>>> {
        if key.ends_with(PART_SUFFIX) {
            return Ok(None);
        }
        match std::fs::File::open(self.path_for(key)) {
            Ok(file) => Ok(Some(Box::new(file))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

struct LocalMultipart {
    file: fs::File,
    part_path: PathBuf,
    final_path: PathBuf,
}

#[async_trait]
impl MultipartWriter for LocalMultipart {
    async fn write_chunk(&mut self, chunk: &[u8]) -> Result<()> {
        self.file.write_all(chunk).await?;
        Ok(())
    }

    async fn complete(mut self: Box<Self>) -> Result<()> {
        self.file.flush().await?;
        self.file.sync_all().await?;
        fs::rename(&self.part_path, &self.final_path).await?;
        Ok(())
    }

    async fn abort(self: Box<Self>) -> Result<()> {
        drop(self.file);
        match fs::remove_file(&self.part_path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn staging() -> (tempfile::TempDir, LocalFsStaging) {
        let dir = tempfile::tempdir().unwrap();
        let staging = LocalFsStaging::new(dir.path()).unwrap();
        (dir, staging)
    }

    #[tokio::test]
    async fn put_get_roundtrip() {
        let (_dir, staging) = staging().await;
        staging.put("a/b/data.csv", b"id,name\n1,x\n").await.unwrap();
        assert!(staging.exists("a/b/data.csv").await.unwrap());
        assert_eq!(
            staging.get("a/b/data.csv").await.unwrap().unwrap(),
            b"id,name\n1,x\n"
        );
        assert!(staging.get("a/b/missing.csv").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn multipart_is_invisible_until_complete() {
        let (_dir, staging) = staging().await;
        let mut writer = staging.start_multipart("w/archive.tar").await.unwrap();
        writer.write_chunk(b"chunk-one").await.unwrap();

        assert!(!staging.exists("w/archive.tar").await.unwrap());
        assert!(staging.list_prefix("w/").await.unwrap().is_empty());

        writer.write_chunk(b"chunk-two").await.unwrap();
        writer.complete().await.unwrap();

        assert_eq!(
            staging.get("w/archive.tar").await.unwrap().unwrap(),
            b"chunk-onechunk-two"
        );
    }

    #[tokio::test]
    async fn multipart_abort_leaves_nothing() {
        let (_dir, staging) = staging().await;
        let mut writer = staging.start_multipart("w/archive.tar").await.unwrap();
        writer.write_chunk(b"partial").await.unwrap();
        writer.abort().await.unwrap();

        assert!(!staging.exists("w/archive.tar").await.unwrap());
        assert!(staging.list_prefix("").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn listing_is_sorted_and_prefix_scoped() {
        let (_dir, staging) = staging().await;
        staging.put("v/incr/b.csv", b"b").await.unwrap();
        staging.put("v/incr/a.csv", b"a").await.unwrap();
        staging.put("v/full/c.csv", b"c").await.unwrap();

        let keys = staging.list_prefix("v/incr/").await.unwrap();
        assert_eq!(keys, ["v/incr/a.csv", "v/incr/b.csv"]);
    }
}

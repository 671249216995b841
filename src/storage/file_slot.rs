//! Per-resource sparse file access
//!
//! Each cached resource is backed by a single sparse file. A
//! [`FileSlotManager`] wraps that file with one writer handle and one reader
//! handle on independent descriptors: the writer is exclusive, readers may
//! proceed concurrently with it because the range set only claims a region
//! after its write succeeds.

use crate::error::{CacheError, Result};
use bytes::Bytes;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Random-access handle pair over one resource's sparse data file
pub struct FileSlotManager {
    /// Path of the backing file
    path: PathBuf,

    /// Exclusive writer descriptor
    writer: Mutex<Option<File>>,

    /// Reader descriptor, independent of the writer
    reader: Mutex<Option<File>>,
}

impl FileSlotManager {
    /// Open (creating if missing) the backing file for random read and write
    ///
    /// Creates the parent directory when absent. Fails with an IO error when
    /// the file cannot be created or opened.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let writer = Self::open_writer(&path).await?;
        let reader = Self::open_reader(&path).await?;

        debug!(path = %path.display(), "opened cache file slot");

        Ok(Self {
            path,
            writer: Mutex::new(Some(writer)),
            reader: Mutex::new(Some(reader)),
        })
    }

    async fn open_writer(path: &Path) -> Result<File> {
        Ok(OpenOptions::new()
            .write(true)
            .create(true)
            .open(path)
            .await?)
    }

    async fn open_reader(path: &Path) -> Result<File> {
        Ok(OpenOptions::new().read(true).open(path).await?)
    }

    /// Path of the backing file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current size of the backing file in bytes
    pub async fn file_size(&self) -> Result<i64> {
        let meta = tokio::fs::metadata(&self.path).await?;
        Ok(meta.len() as i64)
    }

    /// Read up to `len` bytes starting at `offset`
    ///
    /// Returns the bytes actually read, which may be fewer than requested
    /// at end of file.
    pub async fn read(&self, offset: i64, len: usize) -> Result<Bytes> {
        if offset < 0 {
            return Err(CacheError::Config(format!(
                "negative read offset {}",
                offset
            )));
        }

        let mut guard = self.reader.lock().await;
        if guard.is_none() {
            *guard = Some(Self::open_reader(&self.path).await?);
        }
        let file = guard.as_mut().ok_or(CacheError::NotFound(
            self.path.display().to_string(),
        ))?;

        file.seek(SeekFrom::Start(offset as u64)).await?;

        let mut buf = vec![0u8; len];
        let mut filled = 0;
        while filled < len {
            let n = file.read(&mut buf[filled..]).await?;
            if n == 0 {
                break; // EOF
            }
            filled += n;
        }
        buf.truncate(filled);
        Ok(Bytes::from(buf))
    }

    /// Seek to `offset` and write all of `data`
    ///
    /// On failure the handle is reopened and the write retried once; a
    /// second failure is surfaced as a hard error.
    pub async fn write(&self, offset: i64, data: &[u8]) -> Result<()> {
        if offset < 0 {
            return Err(CacheError::Config(format!(
                "negative write offset {}",
                offset
            )));
        }

        let mut guard = self.writer.lock().await;
        if guard.is_none() {
            *guard = Some(Self::open_writer(&self.path).await?);
        }

        let first_attempt = match guard.as_mut() {
            Some(file) => Self::write_at(file, offset, data).await,
            None => Err(CacheError::NotFound(self.path.display().to_string())),
        };

        if let Err(e) = first_attempt {
            warn!(
                path = %self.path.display(),
                offset,
                len = data.len(),
                error = %e,
                "write failed, reopening handle for one retry"
            );
            let mut file = Self::open_writer(&self.path).await?;
            Self::write_at(&mut file, offset, data).await?;
            *guard = Some(file);
        }

        Ok(())
    }

    async fn write_at(file: &mut File, offset: i64, data: &[u8]) -> Result<()> {
        file.seek(SeekFrom::Start(offset as u64)).await?;
        file.write_all(data).await?;
        Ok(())
    }

    /// Flush the writer's data to stable storage
    pub async fn sync(&self) -> Result<()> {
        let mut guard = self.writer.lock().await;
        if let Some(file) = guard.as_mut() {
            file.flush().await?;
            file.sync_all().await?;
        }
        Ok(())
    }

    /// Sync, then drop both handles
    ///
    /// Subsequent reads or writes reopen the file lazily; `close` exists so
    /// removal can release descriptors before deleting the backing file.
    pub async fn close(&self) -> Result<()> {
        self.sync().await?;
        self.writer.lock().await.take();
        self.reader.lock().await.take();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_open_creates_parent_and_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("res.bmv");
        let slot = FileSlotManager::open(&path).await.unwrap();
        assert_eq!(slot.file_size().await.unwrap(), 0);
        assert!(path.exists());
    }

    #[tokio::test]
    async fn test_write_then_read_round_trip() {
        let dir = TempDir::new().unwrap();
        let slot = FileSlotManager::open(dir.path().join("res.bmv"))
            .await
            .unwrap();

        slot.write(0, b"hello world").await.unwrap();
        let read = slot.read(0, 11).await.unwrap();
        assert_eq!(&read[..], b"hello world");

        let partial = slot.read(6, 5).await.unwrap();
        assert_eq!(&partial[..], b"world");
    }

    #[tokio::test]
    async fn test_sparse_write_at_offset() {
        let dir = TempDir::new().unwrap();
        let slot = FileSlotManager::open(dir.path().join("res.bmv"))
            .await
            .unwrap();

        slot.write(4096, b"tail").await.unwrap();
        assert_eq!(slot.file_size().await.unwrap(), 4100);

        let read = slot.read(4096, 4).await.unwrap();
        assert_eq!(&read[..], b"tail");
    }

    #[tokio::test]
    async fn test_read_short_at_eof() {
        let dir = TempDir::new().unwrap();
        let slot = FileSlotManager::open(dir.path().join("res.bmv"))
            .await
            .unwrap();

        slot.write(0, b"abc").await.unwrap();
        let read = slot.read(0, 100).await.unwrap();
        assert_eq!(&read[..], b"abc");

        let beyond = slot.read(50, 10).await.unwrap();
        assert!(beyond.is_empty());
    }

    #[tokio::test]
    async fn test_close_then_reopen_lazily() {
        let dir = TempDir::new().unwrap();
        let slot = FileSlotManager::open(dir.path().join("res.bmv"))
            .await
            .unwrap();

        slot.write(0, b"persisted").await.unwrap();
        slot.close().await.unwrap();

        // Reads after close lazily reopen the descriptor.
        let read = slot.read(0, 9).await.unwrap();
        assert_eq!(&read[..], b"persisted");
    }

    #[tokio::test]
    async fn test_negative_offset_rejected() {
        let dir = TempDir::new().unwrap();
        let slot = FileSlotManager::open(dir.path().join("res.bmv"))
            .await
            .unwrap();
        assert!(slot.read(-1, 4).await.is_err());
        assert!(slot.write(-1, b"x").await.is_err());
    }
}

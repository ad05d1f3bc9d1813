//! Local byte streams the pipelines read from and write to.

use std::path::{Path, PathBuf};

use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt, SeekFrom};
use tracing::debug;

use crate::TransferError;
use crate::remote::BoxFuture;

/// Local byte stream owned by one transfer.
pub trait LocalStream: Send + Sync {
    /// Reads up to `max` bytes. Shorter only at end of stream; empty is EOF.
    fn read(&mut self, max: usize) -> BoxFuture<'_, Result<Vec<u8>, TransferError>>;

    /// Writes the whole buffer.
    fn write<'a>(&'a mut self, data: &'a [u8]) -> BoxFuture<'a, Result<(), TransferError>>;

    /// Moves the read position to `position` bytes from the start.
    fn seek(&mut self, position: u64) -> BoxFuture<'_, Result<(), TransferError>>;

    /// Current length of the underlying data.
    fn len(&mut self) -> BoxFuture<'_, Result<u64, TransferError>>;

    /// Flushes and releases the stream. Later calls fail.
    fn close(&mut self) -> BoxFuture<'_, Result<(), TransferError>>;
}

/// [`LocalStream`] over a file on disk.
#[derive(Debug)]
pub struct FileStream {
    path: PathBuf,
    file: Option<File>,
}

impl FileStream {
    /// Opens an existing file for reading.
    pub async fn open_read(path: impl AsRef<Path>) -> Result<Self, TransferError> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path).await?;
        Ok(Self {
            path,
            file: Some(file),
        })
    }

    /// Creates (or truncates) a file for writing.
    pub async fn create(path: impl AsRef<Path>) -> Result<Self, TransferError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = File::create(&path).await?;
        Ok(Self {
            path,
            file: Some(file),
        })
    }

    /// Opens a file for appending, creating it when missing.
    pub async fn open_append(path: impl AsRef<Path>) -> Result<Self, TransferError> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .read(true)
            .open(&path)
            .await?;
        Ok(Self {
            path,
            file: Some(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn file(&mut self) -> Result<&mut File, TransferError> {
        self.file.as_mut().ok_or_else(|| {
            TransferError::Io(std::io::Error::other(format!(
                "stream {} is closed",
                self.path.display()
            )))
        })
    }
}

impl LocalStream for FileStream {
    fn read(&mut self, max: usize) -> BoxFuture<'_, Result<Vec<u8>, TransferError>> {
        Box::pin(async move {
            let file = self.file()?;
            let mut buf = vec![0u8; max];
            let mut filled = 0;
            while filled < max {
                let n = file.read(&mut buf[filled..]).await?;
                if n == 0 {
                    break;
                }
                filled += n;
            }
            buf.truncate(filled);
            Ok(buf)
        })
    }

    fn write<'a>(&'a mut self, data: &'a [u8]) -> BoxFuture<'a, Result<(), TransferError>> {
        Box::pin(async move {
            self.file()?.write_all(data).await?;
            Ok(())
        })
    }

    fn seek(&mut self, position: u64) -> BoxFuture<'_, Result<(), TransferError>> {
        Box::pin(async move {
            self.file()?.seek(SeekFrom::Start(position)).await?;
            Ok(())
        })
    }

    fn len(&mut self) -> BoxFuture<'_, Result<u64, TransferError>> {
        Box::pin(async move { Ok(self.file()?.metadata().await?.len()) })
    }

    fn close(&mut self) -> BoxFuture<'_, Result<(), TransferError>> {
        Box::pin(async move {
            if let Some(mut file) = self.file.take() {
                file.flush().await?;
                file.sync_all().await?;
                debug!(path = %self.path.display(), "stream closed");
            }
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn read_fills_until_eof() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("src.bin");
        std::fs::write(&path, vec![3u8; 2500]).unwrap();

        let mut s = FileStream::open_read(&path).await.unwrap();
        assert_eq!(s.len().await.unwrap(), 2500);
        assert_eq!(s.read(1000).await.unwrap().len(), 1000);
        assert_eq!(s.read(1000).await.unwrap().len(), 1000);
        assert_eq!(s.read(1000).await.unwrap().len(), 500);
        assert!(s.read(1000).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn seek_then_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("src.bin");
        std::fs::write(&path, (0..100u8).collect::<Vec<_>>()).unwrap();

        let mut s = FileStream::open_read(&path).await.unwrap();
        s.seek(40).await.unwrap();
        assert_eq!(s.read(3).await.unwrap(), vec![40, 41, 42]);
    }

    #[tokio::test]
    async fn append_keeps_existing_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.bin");
        std::fs::write(&path, b"abc").unwrap();

        let mut s = FileStream::open_append(&path).await.unwrap();
        assert_eq!(s.len().await.unwrap(), 3);
        s.write(b"def").await.unwrap();
        s.close().await.unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"abcdef");
    }

    #[tokio::test]
    async fn create_truncates_and_makes_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("out.bin");
        let mut s = FileStream::create(&path).await.unwrap();
        s.write(b"xyz").await.unwrap();
        s.close().await.unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"xyz");
    }

    #[tokio::test]
    async fn closed_stream_rejects_io() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.bin");
        let mut s = FileStream::create(&path).await.unwrap();
        s.close().await.unwrap();
        s.close().await.unwrap();
        assert!(matches!(s.write(b"x").await, Err(TransferError::Io(_))));
    }

    #[tokio::test]
    async fn open_missing_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        let err = FileStream::open_read(dir.path().join("nope")).await.unwrap_err();
        assert!(matches!(err, TransferError::Io(_)));
    }
}

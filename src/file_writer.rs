use std::future::Future;
use std::io::{self, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use thiserror::Error;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;

use crate::progress_reporter::ProgressSource;
use crate::shared_types::ByteCount;

#[derive(Error, Debug)]
pub enum WriteError {
    #[error("file {0} already exists, use --force to overwrite")]
    AlreadyExists(PathBuf),
    #[error("failed to create {path}: {source}")]
    Create { path: PathBuf, source: io::Error },
    #[error("failed to write {len} bytes at offset {offset}: {source}")]
    Io {
        offset: ByteCount,
        len: usize,
        source: io::Error,
    },
    #[error("write would exceed file size: offset={offset}, len={len}, size={size}")]
    OutOfBounds {
        offset: ByteCount,
        len: usize,
        size: ByteCount,
    },
    #[error("file writer is closed")]
    Closed,
    #[error("failed to sync file: {0}")]
    Sync(io::Error),
}

/// Offset-addressed output for generated chunks. Ranges handed to one writer
/// never overlap, but they may arrive in any order.
pub trait ChunkWriter: Send + Sync {
    fn write_at(
        &self,
        data: &[u8],
        offset: ByteCount,
    ) -> impl Future<Output = Result<(), WriteError>> + Send;

    fn close(&self) -> impl Future<Output = Result<(), WriteError>> + Send;
}

/// Pre-sized output file. All writes go through one lock (seek + write), so
/// the handle may be shared by any number of tasks.
#[derive(Debug)]
pub struct FileWriter {
    path: PathBuf,
    size: ByteCount,
    file: Mutex<Option<File>>,
    written: AtomicU64,
}

impl FileWriter {
    pub async fn create(
        path: impl AsRef<Path>,
        size: ByteCount,
        overwrite: bool,
    ) -> Result<Self, WriteError> {
        let path = path.as_ref().to_path_buf();
        if !overwrite && tokio::fs::try_exists(&path).await.unwrap_or(false) {
            return Err(WriteError::AlreadyExists(path));
        }

        let create_err = |source| WriteError::Create {
            path: path.clone(),
            source,
        };
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)
            .await
            .map_err(create_err)?;
        file.set_len(size).await.map_err(create_err)?;
        debug!("created {} pre-sized to {size} bytes", path.display());

        Ok(Self {
            path,
            size,
            file: Mutex::new(Some(file)),
            written: AtomicU64::new(0),
        })
    }

    pub fn written(&self) -> ByteCount {
        self.written.load(Ordering::Acquire)
    }
}

impl ChunkWriter for FileWriter {
    async fn write_at(&self, data: &[u8], offset: ByteCount) -> Result<(), WriteError> {
        if data.is_empty() {
            return Ok(());
        }
        let end = offset.checked_add(data.len() as ByteCount);
        if end.map_or(true, |end| end > self.size) {
            return Err(WriteError::OutOfBounds {
                offset,
                len: data.len(),
                size: self.size,
            });
        }

        let mut guard = self.file.lock().await;
        let file = guard.as_mut().ok_or(WriteError::Closed)?;
        let io_err = |source| WriteError::Io {
            offset,
            len: data.len(),
            source,
        };
        file.seek(SeekFrom::Start(offset)).await.map_err(io_err)?;
        file.write_all(data).await.map_err(io_err)?;
        file.flush().await.map_err(io_err)?;

        self.written
            .fetch_add(data.len() as ByteCount, Ordering::AcqRel);
        Ok(())
    }

    async fn close(&self) -> Result<(), WriteError> {
        let Some(mut file) = self.file.lock().await.take() else {
            return Ok(());
        };
        file.flush().await.map_err(WriteError::Sync)?;
        file.sync_all().await.map_err(WriteError::Sync)?;
        debug!("closed {}", self.path.display());
        Ok(())
    }
}

impl ProgressSource for FileWriter {
    fn written(&self) -> ByteCount {
        FileWriter::written(self)
    }

    fn total(&self) -> ByteCount {
        self.size
    }

    fn path(&self) -> Option<&Path> {
        Some(&self.path)
    }
}

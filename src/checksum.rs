use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::buffer_pool::PooledBuffer;
use crate::shared_types::ByteCount;

pub const CHECKSUM_ALGORITHM: &str = "blake3";

#[derive(Error, Debug)]
pub enum ChecksumError {
    #[error("chunk at offset {offset} (len {len}) overlaps data already folded")]
    Overlap { offset: ByteCount, len: ByteCount },
    #[error("chunk at offset {offset} (len {len}) runs past the end ({total})")]
    OutOfRange {
        offset: ByteCount,
        len: ByteCount,
        total: ByteCount,
    },
    #[error("checksum incomplete: {folded} of {total} bytes folded in order")]
    Incomplete { folded: ByteCount, total: ByteCount },
    #[error("failed to write checksum file {path}: {source}")]
    Io { path: PathBuf, source: io::Error },
    #[error("failed to encode manifest: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkDigest {
    pub offset: ByteCount,
    pub length: ByteCount,
    pub digest: String,
}

/// Integrity record of a finished run: the whole-file digest plus the digest
/// of every chunk keyed by offset.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChecksumRecord {
    pub algorithm: String,
    pub digest: String,
    pub total_size: ByteCount,
    pub chunks: Vec<ChunkDigest>,
}

/// Streaming whole-file digest over chunks that arrive in any order.
///
/// Chunks ahead of the next expected offset are parked (the buffer itself,
/// no copy) until the gap before them is filled, then fed to the hasher in
/// offset order and handed back for release.
pub struct ChecksumAccumulator {
    total: ByteCount,
    next_offset: ByteCount,
    hasher: blake3::Hasher,
    parked: BTreeMap<ByteCount, PooledBuffer>,
    chunks: Vec<ChunkDigest>,
}

impl ChecksumAccumulator {
    pub fn new(total: ByteCount) -> Self {
        Self {
            total,
            next_offset: 0,
            hasher: blake3::Hasher::new(),
            parked: BTreeMap::new(),
            chunks: Vec::new(),
        }
    }

    /// Rejects ranges that were already folded, are already parked or run
    /// past the end.
    pub fn check(&self, offset: ByteCount, len: ByteCount) -> Result<(), ChecksumError> {
        let end = offset.saturating_add(len);
        if end > self.total {
            return Err(ChecksumError::OutOfRange {
                offset,
                len,
                total: self.total,
            });
        }
        let overlaps_parked = self
            .parked
            .range(..end)
            .next_back()
            .is_some_and(|(start, buf)| start + buf.len() as ByteCount > offset);
        if offset < self.next_offset || overlaps_parked {
            return Err(ChecksumError::Overlap { offset, len });
        }
        Ok(())
    }

    /// Takes ownership of a chunk and returns every buffer that has been
    /// hashed and may now be released, in offset order.
    pub fn fold(&mut self, offset: ByteCount, buffer: PooledBuffer) -> Vec<PooledBuffer> {
        debug_assert!(self.check(offset, buffer.len() as ByteCount).is_ok());

        self.chunks.push(ChunkDigest {
            offset,
            length: buffer.len() as ByteCount,
            digest: blake3::hash(&buffer).to_hex().to_string(),
        });
        self.parked.insert(offset, buffer);

        let mut ready = Vec::new();
        while let Some(buffer) = self.parked.remove(&self.next_offset) {
            self.hasher.update(&buffer);
            self.next_offset += buffer.len() as ByteCount;
            ready.push(buffer);
        }
        ready
    }

    /// Bytes hashed into the whole-file digest so far.
    pub fn folded(&self) -> ByteCount {
        self.next_offset
    }

    pub fn parked(&self) -> usize {
        self.parked.len()
    }

    /// Gives back the buffers still waiting for an earlier chunk. Used when a
    /// run ends early.
    pub fn discard(&mut self) -> Vec<PooledBuffer> {
        std::mem::take(&mut self.parked).into_values().collect()
    }

    pub fn finalize(mut self) -> Result<ChecksumRecord, ChecksumError> {
        if self.next_offset != self.total || !self.parked.is_empty() {
            return Err(ChecksumError::Incomplete {
                folded: self.next_offset,
                total: self.total,
            });
        }
        self.chunks.sort_by_key(|c| c.offset);
        Ok(ChecksumRecord {
            algorithm: CHECKSUM_ALGORITHM.to_owned(),
            digest: self.hasher.finalize().to_hex().to_string(),
            total_size: self.total,
            chunks: self.chunks,
        })
    }
}

impl ChecksumRecord {
    pub fn checksum_path(output: &Path) -> PathBuf {
        sibling(output, ".checksum.txt")
    }

    pub fn manifest_path(output: &Path) -> PathBuf {
        sibling(output, ".manifest.json")
    }

    /// `<digest>  <file name>`, the format `b3sum --check` reads.
    pub fn checksum_line(&self, output: &Path) -> String {
        let name = output
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| output.display().to_string());
        format!("{}  {}\n", self.digest, name)
    }

    /// Writes `<output>.checksum.txt` and, if asked, the per-chunk
    /// `<output>.manifest.json`. Returns the paths written.
    pub async fn write_files(
        &self,
        output: &Path,
        with_manifest: bool,
    ) -> Result<Vec<PathBuf>, ChecksumError> {
        let mut written = vec![];

        let checksum_path = Self::checksum_path(output);
        write_file(&checksum_path, self.checksum_line(output).into_bytes()).await?;
        written.push(checksum_path);

        if with_manifest {
            let manifest_path = Self::manifest_path(output);
            write_file(&manifest_path, serde_json::to_vec_pretty(self)?).await?;
            written.push(manifest_path);
        }
        Ok(written)
    }
}

fn sibling(output: &Path, suffix: &str) -> PathBuf {
    let mut name = output.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

async fn write_file(path: &Path, contents: Vec<u8>) -> Result<(), ChecksumError> {
    tokio::fs::write(path, contents)
        .await
        .map_err(|source| ChecksumError::Io {
            path: path.to_path_buf(),
            source,
        })
}

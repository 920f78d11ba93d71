use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::config::GenerationConfig;
use crate::shared_types::ByteCount;
use crate::size_utils::{format_bytes, GB, KB};

pub const MIN_CHUNK_SIZE: ByteCount = KB;
pub const MAX_CHUNK_SIZE: ByteCount = GB;

#[derive(Error, Debug)]
pub enum ValidationError {
    #[error("workers: worker count must be at least 1")]
    NoWorkers,
    #[error("workers: worker count {workers} exceeds recommended maximum of {max} (4x CPU count)")]
    TooManyWorkers { workers: usize, max: usize },
    #[error("chunk_size: chunk size must be between {} and {}", format_bytes(MIN_CHUNK_SIZE), format_bytes(MAX_CHUNK_SIZE))]
    ChunkSize,
    #[error("output: output path cannot be empty")]
    EmptyOutput,
    #[error("output: file '{0}' already exists (use --force to overwrite)")]
    Exists(PathBuf),
    #[error("output: directory '{0}' does not exist")]
    MissingDir(PathBuf),
    #[error("output: '{0}' is not a directory")]
    NotADir(PathBuf),
    #[error("output: directory '{dir}' is not writable: {source}")]
    NotWritable { dir: PathBuf, source: io::Error },
    #[error("disk_space: failed to check disk space: {0}")]
    DiskQuery(io::Error),
    #[error("disk_space: insufficient disk space: need {}, have {}", format_bytes(*.need), format_bytes(*.have))]
    InsufficientSpace { need: ByteCount, have: ByteCount },
}

pub fn max_workers() -> usize {
    num_cpus::get() * 4
}

pub fn validate_workers(workers: usize) -> Result<(), ValidationError> {
    if workers == 0 {
        return Err(ValidationError::NoWorkers);
    }
    let max = max_workers();
    if workers > max {
        return Err(ValidationError::TooManyWorkers { workers, max });
    }
    Ok(())
}

pub fn validate_chunk_size(chunk: ByteCount) -> Result<(), ValidationError> {
    if !(MIN_CHUNK_SIZE..=MAX_CHUNK_SIZE).contains(&chunk) {
        return Err(ValidationError::ChunkSize);
    }
    Ok(())
}

fn parent_dir(path: &Path) -> &Path {
    match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    }
}

pub fn validate_output_path(path: &Path, force: bool) -> Result<(), ValidationError> {
    if path.as_os_str().is_empty() {
        return Err(ValidationError::EmptyOutput);
    }
    if path.exists() && !force {
        return Err(ValidationError::Exists(path.to_path_buf()));
    }

    let dir = parent_dir(path);
    let meta = std::fs::metadata(dir).map_err(|_| ValidationError::MissingDir(dir.to_path_buf()))?;
    if !meta.is_dir() {
        return Err(ValidationError::NotADir(dir.to_path_buf()));
    }

    let scratch = dir.join(format!(".chunkfill-write-test-{}", std::process::id()));
    std::fs::File::create(&scratch).map_err(|source| ValidationError::NotWritable {
        dir: dir.to_path_buf(),
        source,
    })?;
    if let Err(e) = std::fs::remove_file(&scratch) {
        warn!("could not remove {}: {e}", scratch.display());
    }
    Ok(())
}

#[cfg(unix)]
pub fn available_space(dir: &Path) -> io::Result<ByteCount> {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;

    let c_path = CString::new(dir.as_os_str().as_bytes())
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    // SAFETY: statvfs only writes into the zeroed struct we hand it
    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::statvfs(c_path.as_ptr(), &mut stat) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    #[allow(clippy::unnecessary_cast)]
    let free = stat.f_bavail as ByteCount * stat.f_frsize as ByteCount;
    Ok(free)
}

/// Overwriting an existing file gives its blocks back first, so they count
/// as free.
pub fn validate_disk_space(path: &Path, size: ByteCount) -> Result<(), ValidationError> {
    #[cfg(unix)]
    {
        let have = available_space(parent_dir(path)).map_err(ValidationError::DiskQuery)?;
        let reclaimed = std::fs::metadata(path).map(|m| m.len()).unwrap_or(0);
        let have = have.saturating_add(reclaimed);
        if size > have {
            return Err(ValidationError::InsufficientSpace { need: size, have });
        }
    }
    #[cfg(not(unix))]
    {
        debug!(
            "free space check not supported here, skipping for {} ({size} bytes)",
            path.display()
        );
    }
    Ok(())
}

pub fn validate_all(config: &GenerationConfig) -> Result<(), ValidationError> {
    validate_output_path(&config.output, config.force)?;
    validate_disk_space(&config.output, config.size)?;
    validate_workers(config.workers)?;
    validate_chunk_size(config.chunk_size)?;
    Ok(())
}

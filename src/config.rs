use std::path::PathBuf;

use crate::pattern::Pattern;
use crate::pipeline::{ConfigError, PipelineConfig};
use crate::shared_types::ByteCount;
use crate::size_utils::MB;

pub const DEFAULT_CHUNK_SIZE: &str = "64MB";
pub const DEFAULT_MIXED_RUN_SIZE: &str = "1KB";

/// Everything a generation run needs, with sizes already resolved to bytes.
#[derive(Clone, Debug)]
pub struct GenerationConfig {
    pub output: PathBuf,
    pub size: ByteCount,
    pub chunk_size: ByteCount,
    pub pattern: Pattern,
    pub mixed_run: usize,
    pub workers: usize,
    pub force: bool,
    pub verbose: bool,
    pub manifest: bool,
}

impl GenerationConfig {
    pub fn new(output: impl Into<PathBuf>, size: ByteCount) -> Self {
        Self {
            output: output.into(),
            size,
            chunk_size: 64 * MB,
            pattern: Pattern::Random,
            mixed_run: crate::pattern::DEFAULT_MIXED_RUN,
            workers: num_cpus::get(),
            force: false,
            verbose: false,
            manifest: false,
        }
    }

    pub fn pipeline_config(&self) -> Result<PipelineConfig, ConfigError> {
        PipelineConfig::new(self.size, self.chunk_size, self.workers)
    }
}

use std::path::PathBuf;
use std::sync::Arc;

use indicatif::MultiProgress;
use thiserror::Error;

use crate::checksum::{ChecksumError, ChecksumRecord};
use crate::config::GenerationConfig;
use crate::file_writer::{ChunkWriter, FileWriter, WriteError};
use crate::pipeline::{ConfigError, Pipeline, PipelineError, RunOutcome};
use crate::progress_reporter::ProgressReporter;
use crate::shared_types::ByteCount;
use crate::shutdown::{CleanupError, ShutdownCoordinator, ShutdownReason};

#[derive(Error, Debug)]
pub enum RunError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("failed to create file writer: {0}")]
    Create(#[source] WriteError),
    #[error("generation failed after {written} bytes: {source}")]
    Failed {
        written: ByteCount,
        source: PipelineError,
    },
    #[error("operation cancelled after {written} bytes")]
    Cancelled { written: ByteCount },
    #[error("failed to close file: {0}")]
    Close(#[source] WriteError),
    #[error("failed to write checksum file: {0}")]
    Checksum(#[from] ChecksumError),
}

impl RunError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, RunError::Cancelled { .. })
    }
}

#[derive(Debug)]
pub struct GenerationSummary {
    pub output: PathBuf,
    pub written: ByteCount,
    pub checksum: ChecksumRecord,
    pub checksum_files: Vec<PathBuf>,
}

/// Runs one generation end to end: output file, shutdown wiring, progress,
/// pipeline, and the checksum files on success.
///
/// On failure or cancellation the coordinator is stopped and its cleanups
/// (closing the output) have run by the time this returns.
pub async fn generate_file(
    config: &GenerationConfig,
    coordinator: Arc<ShutdownCoordinator>,
    multi: MultiProgress,
) -> Result<GenerationSummary, RunError> {
    let pipeline_config = config.pipeline_config()?;

    let writer = Arc::new(
        FileWriter::create(&config.output, config.size, config.force)
            .await
            .map_err(RunError::Create)?,
    );
    {
        let writer = writer.clone();
        coordinator.register_cleanup("close output file", move || async move {
            writer.close().await.map_err(CleanupError::from)
        });
    }
    coordinator.set_progress_source(writer.clone());
    let listener = coordinator.listen_for_signals();

    let pipeline = Pipeline::new(
        pipeline_config,
        config.pattern.build(config.mixed_run),
        writer.clone(),
        // a failing stage cancels only the run; the coordinator hears about
        // it through stop(Failure) below
        coordinator.token().child_token(),
    );
    let reporter = ProgressReporter::new(pipeline.state(), multi, config.verbose);
    let stop_progress = reporter.stop_token();
    let progress = reporter.spawn();

    let outcome = pipeline.run().await;
    stop_progress.cancel();
    if let Err(e) = progress.await {
        warn!("progress reporter failed: {e}");
    }

    match outcome {
        RunOutcome::Completed { written, checksum } => {
            listener.abort();
            writer.close().await.map_err(RunError::Close)?;
            let checksum_files = checksum.write_files(&config.output, config.manifest).await?;
            Ok(GenerationSummary {
                output: config.output.clone(),
                written,
                checksum,
                checksum_files,
            })
        }
        RunOutcome::Failed { written, error } => {
            coordinator.stop(ShutdownReason::Failure).await;
            coordinator.wait().await;
            Err(RunError::Failed {
                written,
                source: error,
            })
        }
        RunOutcome::Cancelled { written } => {
            coordinator.stop(ShutdownReason::Requested).await;
            coordinator.wait().await;
            Err(RunError::Cancelled { written })
        }
    }
}

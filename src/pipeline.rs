use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::buffer_pool::BufferPool;
use crate::checksum::{ChecksumAccumulator, ChecksumError, ChecksumRecord};
use crate::dispatcher::spawn_dispatcher;
use crate::file_writer::{ChunkWriter, WriteError};
use crate::pattern::{GenerateError, PatternGenerator};
use crate::progress_reporter::ProgressSource;
use crate::shared_types::{ByteCount, ResultItem, WorkItem};

/// Work and result queues hold this many items per worker.
const QUEUE_DEPTH_PER_WORKER: usize = 2;
/// Chunks that may be dispatched ahead of the oldest one not yet hashed.
const REORDER_WINDOW_PER_WORKER: usize = 4;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("generation failed: {0}")]
    Generation(#[from] GenerateError),
    #[error("write failed: {0}")]
    Write(#[from] WriteError),
    #[error("checksum failed: {0}")]
    Checksum(#[from] ChecksumError),
    #[error("pipeline task failed: {0}")]
    Join(String),
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("total size must be positive")]
    ZeroSize,
    #[error("chunk size must be positive")]
    ZeroChunk,
    #[error("worker count must be at least 1")]
    ZeroWorkers,
    #[error("chunk size {0} does not fit in memory on this platform")]
    ChunkTooLarge(ByteCount),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PipelineConfig {
    pub total_size: ByteCount,
    pub chunk_size: ByteCount,
    pub workers: usize,
}

impl PipelineConfig {
    /// A chunk larger than the file is cut down to the file size.
    pub fn new(total_size: ByteCount, chunk_size: ByteCount, workers: usize) -> Result<Self, ConfigError> {
        if total_size == 0 {
            return Err(ConfigError::ZeroSize);
        }
        if chunk_size == 0 {
            return Err(ConfigError::ZeroChunk);
        }
        if workers == 0 {
            return Err(ConfigError::ZeroWorkers);
        }
        let chunk_size = chunk_size.min(total_size);
        if usize::try_from(chunk_size).is_err() {
            return Err(ConfigError::ChunkTooLarge(chunk_size));
        }
        Ok(Self {
            total_size,
            chunk_size,
            workers,
        })
    }

    pub fn chunk_count(&self) -> ByteCount {
        self.total_size.div_ceil(self.chunk_size)
    }

    fn queue_capacity(&self) -> usize {
        self.workers * QUEUE_DEPTH_PER_WORKER
    }

    pub fn reorder_window(&self) -> usize {
        self.workers * REORDER_WINDOW_PER_WORKER
    }
}

/// Shared per-run state. `written` only moves after a successful write.
#[derive(Debug)]
pub struct PipelineState {
    total_size: ByteCount,
    written: AtomicU64,
    lifetime: CancellationToken,
    first_error: Mutex<Option<PipelineError>>,
}

impl PipelineState {
    fn new(total_size: ByteCount, lifetime: CancellationToken) -> Self {
        Self {
            total_size,
            written: AtomicU64::new(0),
            lifetime,
            first_error: Mutex::new(None),
        }
    }

    pub fn written(&self) -> ByteCount {
        self.written.load(Ordering::Acquire)
    }

    pub fn total_size(&self) -> ByteCount {
        self.total_size
    }

    pub fn is_cancelled(&self) -> bool {
        self.lifetime.is_cancelled()
    }

    fn add_written(&self, n: ByteCount) {
        self.written.fetch_add(n, Ordering::AcqRel);
    }

    /// Keeps the first error as the cause of the failed run and cancels the
    /// lifetime. Errors raised once the lifetime is already cancelled (a
    /// stop closing the output under the sink, or a second failure) are
    /// only logged.
    fn fail(&self, err: PipelineError) {
        {
            let mut first = self.first_error.lock();
            if first.is_none() && !self.lifetime.is_cancelled() {
                error!("{err}");
                *first = Some(err);
            } else {
                warn!("error while unwinding: {err}");
            }
        }
        self.lifetime.cancel();
    }

    fn take_error(&self) -> Option<PipelineError> {
        self.first_error.lock().take()
    }
}

impl ProgressSource for PipelineState {
    fn written(&self) -> ByteCount {
        PipelineState::written(self)
    }

    fn total(&self) -> ByteCount {
        self.total_size
    }
}

#[derive(Debug)]
pub enum RunOutcome {
    Completed {
        written: ByteCount,
        checksum: ChecksumRecord,
    },
    Failed {
        written: ByteCount,
        error: PipelineError,
    },
    Cancelled {
        written: ByteCount,
    },
}

impl RunOutcome {
    pub fn written(&self) -> ByteCount {
        match self {
            RunOutcome::Completed { written, .. }
            | RunOutcome::Failed { written, .. }
            | RunOutcome::Cancelled { written } => *written,
        }
    }

    pub fn checksum(&self) -> Option<&ChecksumRecord> {
        match self {
            RunOutcome::Completed { checksum, .. } => Some(checksum),
            _ => None,
        }
    }
}

/// One generation run: dispatcher -> workers -> result sink.
pub struct Pipeline<W> {
    config: PipelineConfig,
    generator: Arc<dyn PatternGenerator>,
    writer: Arc<W>,
    pool: Arc<BufferPool>,
    state: Arc<PipelineState>,
}

impl<W: ChunkWriter + 'static> Pipeline<W> {
    pub fn new(
        config: PipelineConfig,
        generator: Arc<dyn PatternGenerator>,
        writer: Arc<W>,
        lifetime: CancellationToken,
    ) -> Self {
        // checked by PipelineConfig::new
        let chunk_len = config.chunk_size as usize;
        Self {
            config,
            generator,
            writer,
            pool: Arc::new(BufferPool::new(chunk_len)),
            state: Arc::new(PipelineState::new(config.total_size, lifetime)),
        }
    }

    pub fn state(&self) -> Arc<PipelineState> {
        self.state.clone()
    }

    pub fn buffer_pool(&self) -> Arc<BufferPool> {
        self.pool.clone()
    }

    pub async fn run(self) -> RunOutcome {
        let config = self.config;
        let lifetime = self.state.lifetime.clone();
        debug!(
            "generating {} bytes in {} chunks with {} workers ({})",
            config.total_size,
            config.chunk_count(),
            config.workers,
            self.generator.name()
        );

        let (s_work, r_work) = async_channel::bounded::<WorkItem>(config.queue_capacity());
        let (s_results, r_results) = mpsc::channel::<ResultItem>(config.queue_capacity());
        let (s_errors, r_errors) = mpsc::channel::<GenerateError>(config.workers);
        let window = Arc::new(Semaphore::new(config.reorder_window()));

        let mut handles = vec![spawn_dispatcher(
            config.total_size,
            config.chunk_size,
            s_work,
            window.clone(),
            lifetime.clone(),
        )];
        for id in 0..config.workers {
            handles.push(spawn_worker(
                id,
                r_work.clone(),
                s_results.clone(),
                s_errors.clone(),
                self.generator.clone(),
                self.pool.clone(),
                lifetime.clone(),
            ));
        }
        drop(r_work);
        drop(s_results);
        drop(s_errors);

        let monitor = spawn_error_monitor(r_errors, self.state.clone());

        let checksum = run_sink(r_results, &*self.writer, &self.pool, &window, &self.state).await;

        for res in futures::future::join_all(handles).await {
            if let Err(e) = res {
                self.state.fail(PipelineError::Join(e.to_string()));
            }
        }
        if let Err(e) = monitor.await {
            self.state.fail(PipelineError::Join(e.to_string()));
        }

        let written = self.state.written();
        if let Some(error) = self.state.take_error() {
            return RunOutcome::Failed { written, error };
        }
        match checksum {
            Some(acc) if !lifetime.is_cancelled() => match acc.finalize() {
                Ok(checksum) => {
                    debug!("generation complete, {written} bytes written");
                    RunOutcome::Completed { written, checksum }
                }
                Err(e) => RunOutcome::Failed {
                    written,
                    error: e.into(),
                },
            },
            _ => {
                debug!("generation cancelled after {written} bytes");
                RunOutcome::Cancelled { written }
            }
        }
    }
}

fn spawn_worker(
    id: usize,
    r_work: async_channel::Receiver<WorkItem>,
    s_results: mpsc::Sender<ResultItem>,
    s_errors: mpsc::Sender<GenerateError>,
    generator: Arc<dyn PatternGenerator>,
    pool: Arc<BufferPool>,
    lifetime: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let work = tokio::select! {
                biased;
                _ = lifetime.cancelled() => break,
                work = r_work.recv() => match work {
                    Ok(work) => work,
                    Err(_) => break,
                },
            };

            let buffer = tokio::select! {
                biased;
                _ = lifetime.cancelled() => break,
                buffer = pool.acquire(work.length as usize) => buffer,
            };

            let gen = generator.clone();
            let filled = tokio::task::spawn_blocking(move || {
                let mut buffer = buffer;
                let res = gen.generate(&mut buffer);
                (buffer, res)
            })
            .await;

            let buffer = match filled {
                Ok((buffer, Ok(()))) => buffer,
                Ok((buffer, Err(e))) => {
                    pool.release(buffer);
                    report_failure(&s_errors, e, &lifetime);
                    break;
                }
                Err(join_err) => {
                    // the buffer went down with the blocking task
                    pool.mark_lost();
                    report_failure(
                        &s_errors,
                        GenerateError::WorkerPanicked(join_err.to_string()),
                        &lifetime,
                    );
                    break;
                }
            };

            let permit = tokio::select! {
                biased;
                _ = lifetime.cancelled() => None,
                permit = s_results.reserve() => permit.ok(),
            };
            let Some(permit) = permit else {
                pool.release(buffer);
                break;
            };
            permit.send(ResultItem {
                buffer,
                offset: work.offset,
            });
        }
        debug!("worker {id} exiting");
    })
}

/// Hands the error to the monitor, which records it and cancels the
/// lifetime.
fn report_failure(
    s_errors: &mpsc::Sender<GenerateError>,
    err: GenerateError,
    lifetime: &CancellationToken,
) {
    // capacity equals the worker count and each worker reports at most once
    if let Err(e) = s_errors.try_send(err) {
        warn!("could not report worker error: {e}");
        lifetime.cancel();
    }
}

fn spawn_error_monitor(
    mut r_errors: mpsc::Receiver<GenerateError>,
    state: Arc<PipelineState>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(err) = r_errors.recv().await {
            state.fail(err.into());
        }
    })
}

/// Drains results until every worker is done or the lifetime ends. Returns
/// the checksum state only if the queue was drained without cancellation.
///
/// Every chunk hashed in order gives its dispatch permit back to `window`.
async fn run_sink<W: ChunkWriter>(
    mut r_results: mpsc::Receiver<ResultItem>,
    writer: &W,
    pool: &BufferPool,
    window: &Semaphore,
    state: &PipelineState,
) -> Option<ChecksumAccumulator> {
    let mut checksum = ChecksumAccumulator::new(state.total_size);
    let mut drained = false;

    loop {
        let result = tokio::select! {
            biased;
            _ = state.lifetime.cancelled() => break,
            result = r_results.recv() => match result {
                Some(result) => result,
                None => {
                    drained = true;
                    break;
                }
            },
        };

        let ResultItem { buffer, offset } = result;
        let len = buffer.len() as ByteCount;
        if let Err(e) = checksum.check(offset, len) {
            pool.release(buffer);
            state.fail(e.into());
            break;
        }
        if let Err(e) = writer.write_at(&buffer, offset).await {
            pool.release(buffer);
            state.fail(e.into());
            break;
        }
        state.add_written(len);

        let ready = checksum.fold(offset, buffer);
        let hashed = ready.len();
        for buffer in ready {
            pool.release(buffer);
        }
        window.add_permits(hashed);
    }

    // anything still queued or parked goes back to the pool; recv keeps
    // yielding until outstanding permits are used up
    r_results.close();
    while let Some(result) = r_results.recv().await {
        pool.release(result.buffer);
    }
    for parked in checksum.discard() {
        pool.release(parked);
    }

    if drained && !state.is_cancelled() {
        Some(checksum)
    } else {
        None
    }
}

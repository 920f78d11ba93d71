use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use circular_buffer::CircularBuffer;

use indicatif::{MultiProgress, ProgressBar, ProgressState, ProgressStyle};

use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::shared_types::ByteCount;
use crate::size_utils::format_throughput;

/// Targets at least this large get a progress bar even without `--verbose`.
pub const PROGRESS_THRESHOLD: ByteCount = 1 << 30;

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Anything that can tell how far a run has come.
pub trait ProgressSource: Send + Sync {
    fn written(&self) -> ByteCount;

    fn total(&self) -> ByteCount;

    fn path(&self) -> Option<&Path> {
        None
    }
}

pub struct ProgressReporter {
    source: Arc<dyn ProgressSource>,
    multi_progress: MultiProgress,
    visible: bool,
    stop: CancellationToken,
}

impl ProgressReporter {
    pub fn new(source: Arc<dyn ProgressSource>, multi_progress: MultiProgress, verbose: bool) -> Self {
        let visible = verbose || source.total() >= PROGRESS_THRESHOLD;
        Self {
            source,
            multi_progress,
            visible,
            stop: CancellationToken::new(),
        }
    }

    pub fn is_visible(&self) -> bool {
        self.visible
    }

    /// Token that ends the reporter; it prints its final line on the way out.
    pub fn stop_token(&self) -> CancellationToken {
        self.stop.clone()
    }

    pub fn spawn(self) -> JoinHandle<()> {
        let pb = if self.visible {
            self.multi_progress.add(ProgressBar::new(self.source.total()))
        } else {
            ProgressBar::hidden()
        };
        spawn_progress_reporter(self.source, pb, self.stop)
    }
}

fn bar_style() -> ProgressStyle {
    ProgressStyle::with_template(
        "{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {bytes}/{total_bytes} ({eta}) ({msg})",
    )
    .unwrap_or_else(|_| ProgressStyle::default_bar())
    .with_key("eta", |state: &ProgressState, w: &mut dyn std::fmt::Write| {
        write!(w, "{:.1}s", state.eta().as_secs_f64()).ok();
    })
    .progress_chars("#>-")
}

pub(crate) fn spawn_progress_reporter(
    source: Arc<dyn ProgressSource>,
    pb: ProgressBar,
    stop: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        type ProgressPoint = (ByteCount, Instant);
        let mut window = CircularBuffer::<50, ProgressPoint>::new();
        pb.set_style(bar_style());

        let mut ticker = tokio::time::interval(POLL_INTERVAL);
        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let written = source.written();
            pb.set_position(written);
            window.push_back((written, Instant::now()));

            if let (Some((latest_byte, latest_instant)), Some((oldest_byte, oldest_instant))) =
                (window.back(), window.front())
            {
                if latest_byte == oldest_byte {
                    continue;
                }
                let speed = (latest_byte - oldest_byte) as f64
                    / latest_instant.duration_since(*oldest_instant).as_secs_f64();
                pb.set_message(format_throughput(speed));
            }
        }

        let written = source.written();
        pb.set_position(written);
        let elapsed = pb.elapsed().as_secs_f64();
        let speed = if elapsed > 0.0 {
            written as f64 / elapsed
        } else {
            0.0
        };
        pb.finish_with_message(format!("average {}", format_throughput(speed)));
    })
}

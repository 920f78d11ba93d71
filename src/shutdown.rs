use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::progress_reporter::ProgressSource;
use crate::shared_types::ByteCount;
use crate::size_utils::format_bytes;

pub type CleanupError = Box<dyn std::error::Error + Send + Sync>;
type CleanupAction = Box<dyn FnOnce() -> BoxFuture<'static, Result<(), CleanupError>> + Send>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ShutdownState {
    Running,
    ShuttingDown,
    Done,
}

impl ShutdownState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => ShutdownState::Running,
            1 => ShutdownState::ShuttingDown,
            _ => ShutdownState::Done,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ShutdownReason {
    /// Interrupt from the OS, with the signal name.
    Signal(&'static str),
    /// A pipeline component failed.
    Failure,
    /// Explicit stop call, or the lifetime cancelled by its owner.
    Requested,
}

impl fmt::Display for ShutdownReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShutdownReason::Signal(name) => write!(f, "received {name}"),
            ShutdownReason::Failure => f.write_str("component failure"),
            ShutdownReason::Requested => f.write_str("stop requested"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PartialProgress {
    pub written: ByteCount,
    pub total: ByteCount,
}

#[derive(Debug)]
pub struct CleanupFailure {
    pub name: String,
    pub error: CleanupError,
}

#[derive(Debug)]
pub struct ShutdownReport {
    pub reason: ShutdownReason,
    pub progress: Option<PartialProgress>,
    pub cleanup_errors: Vec<CleanupFailure>,
}

/// Owns the lifetime shared by every stage of a run and tears it down once.
///
/// `Running -> ShuttingDown -> Done`. The first stop (signal, failure or
/// explicit call) cancels the lifetime, reports partial progress and runs the
/// registered cleanups newest first. Later stops are no-ops.
pub struct ShutdownCoordinator {
    lifetime: CancellationToken,
    state: AtomicU8,
    cleanups: Mutex<Vec<(String, CleanupAction)>>,
    progress: Mutex<Option<Arc<dyn ProgressSource>>>,
    done: watch::Sender<Option<Arc<ShutdownReport>>>,
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        let (done, _) = watch::channel(None);
        Self {
            lifetime: CancellationToken::new(),
            state: AtomicU8::new(ShutdownState::Running as u8),
            cleanups: Mutex::new(Vec::new()),
            progress: Mutex::new(None),
            done,
        }
    }

    pub fn token(&self) -> CancellationToken {
        self.lifetime.clone()
    }

    pub fn state(&self) -> ShutdownState {
        ShutdownState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_shutdown(&self) -> bool {
        self.state() != ShutdownState::Running
    }

    /// Registers an action for shutdown. Actions run in reverse registration
    /// order; their errors are collected, never raised.
    pub fn register_cleanup<F, Fut>(&self, name: impl Into<String>, action: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), CleanupError>> + Send + 'static,
    {
        let name = name.into();
        if self.is_shutdown() {
            warn!("shutdown already started, not registering cleanup {name}");
            return;
        }
        self.cleanups
            .lock()
            .push((name, Box::new(move || action().boxed())));
    }

    pub fn set_progress_source(&self, source: Arc<dyn ProgressSource>) {
        *self.progress.lock() = Some(source);
    }

    /// Starts shutdown. Only the call that wins the transition does the
    /// work and gets the report back; every other call returns `None`.
    pub async fn stop(&self, reason: ShutdownReason) -> Option<Arc<ShutdownReport>> {
        if self
            .state
            .compare_exchange(
                ShutdownState::Running as u8,
                ShutdownState::ShuttingDown as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            debug!("shutdown already in progress, ignoring {reason}");
            return None;
        }

        info!("shutting down: {reason}");
        self.lifetime.cancel();

        let progress = self.progress.lock().clone().map(report_partial_progress);

        let mut cleanups = std::mem::take(&mut *self.cleanups.lock());
        let mut cleanup_errors = vec![];
        if !cleanups.is_empty() {
            info!("cleaning up resources...");
        }
        while let Some((name, action)) = cleanups.pop() {
            debug!("running cleanup {name}");
            if let Err(error) = action().await {
                warn!("cleanup {name} failed: {error}");
                cleanup_errors.push(CleanupFailure { name, error });
            }
        }

        let report = Arc::new(ShutdownReport {
            reason,
            progress,
            cleanup_errors,
        });
        self.state
            .store(ShutdownState::Done as u8, Ordering::Release);
        self.done.send_replace(Some(report.clone()));
        debug!("shutdown complete");
        Some(report)
    }

    /// Resolves once shutdown has run every cleanup.
    pub async fn wait(&self) -> Arc<ShutdownReport> {
        let mut rx = self.done.subscribe();
        loop {
            let current = rx.borrow_and_update().clone();
            if let Some(report) = current {
                return report;
            }
            // the sender lives in `self`, so this only fails if `self` is gone
            if rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }

    /// Spawns the task that turns an interrupt (Ctrl-C, or SIGTERM on unix)
    /// or a cancelled lifetime into a shutdown.
    ///
    /// Components that can fail should run on a child of [`Self::token`] and
    /// report failures through [`Self::stop`], so cancelling the lifetime
    /// itself always means the owner asked for it.
    pub fn listen_for_signals(self: &Arc<Self>) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            let reason = tokio::select! {
                name = wait_for_signal() => ShutdownReason::Signal(name),
                _ = this.lifetime.cancelled() => ShutdownReason::Requested,
            };
            if let ShutdownReason::Signal(name) = reason {
                warn!("received {name}, shutting down gracefully...");
            }
            this.stop(reason).await;
        })
    }
}

fn report_partial_progress(source: Arc<dyn ProgressSource>) -> PartialProgress {
    let written = source.written();
    let total = source.total();
    if total > 0 {
        let percent = written as f64 / total as f64 * 100.0;
        info!("operation interrupted at {percent:.2}% completion");
        info!("written: {} / {}", format_bytes(written), format_bytes(total));
        if let (true, Some(path)) = (written > 0, source.path()) {
            info!("partial file saved to: {}", path.display());
        }
    } else {
        info!("operation interrupted before any data was written");
    }
    PartialProgress { written, total }
}

#[cfg(unix)]
async fn wait_for_signal() -> &'static str {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut term) => tokio::select! {
            _ = tokio::signal::ctrl_c() => "SIGINT",
            _ = term.recv() => "SIGTERM",
        },
        Err(e) => {
            warn!("cannot listen for SIGTERM: {e}");
            ctrl_c_or_pending().await
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() -> &'static str {
    ctrl_c_or_pending().await
}

async fn ctrl_c_or_pending() -> &'static str {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("cannot listen for Ctrl-C: {e}");
        std::future::pending::<()>().await;
    }
    "SIGINT"
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use super::*;

    struct Fixed(ByteCount, ByteCount);

    impl ProgressSource for Fixed {
        fn written(&self) -> ByteCount {
            self.0
        }

        fn total(&self) -> ByteCount {
            self.1
        }
    }

    #[tokio::test]
    async fn cleanups_run_newest_first() {
        let coordinator = ShutdownCoordinator::new();
        let order = Arc::new(Mutex::new(vec![]));
        for i in 0..3 {
            let order = order.clone();
            coordinator.register_cleanup(format!("step {i}"), move || async move {
                order.lock().push(i);
                Ok::<(), CleanupError>(())
            });
        }

        let report = coordinator.stop(ShutdownReason::Requested).await.unwrap();
        assert_eq!(*order.lock(), vec![2, 1, 0]);
        assert!(report.cleanup_errors.is_empty());
        assert_eq!(coordinator.state(), ShutdownState::Done);
        assert!(coordinator.token().is_cancelled());
    }

    #[tokio::test]
    async fn concurrent_stops_clean_up_once() {
        let coordinator = Arc::new(ShutdownCoordinator::new());
        let runs = Arc::new(AtomicUsize::new(0));
        {
            let runs = runs.clone();
            coordinator.register_cleanup("count", move || async move {
                runs.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                Ok::<(), CleanupError>(())
            });
        }

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let c = coordinator.clone();
                tokio::spawn(async move { c.stop(ShutdownReason::Requested).await.is_some() })
            })
            .collect();
        let winners = futures::future::join_all(handles)
            .await
            .into_iter()
            .filter(|r| *r.as_ref().unwrap())
            .count();

        assert_eq!(winners, 1);
        coordinator.wait().await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert!(coordinator.stop(ShutdownReason::Requested).await.is_none());
    }

    #[tokio::test]
    async fn cleanup_errors_are_collected() {
        let coordinator = ShutdownCoordinator::new();
        let ran_after = Arc::new(AtomicUsize::new(0));
        {
            let ran_after = ran_after.clone();
            coordinator.register_cleanup("first", move || async move {
                ran_after.fetch_add(1, Ordering::SeqCst);
                Ok::<(), CleanupError>(())
            });
        }
        coordinator.register_cleanup("broken", || async { Err::<(), CleanupError>("disk gone".into()) });

        let report = coordinator.stop(ShutdownReason::Failure).await.unwrap();
        assert_eq!(report.cleanup_errors.len(), 1);
        assert_eq!(report.cleanup_errors[0].name, "broken");
        assert_eq!(ran_after.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn wait_blocks_until_done() {
        let coordinator = Arc::new(ShutdownCoordinator::new());
        coordinator.register_cleanup("slow", || async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok::<(), CleanupError>(())
        });

        let waiter = {
            let c = coordinator.clone();
            tokio::spawn(async move { c.wait().await.reason.clone() })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());
        assert_eq!(coordinator.state(), ShutdownState::Running);

        coordinator.stop(ShutdownReason::Requested).await;
        let reason = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reason, ShutdownReason::Requested);
    }

    #[tokio::test]
    async fn reports_partial_progress() {
        let coordinator = ShutdownCoordinator::new();
        coordinator.set_progress_source(Arc::new(Fixed(300, 1000)));

        let report = coordinator.stop(ShutdownReason::Requested).await.unwrap();
        assert_eq!(
            report.progress,
            Some(PartialProgress {
                written: 300,
                total: 1000
            })
        );
    }

    #[tokio::test]
    async fn cancelled_lifetime_triggers_shutdown() {
        let coordinator = Arc::new(ShutdownCoordinator::new());
        let listener = coordinator.listen_for_signals();

        coordinator.token().cancel();
        let report = tokio::time::timeout(Duration::from_secs(1), coordinator.wait())
            .await
            .unwrap();
        assert_eq!(report.reason, ShutdownReason::Requested);
        listener.await.unwrap();
    }

    #[tokio::test]
    async fn child_cancel_does_not_trigger_shutdown() {
        let coordinator = Arc::new(ShutdownCoordinator::new());
        let listener = coordinator.listen_for_signals();

        coordinator.token().child_token().cancel();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(coordinator.state(), ShutdownState::Running);

        let report = coordinator.stop(ShutdownReason::Failure).await.unwrap();
        assert_eq!(report.reason, ShutdownReason::Failure);
        listener.await.unwrap();
    }

    #[tokio::test]
    async fn late_registration_is_ignored() {
        let coordinator = ShutdownCoordinator::new();
        coordinator.stop(ShutdownReason::Requested).await;

        let ran = Arc::new(AtomicUsize::new(0));
        let r = ran.clone();
        coordinator.register_cleanup("late", move || async move {
            r.fetch_add(1, Ordering::SeqCst);
            Ok::<(), CleanupError>(())
        });
        assert!(coordinator.stop(ShutdownReason::Requested).await.is_none());
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }
}

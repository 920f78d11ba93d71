use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::shared_types::{ByteCount, WorkItem};

/// Consecutive, disjoint ranges covering `[0, total)`; the last one is
/// truncated to whatever remains.
pub fn work_items(total: ByteCount, chunk: ByteCount) -> impl Iterator<Item = WorkItem> {
    let chunk = chunk.max(1);
    let count = total.div_ceil(chunk);
    (0..count).map(move |i| {
        let offset = i * chunk;
        WorkItem {
            offset,
            length: chunk.min(total - offset),
        }
    })
}

/// Feeds the work queue until every range is sent or the lifetime ends.
/// Dropping the sender on return closes the queue for the workers.
///
/// Each item takes one permit out of `window` first. The permit is not
/// returned here: the sink adds it back once the chunk has been hashed in
/// offset order, which caps how far generation can run ahead of the oldest
/// unfinished chunk.
pub async fn dispatch(
    total: ByteCount,
    chunk: ByteCount,
    s_work: async_channel::Sender<WorkItem>,
    window: Arc<Semaphore>,
    lifetime: CancellationToken,
) -> usize {
    let mut sent = 0;
    for item in work_items(total, chunk) {
        tokio::select! {
            biased;
            _ = lifetime.cancelled() => {
                debug!("dispatcher cancelled after {sent} work items");
                return sent;
            }
            permit = window.acquire() => match permit {
                Ok(permit) => permit.forget(),
                Err(_) => {
                    debug!("reorder window closed, dispatcher stopping");
                    return sent;
                }
            },
        }
        tokio::select! {
            biased;
            _ = lifetime.cancelled() => {
                debug!("dispatcher cancelled after {sent} work items");
                return sent;
            }
            res = s_work.send(item) => {
                if res.is_err() {
                    debug!("work queue closed, dispatcher stopping");
                    return sent;
                }
                sent += 1;
            }
        }
    }
    debug!("dispatched all {sent} work items");
    sent
}

pub fn spawn_dispatcher(
    total: ByteCount,
    chunk: ByteCount,
    s_work: async_channel::Sender<WorkItem>,
    window: Arc<Semaphore>,
    lifetime: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        dispatch(total, chunk, s_work, window, lifetime).await;
    })
}

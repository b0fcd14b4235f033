use crate::estimator::WaitTimeEstimator;
use crate::families::ModelFamily;
use crate::keys::KeyPool;
use crate::queue::{RequestQueue, Resume};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::sleep;

/// One pass over all partitions: where the key pool reports no lockout, the
/// oldest eligible waiter is resumed. Tickets whose client already vanished
/// are skipped so an available key is not wasted on a dead connection.
pub async fn dispatch_tick(queue: &RequestQueue, keys: &KeyPool) {
    for family in ModelFamily::ALL {
        if !keys.lockout_period(family).await.is_zero() {
            continue;
        }
        while let Some(entry) = queue.dequeue(family).await {
            let id = entry.id;
            if entry.resume.send(Resume::Dispatch).is_ok() {
                tracing::debug!("dispatched ticket {} in {}", id, family);
                break;
            }
            tracing::debug!("ticket {} abandoned before dispatch", id);
        }
    }
}

/// Rate-limit lockouts expire on wall time, not on an event, so the
/// dispatcher polls. 50 ms is invisible at human scale and bounds CPU.
pub fn spawn_dispatcher(
    queue: Arc<RequestQueue>,
    keys: Arc<KeyPool>,
    tick: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            sleep(tick).await;
            dispatch_tick(&queue, &keys).await;
        }
    })
}

/// Expires tickets stuck in the queue past the stall timeout and prunes old
/// wait samples on the same cadence.
pub fn spawn_stall_sweep(
    queue: Arc<RequestQueue>,
    estimator: Arc<WaitTimeEstimator>,
    interval: Duration,
    stall_timeout: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            sleep(interval).await;
            let expired = queue.sweep_stalled(stall_timeout).await;
            for entry in expired {
                tracing::warn!(
                    "ticket {} from {} expired after {:?} in queue",
                    entry.id,
                    entry.identity,
                    stall_timeout
                );
                let _ = entry.resume.send(Resume::Expired);
            }
            estimator.prune().await;
        }
    })
}

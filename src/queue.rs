use crate::auth::Identity;
use crate::families::ModelFamily;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{oneshot, Mutex};
use uuid::Uuid;

/// Signal delivered on a ticket's resume channel.
#[derive(Debug, PartialEq, Eq)]
pub enum Resume {
    /// A key should be available; proceed with the upstream call.
    Dispatch,
    /// The stall sweep expired the ticket.
    Expired,
}

#[derive(Debug, thiserror::Error)]
pub enum EnqueueError {
    #[error("{identity} already has a request in the queue")]
    TooManyQueued { identity: Identity },
    #[error("ticket is already queued")]
    Duplicate,
}

/// What the queue holds: the scheduling-relevant slice of a ticket plus the
/// channel that wakes its waiting handler.
#[derive(Debug)]
pub struct QueuedEntry {
    pub id: Uuid,
    pub identity: Identity,
    pub family: ModelFamily,
    pub deprioritized: bool,
    /// Retries bypass the identity concurrency cap.
    pub retry: bool,
    pub started_at: Instant,
    pub resume: oneshot::Sender<Resume>,
}

/// Single shared list of waiting tickets, sharded by partition through the
/// predicates on `dequeue`/`depth`. A ticket appears at most once.
pub struct RequestQueue {
    entries: Mutex<Vec<QueuedEntry>>,
}

impl RequestQueue {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
        }
    }

    pub async fn enqueue(&self, entry: QueuedEntry) -> Result<(), EnqueueError> {
        let mut entries = self.entries.lock().await;
        if entries.iter().any(|e| e.id == entry.id) {
            return Err(EnqueueError::Duplicate);
        }
        if !entry.retry {
            let active = entries
                .iter()
                .filter(|e| e.identity == entry.identity && !e.retry)
                .count();
            if active >= entry.identity.concurrency_cap() {
                tracing::warn!("queue admission rejected for {}", entry.identity);
                metrics::counter!("keymux_queue_rejections_total").increment(1);
                return Err(EnqueueError::TooManyQueued {
                    identity: entry.identity,
                });
            }
        }
        entries.push(entry);
        Ok(())
    }

    /// Oldest eligible ticket for the partition. Deprioritized waiters only
    /// go once no regular waiter remains.
    pub async fn dequeue(&self, family: ModelFamily) -> Option<QueuedEntry> {
        let mut entries = self.entries.lock().await;
        let idx = entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.family == family)
            .min_by_key(|(_, e)| (e.deprioritized, e.started_at))
            .map(|(i, _)| i)?;
        Some(entries.remove(idx))
    }

    /// Idempotent removal, used by abort hooks.
    pub async fn remove(&self, id: Uuid) -> bool {
        let mut entries = self.entries.lock().await;
        let before = entries.len();
        entries.retain(|e| e.id != id);
        entries.len() != before
    }

    pub async fn depth(&self, family: ModelFamily) -> usize {
        let entries = self.entries.lock().await;
        entries.iter().filter(|e| e.family == family).count()
    }

    pub async fn total_depth(&self) -> usize {
        self.entries.lock().await.len()
    }

    /// Pulls out every ticket older than `max_age`; the caller terminates
    /// them with a queue-timeout response.
    pub async fn sweep_stalled(&self, max_age: Duration) -> Vec<QueuedEntry> {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        let mut expired = Vec::new();
        let mut i = 0;
        while i < entries.len() {
            if now.duration_since(entries[i].started_at) > max_age {
                expired.push(entries.remove(i));
            } else {
                i += 1;
            }
        }
        expired
    }
}

impl Default for RequestQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// Removes the ticket from the queue if the owning handler goes away before
/// it was dequeued, e.g. because the client closed the connection.
pub struct QueueGuard {
    queue: Arc<RequestQueue>,
    id: Uuid,
    armed: bool,
}

impl QueueGuard {
    pub fn new(queue: Arc<RequestQueue>, id: Uuid) -> Self {
        Self {
            queue,
            id,
            armed: true,
        }
    }

    pub fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for QueueGuard {
    fn drop(&mut self) {
        if self.armed {
            let queue = self.queue.clone();
            let id = self.id;
            tokio::spawn(async move {
                queue.remove(id).await;
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::IpAddr;

    fn ip(last: u8) -> Identity {
        Identity::Ip(IpAddr::from([10, 0, 0, last]))
    }

    fn shared(last: u8) -> Identity {
        Identity::SharedIp(IpAddr::from([9, 9, 9, last]))
    }

    fn entry(
        identity: Identity,
        family: ModelFamily,
        retry: bool,
        started_at: Instant,
    ) -> (QueuedEntry, oneshot::Receiver<Resume>) {
        let (tx, rx) = oneshot::channel();
        let deprioritized = identity.deprioritized();
        (
            QueuedEntry {
                id: Uuid::new_v4(),
                identity,
                family,
                deprioritized,
                retry,
                started_at,
                resume: tx,
            },
            rx,
        )
    }

    #[tokio::test]
    async fn identity_cap_rejects_second_request() {
        let queue = RequestQueue::new();
        let now = Instant::now();
        let (first, _rx1) = entry(ip(1), ModelFamily::Turbo, false, now);
        let (second, _rx2) = entry(ip(1), ModelFamily::Turbo, false, now);
        queue.enqueue(first).await.expect("first enqueue");
        let err = queue.enqueue(second).await.expect_err("cap");
        assert!(err.to_string().contains("already has a request in the queue"));
    }

    #[tokio::test]
    async fn shared_identity_cap_is_five() {
        let queue = RequestQueue::new();
        let now = Instant::now();
        for _ in 0..5 {
            let (e, _rx) = entry(shared(1), ModelFamily::Turbo, false, now);
            queue.enqueue(e).await.expect("within cap");
        }
        let (sixth, _rx) = entry(shared(1), ModelFamily::Turbo, false, now);
        assert!(queue.enqueue(sixth).await.is_err());
    }

    #[tokio::test]
    async fn retries_are_exempt_from_cap() {
        let queue = RequestQueue::new();
        let now = Instant::now();
        let (first, _rx1) = entry(ip(1), ModelFamily::Turbo, false, now);
        let (retry, _rx2) = entry(ip(1), ModelFamily::Turbo, true, now);
        queue.enqueue(first).await.expect("first");
        queue.enqueue(retry).await.expect("retry exempt");
    }

    #[tokio::test]
    async fn duplicate_ticket_is_rejected() {
        let queue = RequestQueue::new();
        let now = Instant::now();
        let (first, _rx) = entry(ip(1), ModelFamily::Turbo, false, now);
        let id = first.id;
        queue.enqueue(first).await.expect("first");
        let (tx, _rx2) = oneshot::channel();
        let dup = QueuedEntry {
            id,
            identity: ip(2),
            family: ModelFamily::Turbo,
            deprioritized: false,
            retry: false,
            started_at: now,
            resume: tx,
        };
        assert!(matches!(
            queue.enqueue(dup).await,
            Err(EnqueueError::Duplicate)
        ));
    }

    #[tokio::test]
    async fn regular_waiters_dequeue_before_shared_even_if_later() {
        let queue = RequestQueue::new();
        let base = Instant::now();
        for i in 0..5u8 {
            let (e, _rx) = entry(
                shared(1),
                ModelFamily::Turbo,
                false,
                base + Duration::from_millis(i as u64),
            );
            queue.enqueue(e).await.expect("shared enqueue");
        }
        let (regular, _rx) = entry(
            ip(1),
            ModelFamily::Turbo,
            false,
            base + Duration::from_millis(100),
        );
        let regular_id = regular.id;
        queue.enqueue(regular).await.expect("regular enqueue");

        let first = queue.dequeue(ModelFamily::Turbo).await.expect("dequeue");
        assert_eq!(first.id, regular_id);
        let second = queue.dequeue(ModelFamily::Turbo).await.expect("dequeue");
        assert!(second.deprioritized);
    }

    #[tokio::test]
    async fn dequeue_is_fifo_within_tier() {
        let queue = RequestQueue::new();
        let base = Instant::now();
        let (a, _rxa) = entry(ip(1), ModelFamily::Claude, false, base);
        let (b, _rxb) = entry(ip(2), ModelFamily::Claude, false, base + Duration::from_millis(1));
        let a_id = a.id;
        queue.enqueue(b).await.expect("b");
        queue.enqueue(a).await.expect("a");
        assert_eq!(queue.dequeue(ModelFamily::Claude).await.expect("first").id, a_id);
    }

    #[tokio::test]
    async fn dequeue_respects_partition() {
        let queue = RequestQueue::new();
        let (e, _rx) = entry(ip(1), ModelFamily::Claude, false, Instant::now());
        queue.enqueue(e).await.expect("enqueue");
        assert!(queue.dequeue(ModelFamily::Turbo).await.is_none());
        assert!(queue.dequeue(ModelFamily::Claude).await.is_some());
    }

    #[tokio::test]
    async fn remove_is_idempotent() {
        let queue = RequestQueue::new();
        let (e, _rx) = entry(ip(1), ModelFamily::Turbo, false, Instant::now());
        let id = e.id;
        queue.enqueue(e).await.expect("enqueue");
        assert!(queue.remove(id).await);
        assert!(!queue.remove(id).await);
        assert_eq!(queue.depth(ModelFamily::Turbo).await, 0);
    }

    #[tokio::test]
    async fn abort_then_resubmit_succeeds() {
        let queue = RequestQueue::new();
        let (e, _rx) = entry(ip(1), ModelFamily::Turbo, false, Instant::now());
        let id = e.id;
        queue.enqueue(e).await.expect("enqueue");
        queue.remove(id).await;
        let (again, _rx2) = entry(ip(1), ModelFamily::Turbo, false, Instant::now());
        queue.enqueue(again).await.expect("resubmit after abort");
    }

    #[tokio::test]
    async fn sweep_expires_only_stalled_entries() {
        let queue = RequestQueue::new();
        let (old, mut old_rx) = entry(ip(1), ModelFamily::Turbo, false, Instant::now());
        queue.enqueue(old).await.expect("old");
        tokio::time::sleep(Duration::from_millis(50)).await;
        let (fresh, _fresh_rx) = entry(ip(2), ModelFamily::Turbo, false, Instant::now());
        queue.enqueue(fresh).await.expect("fresh");

        let expired = queue.sweep_stalled(Duration::from_millis(25)).await;
        assert_eq!(expired.len(), 1);
        for entry in expired {
            let _ = entry.resume.send(Resume::Expired);
        }
        assert!(matches!(old_rx.try_recv(), Ok(Resume::Expired)));
        assert_eq!(queue.depth(ModelFamily::Turbo).await, 1);
    }
}

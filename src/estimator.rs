use crate::families::ModelFamily;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

#[derive(Debug, Clone, Copy)]
pub struct WaitSample {
    pub family: ModelFamily,
    pub start: Instant,
    pub end: Instant,
    pub deprioritized: bool,
}

/// Rolling average of recent queue waits, reported in heartbeat frames so
/// streaming clients know roughly how long they will sit in the queue.
pub struct WaitTimeEstimator {
    retention: Duration,
    samples: Mutex<Vec<WaitSample>>,
}

impl WaitTimeEstimator {
    pub fn new(retention: Duration) -> Self {
        Self {
            retention,
            samples: Mutex::new(Vec::new()),
        }
    }

    pub async fn record(&self, sample: WaitSample) {
        let mut samples = self.samples.lock().await;
        samples.push(sample);
    }

    /// Average wait across retained samples for the partition, excluding
    /// deprioritized waiters. Zero when nothing has completed recently.
    pub async fn estimate(&self, family: ModelFamily) -> Duration {
        let cutoff = Instant::now().checked_sub(self.retention);
        let samples = self.samples.lock().await;
        let mut total = Duration::ZERO;
        let mut count = 0u32;
        for sample in samples.iter() {
            if sample.family != family || sample.deprioritized {
                continue;
            }
            if let Some(cutoff) = cutoff {
                if sample.end < cutoff {
                    continue;
                }
            }
            total += sample.end.saturating_duration_since(sample.start);
            count += 1;
        }
        if count == 0 {
            Duration::ZERO
        } else {
            total / count
        }
    }

    /// Retained samples for the partition, deprioritized waiters included.
    pub async fn sample_count(&self, family: ModelFamily) -> usize {
        let samples = self.samples.lock().await;
        samples.iter().filter(|s| s.family == family).count()
    }

    /// Runs with the stall sweep.
    pub async fn prune(&self) {
        let Some(cutoff) = Instant::now().checked_sub(self.retention) else {
            return;
        };
        let mut samples = self.samples.lock().await;
        samples.retain(|s| s.end >= cutoff);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(family: ModelFamily, wait: Duration, deprioritized: bool) -> WaitSample {
        let end = Instant::now();
        WaitSample {
            family,
            start: end.checked_sub(wait).unwrap_or(end),
            end,
            deprioritized,
        }
    }

    #[tokio::test]
    async fn estimate_averages_matching_samples() {
        let est = WaitTimeEstimator::new(Duration::from_secs(300));
        est.record(sample(ModelFamily::Turbo, Duration::from_secs(2), false))
            .await;
        est.record(sample(ModelFamily::Turbo, Duration::from_secs(4), false))
            .await;
        est.record(sample(ModelFamily::Claude, Duration::from_secs(60), false))
            .await;
        let avg = est.estimate(ModelFamily::Turbo).await;
        assert!(avg >= Duration::from_secs(2) && avg <= Duration::from_secs(4));
    }

    #[tokio::test]
    async fn deprioritized_samples_are_excluded() {
        let est = WaitTimeEstimator::new(Duration::from_secs(300));
        est.record(sample(ModelFamily::Turbo, Duration::from_secs(100), true))
            .await;
        assert_eq!(est.estimate(ModelFamily::Turbo).await, Duration::ZERO);
    }

    #[tokio::test]
    async fn empty_partition_estimates_zero() {
        let est = WaitTimeEstimator::new(Duration::from_secs(300));
        assert_eq!(est.estimate(ModelFamily::Gpt4).await, Duration::ZERO);
    }

    #[tokio::test]
    async fn prune_drops_expired_samples() {
        let est = WaitTimeEstimator::new(Duration::ZERO);
        est.record(sample(ModelFamily::Turbo, Duration::from_secs(1), false))
            .await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        est.prune().await;
        assert_eq!(est.estimate(ModelFamily::Turbo).await, Duration::ZERO);
    }
}

//! Minimum-interval pacing for broker calls
//!
//! A `MinIntervalPacer` serializes its callers and guarantees at least
//! `interval` between the moments successive callers are released.

use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

#[derive(Debug)]
pub struct MinIntervalPacer {
    interval: Duration,
    last_release: Mutex<Option<Instant>>,
}

impl MinIntervalPacer {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_release: Mutex::new(None),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Wait until this caller may proceed. The lock is held across the
    /// sleep so concurrent callers queue in order.
    pub async fn wait(&self) {
        let mut last_release = self.last_release.lock().await;
        if let Some(previous) = *last_release {
            let ready_at = previous + self.interval;
            if ready_at > Instant::now() {
                tokio::time::sleep_until(ready_at).await;
            }
        }
        *last_release = Some(Instant::now());
    }

    /// Forget the previous release so the next caller goes immediately
    pub async fn reset(&self) {
        *self.last_release.lock().await = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_first_call_is_immediate() {
        let pacer = MinIntervalPacer::new(Duration::from_secs(5));
        let start = Instant::now();

        pacer.wait().await;

        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_consecutive_calls_are_spaced() {
        let pacer = MinIntervalPacer::new(Duration::from_millis(30));
        let start = Instant::now();

        pacer.wait().await;
        pacer.wait().await;
        pacer.wait().await;

        assert!(start.elapsed() >= Duration::from_millis(60));
    }

    #[tokio::test]
    async fn test_concurrent_callers_are_serialized() {
        let pacer = Arc::new(MinIntervalPacer::new(Duration::from_millis(20)));
        let start = Instant::now();

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let pacer = pacer.clone();
                tokio::spawn(async move { pacer.wait().await })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap();
        }

        assert!(start.elapsed() >= Duration::from_millis(60));
    }

    #[tokio::test]
    async fn test_reset_releases_next_caller() {
        let pacer = MinIntervalPacer::new(Duration::from_secs(5));
        pacer.wait().await;
        pacer.reset().await;
        let start = Instant::now();

        pacer.wait().await;

        assert!(start.elapsed() < Duration::from_secs(1));
    }
}

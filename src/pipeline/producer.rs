//! Synthetic producer.
//!
//! Appends a burst of trade-like values to the queue tail on a fixed period.
//! It has no notion of the drain rate; it exists to load the limiter.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ProducerConfig;
use crate::error::Result;
use crate::store::SharedStore;

/// Counters a producer loop reports when it stops.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProducerStats {
    pub ticks: u64,
    pub pushed: u64,
    pub failed: u64,
}

/// Periodically pushes `burst_size` payloads onto the queue.
pub struct ProducerLoop<S: SharedStore> {
    store: Arc<S>,
    queue_key: String,
    burst_size: usize,
    interval: Duration,
    base_value: f64,
    jitter: f64,
}

impl<S: SharedStore> ProducerLoop<S> {
    pub fn new(store: Arc<S>, queue_key: impl Into<String>, config: &ProducerConfig) -> Self {
        Self {
            store,
            queue_key: queue_key.into(),
            burst_size: config.burst_size,
            interval: config.interval(),
            base_value: config.base_value,
            jitter: config.jitter,
        }
    }

    /// One synthetic value, `base_value ± jitter`, with six decimals.
    pub fn synthesize(&self, rng: &mut impl Rng) -> String {
        let offset = if self.jitter > 0.0 {
            rng.gen_range(-self.jitter..=self.jitter)
        } else {
            0.0
        };
        format!("{:.6}", self.base_value + offset)
    }

    /// Push one burst in a single round trip. Returns the new queue length.
    pub async fn tick(&self) -> Result<u64> {
        let burst: Vec<String> = {
            let mut rng = rand::thread_rng();
            (0..self.burst_size).map(|_| self.synthesize(&mut rng)).collect()
        };
        let len = self.store.push_back(&self.queue_key, &burst).await?;
        debug!(queue_key = %self.queue_key, pushed = burst.len(), queue_len = len, "Pushed burst");
        Ok(len)
    }

    /// Run until `cancel` fires. The first burst goes out one interval after
    /// start; the ticker is released on exit.
    pub async fn run(&self, cancel: CancellationToken) -> ProducerStats {
        let mut stats = ProducerStats::default();
        let mut ticker = tokio::time::interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            queue_key = %self.queue_key,
            burst_size = self.burst_size,
            interval_ms = self.interval.as_millis() as u64,
            "Producer loop started"
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    stats.ticks += 1;
                    match self.tick().await {
                        Ok(_) => stats.pushed += self.burst_size as u64,
                        Err(e) => {
                            stats.failed += 1;
                            warn!(error = %e, "Failed to push burst");
                        }
                    }
                }
            }
        }
        drop(ticker);

        info!(
            ticks = stats.ticks,
            pushed = stats.pushed,
            failed = stats.failed,
            "Producer loop stopped"
        );
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn producer(store: &Arc<MemoryStore>, burst_size: usize) -> ProducerLoop<MemoryStore> {
        let config = ProducerConfig {
            burst_size,
            ..ProducerConfig::default()
        };
        ProducerLoop::new(store.clone(), "jobs", &config)
    }

    #[tokio::test]
    async fn test_tick_pushes_a_full_burst_within_jitter() {
        let store = Arc::new(MemoryStore::new());
        let producer = producer(&store, 200);

        assert_eq!(producer.tick().await.unwrap(), 200);

        let items = store.queue_items("jobs");
        assert_eq!(items.len(), 200);
        for item in items {
            let value: f64 = item.parse().unwrap();
            assert!((195.0..=205.0).contains(&value), "{} out of range", value);
        }
    }

    #[tokio::test]
    async fn test_tick_appends_to_existing_queue() {
        let store = Arc::new(MemoryStore::new());
        store.push_back("jobs", &["first".to_string()]).await.unwrap();

        assert_eq!(producer(&store, 3).tick().await.unwrap(), 4);
        assert_eq!(store.queue_items("jobs")[0], "first");
    }

    #[test]
    fn test_synthesize_format() {
        let store = Arc::new(MemoryStore::new());
        let config = ProducerConfig {
            jitter: 0.0,
            ..ProducerConfig::default()
        };
        let producer = ProducerLoop::new(store, "jobs", &config);

        let mut rng = StdRng::seed_from_u64(1);
        assert_eq!(producer.synthesize(&mut rng), "200.000000");
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_ticks_on_interval_until_cancelled() {
        let store = Arc::new(MemoryStore::new());
        let producer = Arc::new(producer(&store, 10));
        let cancel = CancellationToken::new();

        let handle = {
            let producer = producer.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { producer.run(cancel).await })
        };

        // Nothing before the first interval.
        tokio::time::sleep(Duration::from_secs(4)).await;
        assert_eq!(store.queue_len("jobs").await.unwrap(), 0);

        // Ticks at 5s and 10s.
        tokio::time::sleep(Duration::from_secs(7)).await;
        assert_eq!(store.queue_len("jobs").await.unwrap(), 20);

        cancel.cancel();
        let stats = handle.await.unwrap();
        assert_eq!(
            stats,
            ProducerStats {
                ticks: 2,
                pushed: 20,
                failed: 0,
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_survives_push_failures() {
        let store = Arc::new(MemoryStore::new());
        let producer = Arc::new(producer(&store, 5));
        let cancel = CancellationToken::new();
        store.inject_failures(1);

        let handle = {
            let producer = producer.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { producer.run(cancel).await })
        };
        tokio::time::sleep(Duration::from_secs(11)).await;
        cancel.cancel();

        let stats = handle.await.unwrap();
        assert_eq!(stats.ticks, 2);
        assert_eq!(stats.failed, 1);
        assert_eq!(store.queue_len("jobs").await.unwrap(), 5);
    }
}

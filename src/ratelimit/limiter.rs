//! Sliding-window rate limiter over a shared store.
//!
//! Admission runs in two phases. Phase 1 prunes the log, counts what is left
//! and, below the limit, records the admission, all in one optimistic
//! transaction retried from scratch on conflict. Phase 2, the blocking pop,
//! starts only once phase 1 has committed, so no transaction stays open
//! across the wait. An admission whose wait is cancelled keeps its log entry:
//! the slot is spent without an item, which can only under-use the rate.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};
use uuid::Uuid;

use super::clock::{Clock, SystemClock};
use super::retry::{retry_on_conflict, RetryPolicy};
use super::window::SlidingWindow;
use crate::config::{DrainConfig, LimiterConfig, StoreConfig};
use crate::error::Result;
use crate::store::{LogSnapshot, SharedStore};

/// Default upper bound of a single blocking pop.
const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_secs(1);

/// Outcome of the admission phase alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Admitted,
    Rejected,
}

/// Outcome of a full admit-and-dequeue attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// A slot was taken and this payload popped for it.
    Admitted(String),
    /// The window is full; nothing was popped. Not an error.
    Rejected,
    /// A slot was taken but cancellation arrived before any item did.
    Cancelled,
}

/// Keys and window parameters a limiter is bound to.
#[derive(Debug, Clone)]
pub struct LimiterSettings {
    pub queue_key: String,
    pub log_key: String,
    pub window: SlidingWindow,
    pub retry: RetryPolicy,
    pub poll_timeout: Duration,
}

impl LimiterSettings {
    /// Settings for `queue_key`, with its log at `<queue_key>:log`.
    pub fn new(queue_key: impl Into<String>, window: SlidingWindow) -> Self {
        let queue_key = queue_key.into();
        Self {
            log_key: format!("{}:log", queue_key),
            queue_key,
            window,
            retry: RetryPolicy::default(),
            poll_timeout: DEFAULT_POLL_TIMEOUT,
        }
    }

    pub fn from_config(store: &StoreConfig, limiter: &LimiterConfig, drain: &DrainConfig) -> Self {
        Self {
            queue_key: store.queue_key.clone(),
            log_key: store.log_key(),
            window: SlidingWindow::new(limiter.window(), limiter.rate_limit),
            retry: RetryPolicy::from_max_attempts(limiter.tx_max_attempts),
            poll_timeout: drain.dequeue_poll_timeout(),
        }
    }
}

/// Sliding-window log limiter guarding one queue.
///
/// The limiter keeps no state of its own; every instance, in any process,
/// competes on the same log through the store.
pub struct SlidingWindowLimiter<S: SharedStore> {
    store: Arc<S>,
    clock: Arc<dyn Clock>,
    settings: LimiterSettings,
}

impl<S: SharedStore> SlidingWindowLimiter<S> {
    /// Create a limiter reading the system clock.
    pub fn new(store: Arc<S>, settings: LimiterSettings) -> Self {
        Self {
            store,
            clock: Arc::new(SystemClock::new()),
            settings,
        }
    }

    /// Replace the clock.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn settings(&self) -> &LimiterSettings {
        &self.settings
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Phase 1 at a fixed instant: prune, count and maybe record an admission.
    ///
    /// Retries reuse `now`.
    pub async fn try_admit_at(&self, now: i64) -> Result<Decision> {
        self.admit(|| now).await
    }

    /// Phase 1 at the clock's current time, re-read on every retry.
    pub async fn try_admit(&self) -> Result<Decision> {
        self.admit(|| self.clock.now_nanos()).await
    }

    async fn admit(&self, now: impl Fn() -> i64 + Send + Sync) -> Result<Decision> {
        let settings = &self.settings;
        let store = &self.store;
        let now = &now;

        let write = retry_on_conflict(settings.retry, move || async move {
            let now = now();
            let window = settings.window;
            let body = move |snapshot: LogSnapshot| {
                window.plan(now, snapshot, || Uuid::new_v4().to_string())
            };
            store
                .transact_log(&settings.log_key, window.clear_before(now), &body)
                .await
        })
        .await?;

        match write.insert {
            Some(entry) => {
                trace!(log_key = %settings.log_key, score = entry.score, "Admitted");
                Ok(Decision::Admitted)
            }
            None => {
                debug!(
                    log_key = %settings.log_key,
                    limit = settings.window.limit(),
                    "Rate limit reached"
                );
                Ok(Decision::Rejected)
            }
        }
    }

    /// Phase 2: pop the queue head, waiting as long as it takes.
    ///
    /// Cancellation is checked between bounded polls, so it is honoured within
    /// one poll timeout. A pop in flight is never abandoned, so no item is
    /// lost to cancellation. Returns `None` only when cancelled.
    pub async fn dequeue(&self, cancel: &CancellationToken) -> Result<Option<String>> {
        let settings = &self.settings;
        while !cancel.is_cancelled() {
            if let Some(payload) = self
                .store
                .pop_front(&settings.queue_key, settings.poll_timeout)
                .await?
            {
                return Ok(Some(payload));
            }
            trace!(queue_key = %settings.queue_key, "Queue empty, still waiting");
        }
        Ok(None)
    }

    /// Admit at `now`, then pop one item for the admitted slot.
    pub async fn try_admit_and_dequeue_at(
        &self,
        now: i64,
        cancel: &CancellationToken,
    ) -> Result<Admission> {
        let decision = self.try_admit_at(now).await?;
        self.finish(decision, cancel).await
    }

    /// Admit at the clock's current time, then pop one item for the slot.
    pub async fn try_admit_and_dequeue(&self, cancel: &CancellationToken) -> Result<Admission> {
        let decision = self.try_admit().await?;
        self.finish(decision, cancel).await
    }

    async fn finish(&self, decision: Decision, cancel: &CancellationToken) -> Result<Admission> {
        if decision == Decision::Rejected {
            return Ok(Admission::Rejected);
        }
        Ok(match self.dequeue(cancel).await? {
            Some(payload) => Admission::Admitted(payload),
            None => Admission::Cancelled,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SluiceError;
    use crate::ratelimit::clock::ManualClock;
    use crate::store::MemoryStore;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    const MS: i64 = 1_000_000;
    const T0: i64 = 1_700_000_000_000 * MS;

    fn limiter(store: &Arc<MemoryStore>, limit: u64) -> SlidingWindowLimiter<MemoryStore> {
        let mut settings =
            LimiterSettings::new("jobs", SlidingWindow::new(Duration::from_secs(1), limit));
        settings.poll_timeout = Duration::from_millis(20);
        SlidingWindowLimiter::new(store.clone(), settings)
    }

    async fn push(store: &MemoryStore, items: &[&str]) {
        let items: Vec<String> = items.iter().map(|s| s.to_string()).collect();
        store.push_back("jobs", &items).await.unwrap();
    }

    #[test]
    fn test_settings_derive_log_key() {
        let settings = LimiterSettings::new("myJobQueue", SlidingWindow::default());
        assert_eq!(settings.log_key, "myJobQueue:log");
    }

    #[tokio::test]
    async fn test_two_per_second_scenario() {
        let store = Arc::new(MemoryStore::new());
        let limiter = limiter(&store, 2);
        let cancel = CancellationToken::new();
        push(&store, &["1", "2", "3", "4", "5"]).await;

        let first = limiter.try_admit_and_dequeue_at(T0, &cancel).await.unwrap();
        let second = limiter.try_admit_and_dequeue_at(T0 + 10 * MS, &cancel).await.unwrap();
        let third = limiter.try_admit_and_dequeue_at(T0 + 20 * MS, &cancel).await.unwrap();

        assert_eq!(first, Admission::Admitted("1".to_string()));
        assert_eq!(second, Admission::Admitted("2".to_string()));
        assert_eq!(third, Admission::Rejected);
        assert_eq!(store.queue_len("jobs").await.unwrap(), 3);

        let later = limiter.try_admit_and_dequeue_at(T0 + 1_010 * MS, &cancel).await.unwrap();
        assert_eq!(later, Admission::Admitted("3".to_string()));

        // The two old entries were pruned by the last attempt.
        assert_eq!(store.log_scores("jobs:log"), vec![T0 + 1_010 * MS]);
    }

    #[tokio::test]
    async fn test_rejection_only_prunes() {
        let store = Arc::new(MemoryStore::new());
        let limiter = limiter(&store, 1);

        assert_eq!(limiter.try_admit_at(T0).await.unwrap(), Decision::Admitted);
        assert_eq!(limiter.try_admit_at(T0 + MS).await.unwrap(), Decision::Rejected);
        assert_eq!(store.log_scores("jobs:log"), vec![T0]);
    }

    #[tokio::test]
    async fn test_entry_exactly_one_window_old_is_stale() {
        let store = Arc::new(MemoryStore::new());
        let limiter = limiter(&store, 1);

        assert_eq!(limiter.try_admit_at(T0).await.unwrap(), Decision::Admitted);
        assert_eq!(
            limiter.try_admit_at(T0 + 1_000 * MS).await.unwrap(),
            Decision::Admitted
        );
    }

    #[tokio::test]
    async fn test_same_instant_admissions_are_not_merged() {
        let store = Arc::new(MemoryStore::new());
        let limiter = limiter(&store, 3);

        for _ in 0..3 {
            assert_eq!(limiter.try_admit_at(T0).await.unwrap(), Decision::Admitted);
        }
        assert_eq!(limiter.try_admit_at(T0).await.unwrap(), Decision::Rejected);
        assert_eq!(store.log_len("jobs:log").await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_pruning_is_idempotent() {
        let store = Arc::new(MemoryStore::new());
        let limiter = limiter(&store, 2);
        limiter.try_admit_at(T0).await.unwrap();
        limiter.try_admit_at(T0 + 500 * MS).await.unwrap();
        assert_eq!(store.log_len("jobs:log").await.unwrap(), 2);

        let window = limiter.settings().window;
        let clear_before = window.clear_before(T0 + 1_200 * MS);
        let prune = move |_: LogSnapshot| crate::store::LogWrite {
            prune_through: clear_before,
            insert: None,
        };

        store.transact_log("jobs:log", clear_before, &prune).await.unwrap();
        let after_first = store.log_len("jobs:log").await.unwrap();
        store.transact_log("jobs:log", clear_before, &prune).await.unwrap();
        let after_second = store.log_len("jobs:log").await.unwrap();

        assert_eq!(after_first, 1);
        assert_eq!(after_first, after_second);
    }

    #[tokio::test]
    async fn test_conflicts_are_retried() {
        let store = Arc::new(MemoryStore::new());
        let limiter = limiter(&store, 5);
        store.inject_conflicts(3);

        assert_eq!(limiter.try_admit_at(T0).await.unwrap(), Decision::Admitted);
        assert_eq!(store.log_len("jobs:log").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_contention_surfaces_when_retries_run_out() {
        let store = Arc::new(MemoryStore::new());
        let mut limiter = limiter(&store, 5);
        limiter.settings.retry = RetryPolicy::bounded(2);
        store.inject_conflicts(2);

        let err = limiter.try_admit_at(T0).await.unwrap_err();
        assert!(matches!(err, SluiceError::Contention { attempts: 2 }));
        assert_eq!(store.log_len("jobs:log").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_store_failure_propagates() {
        let store = Arc::new(MemoryStore::new());
        let limiter = limiter(&store, 5);
        store.inject_failures(1);

        let err = limiter.try_admit_at(T0).await.unwrap_err();
        assert!(matches!(err, SluiceError::Store(_)));
    }

    #[tokio::test]
    async fn test_admitted_attempt_waits_for_an_item() {
        let store = Arc::new(MemoryStore::new());
        let limiter = Arc::new(limiter(&store, 5));
        let cancel = CancellationToken::new();

        let attempt = {
            let limiter = limiter.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { limiter.try_admit_and_dequeue_at(T0, &cancel).await })
        };

        // Let it commit and go through a few empty polls.
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(!attempt.is_finished());
        assert_eq!(store.log_len("jobs:log").await.unwrap(), 1);

        push(&store, &["only"]).await;
        let admission = attempt.await.unwrap().unwrap();
        assert_eq!(admission, Admission::Admitted("only".to_string()));
        assert_eq!(store.log_len("jobs:log").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_wait_counts_the_slot_once() {
        let store = Arc::new(MemoryStore::new());
        let limiter = Arc::new(limiter(&store, 2));
        let cancel = CancellationToken::new();

        let attempt = {
            let limiter = limiter.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { limiter.try_admit_and_dequeue_at(T0, &cancel).await })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;
        cancel.cancel();

        assert_eq!(attempt.await.unwrap().unwrap(), Admission::Cancelled);
        assert_eq!(store.log_len("jobs:log").await.unwrap(), 1);
        assert_eq!(store.queue_len("jobs").await.unwrap(), 0);

        // The spent slot still counts: one more fits, then the window is full.
        let fresh = CancellationToken::new();
        push(&store, &["a", "b"]).await;
        assert_eq!(
            limiter.try_admit_and_dequeue_at(T0 + MS, &fresh).await.unwrap(),
            Admission::Admitted("a".to_string())
        );
        assert_eq!(
            limiter.try_admit_and_dequeue_at(T0 + 2 * MS, &fresh).await.unwrap(),
            Admission::Rejected
        );
        assert_eq!(store.queue_items("jobs"), vec!["b".to_string()]);
    }

    #[tokio::test]
    async fn test_clock_drives_default_attempts() {
        let store = Arc::new(MemoryStore::new());
        let clock = ManualClock::new(T0);
        let limiter = limiter(&store, 1).with_clock(Arc::new(clock.clone()));

        assert_eq!(limiter.try_admit().await.unwrap(), Decision::Admitted);
        assert_eq!(limiter.try_admit().await.unwrap(), Decision::Rejected);

        clock.advance(Duration::from_millis(1_001));
        assert_eq!(limiter.try_admit().await.unwrap(), Decision::Admitted);
    }

    #[tokio::test]
    async fn test_random_attempts_never_exceed_the_window() {
        let store = Arc::new(MemoryStore::new());
        let limit = 4;
        let limiter = limiter(&store, limit);
        let mut rng = StdRng::seed_from_u64(7);

        let mut now = T0;
        let mut admitted = Vec::new();
        for _ in 0..400 {
            now += rng.gen_range(0..120) * MS;
            if limiter.try_admit_at(now).await.unwrap() == Decision::Admitted {
                admitted.push(now);
            }
        }

        assert!(!admitted.is_empty());
        for (i, &start) in admitted.iter().enumerate() {
            let in_window = admitted[i..]
                .iter()
                .take_while(|&&t| t < start + 1_000 * MS)
                .count() as u64;
            assert!(in_window <= limit, "{} admissions within 1s of {}", in_window, start);
        }
    }

    #[tokio::test]
    async fn test_recovers_after_window_elapses() {
        let store = Arc::new(MemoryStore::new());
        let limiter = limiter(&store, 3);
        let cancel = CancellationToken::new();
        push(&store, &["a", "b", "c", "d"]).await;

        for i in 0..3 {
            limiter.try_admit_and_dequeue_at(T0 + i * MS, &cancel).await.unwrap();
        }
        assert_eq!(
            limiter.try_admit_and_dequeue_at(T0 + 500 * MS, &cancel).await.unwrap(),
            Admission::Rejected
        );
        assert_eq!(
            limiter.try_admit_and_dequeue_at(T0 + 1_003 * MS, &cancel).await.unwrap(),
            Admission::Admitted("d".to_string())
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_competing_limiters_share_the_ceiling() {
        let store = Arc::new(MemoryStore::new());
        let limit = 10;

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let limiter = limiter(&store, limit);
            tasks.push(tokio::spawn(async move {
                let mut admitted = 0u64;
                for _ in 0..10 {
                    if limiter.try_admit_at(T0).await.unwrap() == Decision::Admitted {
                        admitted += 1;
                    }
                }
                admitted
            }));
        }

        let mut total = 0;
        for task in tasks {
            total += task.await.unwrap();
        }
        assert_eq!(total, limit);
        assert_eq!(store.log_len("jobs:log").await.unwrap(), limit);
    }
}

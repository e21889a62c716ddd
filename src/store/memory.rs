//! In-process shared store.
//!
//! `MemoryStore` mirrors the Redis semantics the limiter depends on: a
//! per-key version stands in for WATCH, and a transaction commits only if the
//! version it read is still current. The read and the commit take the lock
//! separately, so concurrent tasks sharing one store genuinely race.
//!
//! Contention and outages can be injected for tests.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::trace;

use super::backend::{Attempt, LogSnapshot, LogWrite, SharedStore, StoreError};

#[derive(Debug, Default)]
struct State {
    lists: HashMap<String, VecDeque<String>>,
    /// member -> score
    logs: HashMap<String, HashMap<String, i64>>,
    versions: HashMap<String, u64>,
}

impl State {
    fn version(&self, key: &str) -> u64 {
        self.versions.get(key).copied().unwrap_or(0)
    }

    fn touch(&mut self, key: &str) {
        *self.versions.entry(key.to_string()).or_insert(0) += 1;
    }

    fn live_entries(&self, key: &str, clear_before: i64) -> u64 {
        self.logs
            .get(key)
            .map(|log| log.values().filter(|&&score| score > clear_before).count() as u64)
            .unwrap_or(0)
    }

    fn apply(&mut self, key: &str, write: &LogWrite) {
        let log = self.logs.entry(key.to_string()).or_default();
        let before = log.len();
        log.retain(|_, score| *score > write.prune_through);
        let mut changed = log.len() != before;

        if let Some(entry) = &write.insert {
            log.insert(entry.member.clone(), entry.score);
            changed = true;
        }
        if changed {
            self.touch(key);
        }
    }
}

/// In-process implementation of [`SharedStore`].
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<State>,
    pushed: Notify,
    injected_conflicts: AtomicU32,
    injected_failures: AtomicU32,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` log transactions lose to a simulated competitor.
    pub fn inject_conflicts(&self, n: u32) {
        self.injected_conflicts.fetch_add(n, Ordering::SeqCst);
    }

    /// Make the next `n` store operations fail as if the store were down.
    pub fn inject_failures(&self, n: u32) {
        self.injected_failures.fetch_add(n, Ordering::SeqCst);
    }

    /// Scores currently in the log, oldest first.
    pub fn log_scores(&self, log_key: &str) -> Vec<i64> {
        let state = self.state.lock();
        let mut scores: Vec<i64> = state
            .logs
            .get(log_key)
            .map(|log| log.values().copied().collect())
            .unwrap_or_default();
        scores.sort_unstable();
        scores
    }

    /// Snapshot of the queue, head first.
    pub fn queue_items(&self, queue_key: &str) -> Vec<String> {
        let state = self.state.lock();
        state
            .lists
            .get(queue_key)
            .map(|list| list.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn take(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if Self::take(&self.injected_failures) {
            return Err(StoreError::Unavailable("injected failure".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl SharedStore for MemoryStore {
    async fn ping(&self) -> Result<(), StoreError> {
        self.check_available()
    }

    async fn transact_log(
        &self,
        log_key: &str,
        clear_before: i64,
        body: &(dyn Fn(LogSnapshot) -> LogWrite + Send + Sync),
    ) -> Result<Attempt<LogWrite>, StoreError> {
        self.check_available()?;

        let (watched, snapshot) = {
            let state = self.state.lock();
            (
                state.version(log_key),
                LogSnapshot {
                    live: state.live_entries(log_key, clear_before),
                },
            )
        };

        let write = body(snapshot);

        // Give competitors a chance to run between read and commit.
        tokio::task::yield_now().await;

        let mut state = self.state.lock();
        if Self::take(&self.injected_conflicts) {
            state.touch(log_key);
        }
        if state.version(log_key) != watched {
            trace!(log_key, "Log changed since it was watched");
            return Ok(Attempt::Conflict);
        }
        state.apply(log_key, &write);
        Ok(Attempt::Committed(write))
    }

    async fn log_len(&self, log_key: &str) -> Result<u64, StoreError> {
        self.check_available()?;
        let state = self.state.lock();
        Ok(state.logs.get(log_key).map(|log| log.len() as u64).unwrap_or(0))
    }

    async fn push_back(&self, queue_key: &str, payloads: &[String]) -> Result<u64, StoreError> {
        self.check_available()?;
        let len = {
            let mut state = self.state.lock();
            let list = state.lists.entry(queue_key.to_string()).or_default();
            list.extend(payloads.iter().cloned());
            list.len() as u64
        };
        if !payloads.is_empty() {
            self.pushed.notify_waiters();
        }
        Ok(len)
    }

    async fn pop_front(
        &self,
        queue_key: &str,
        timeout: Duration,
    ) -> Result<Option<String>, StoreError> {
        self.check_available()?;
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            // Register interest before looking, so a push in between is not missed.
            let notified = self.pushed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let popped = {
                let mut state = self.state.lock();
                state.lists.get_mut(queue_key).and_then(|list| list.pop_front())
            };
            if popped.is_some() {
                return Ok(popped);
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn queue_len(&self, queue_key: &str) -> Result<u64, StoreError> {
        self.check_available()?;
        let state = self.state.lock();
        Ok(state
            .lists
            .get(queue_key)
            .map(|list| list.len() as u64)
            .unwrap_or(0))
    }
}

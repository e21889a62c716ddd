//! Store trait for abstracting Redis and in-process implementations.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

/// Errors raised by a shared store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

/// What a log transaction observed when it read the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogSnapshot {
    /// Entries scored after the attempt's `clear_before` bound.
    pub live: u64,
}

/// One rate-limit log entry: a timestamp score and a unique member.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub score: i64,
    pub member: String,
}

/// The write a log transaction commits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogWrite {
    /// Entries scored at or below this bound are removed.
    pub prune_through: i64,
    /// Entry to add, if the attempt admits.
    pub insert: Option<LogEntry>,
}

/// Outcome of a single optimistic attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Attempt<T> {
    Committed(T),
    /// The watched key changed between read and commit; nothing was applied.
    Conflict,
}

/// Trait for shared store implementations.
///
/// `transact_log` is the only read-modify-write primitive: it makes exactly
/// one optimistic attempt and leaves retrying to the caller.
#[async_trait]
pub trait SharedStore: Send + Sync {
    /// Check that the store is reachable.
    async fn ping(&self) -> Result<(), StoreError>;

    /// Watch `log_key`, count entries scored after `clear_before`, hand the
    /// snapshot to `body` and commit the write it returns, unless the key was
    /// modified in the meantime.
    async fn transact_log(
        &self,
        log_key: &str,
        clear_before: i64,
        body: &(dyn Fn(LogSnapshot) -> LogWrite + Send + Sync),
    ) -> Result<Attempt<LogWrite>, StoreError>;

    /// Total number of entries in the log, stale ones included.
    async fn log_len(&self, log_key: &str) -> Result<u64, StoreError>;

    /// Append payloads to the queue tail, returning the new queue length.
    async fn push_back(&self, queue_key: &str, payloads: &[String]) -> Result<u64, StoreError>;

    /// Pop the queue head, waiting up to `timeout` for an item.
    async fn pop_front(
        &self,
        queue_key: &str,
        timeout: Duration,
    ) -> Result<Option<String>, StoreError>;

    /// Current queue length.
    async fn queue_len(&self, queue_key: &str) -> Result<u64, StoreError>;
}

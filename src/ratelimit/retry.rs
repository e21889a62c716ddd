//! Retry combinator for optimistic transactions.

use std::future::Future;

use tracing::{debug, trace};

use crate::error::{Result, SluiceError};
use crate::store::{Attempt, StoreError};

/// How many optimistic attempts to make before reporting contention.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    max_attempts: Option<u32>,
}

impl RetryPolicy {
    /// Give up after `max_attempts` conflicts (at least one attempt is made).
    pub fn bounded(max_attempts: u32) -> Self {
        Self {
            max_attempts: Some(max_attempts.max(1)),
        }
    }

    /// Retry for as long as it takes.
    pub fn unbounded() -> Self {
        Self { max_attempts: None }
    }

    /// `0` means unbounded, matching the configuration convention.
    pub fn from_max_attempts(max_attempts: u32) -> Self {
        match max_attempts {
            0 => Self::unbounded(),
            n => Self::bounded(n),
        }
    }

    pub fn max_attempts(&self) -> Option<u32> {
        self.max_attempts
    }

    fn exhausted(&self, attempts: u32) -> bool {
        self.max_attempts.is_some_and(|max| attempts >= max)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::bounded(100)
    }
}

/// Run `attempt` until it commits.
///
/// Each call must redo the whole read-decide-write sequence; a conflict means
/// none of it was applied. Store errors end the loop immediately.
pub async fn retry_on_conflict<T, F, Fut>(policy: RetryPolicy, mut attempt: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<Attempt<T>, StoreError>>,
{
    let mut attempts: u32 = 0;
    loop {
        attempts = attempts.saturating_add(1);
        match attempt().await? {
            Attempt::Committed(value) => {
                if attempts > 1 {
                    debug!(attempts, "Committed after contention");
                }
                return Ok(value);
            }
            Attempt::Conflict => {
                trace!(attempt = attempts, "Optimistic transaction conflicted");
                if policy.exhausted(attempts) {
                    return Err(SluiceError::Contention { attempts });
                }
                tokio::task::yield_now().await;
            }
        }
    }
}

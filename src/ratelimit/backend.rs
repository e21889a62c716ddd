//! Admission gate trait for abstracting the limiter behind the drain loop.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::limiter::{Admission, SlidingWindowLimiter};
use crate::error::Result;
use crate::store::SharedStore;

/// Trait for anything that can hand the drain loop one admitted item.
///
/// The drain loop only sees this seam, so it runs the same against the
/// sliding-window limiter or a scripted gate in tests.
#[async_trait]
pub trait AdmissionGate: Send + Sync {
    /// Try to take one slot and pop the item for it.
    async fn try_admit_and_dequeue(&self, cancel: &CancellationToken) -> Result<Admission>;
}

#[async_trait]
impl<S: SharedStore + 'static> AdmissionGate for SlidingWindowLimiter<S> {
    async fn try_admit_and_dequeue(&self, cancel: &CancellationToken) -> Result<Admission> {
        SlidingWindowLimiter::try_admit_and_dequeue(self, cancel).await
    }
}

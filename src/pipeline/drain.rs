//! Rate-limited drain loop.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::DrainConfig;
use crate::error::{Result, SluiceError};
use crate::ratelimit::{Admission, AdmissionGate};
use crate::sink::PublishSink;

/// What one drain iteration did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cycle {
    Forwarded,
    Rejected,
    Cancelled,
}

/// Counters a drain loop reports when it stops.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainStats {
    pub forwarded: u64,
    pub rejected: u64,
    pub failed: u64,
}

/// Pops admitted items and forwards them to a sink until cancelled.
///
/// No single failure stops the loop: store and sink errors are logged and
/// the next iteration runs. A payload whose publish fails is dropped.
pub struct DrainLoop<G: AdmissionGate> {
    gate: G,
    sink: Arc<dyn PublishSink>,
    topic: String,
    reject_backoff: Duration,
    error_backoff: Duration,
    worker: usize,
}

impl<G: AdmissionGate> DrainLoop<G> {
    pub fn new(gate: G, sink: Arc<dyn PublishSink>, topic: impl Into<String>) -> Self {
        let defaults = DrainConfig::default();
        Self {
            gate,
            sink,
            topic: topic.into(),
            reject_backoff: defaults.reject_backoff(),
            error_backoff: defaults.error_backoff(),
            worker: 0,
        }
    }

    pub fn from_config(gate: G, sink: Arc<dyn PublishSink>, config: &DrainConfig) -> Self {
        Self::new(gate, sink, config.topic.clone())
            .with_backoff(config.reject_backoff(), config.error_backoff())
    }

    /// Set the pauses after a rejection and after a failed iteration.
    pub fn with_backoff(mut self, reject: Duration, error: Duration) -> Self {
        self.reject_backoff = reject;
        self.error_backoff = error;
        self
    }

    /// Tag log events with a worker index.
    pub fn with_worker(mut self, worker: usize) -> Self {
        self.worker = worker;
        self
    }

    /// One guarded dequeue-and-forward cycle.
    pub async fn run_once(&self, cancel: &CancellationToken) -> Result<Cycle> {
        match self.gate.try_admit_and_dequeue(cancel).await? {
            Admission::Rejected => Ok(Cycle::Rejected),
            Admission::Cancelled => Ok(Cycle::Cancelled),
            Admission::Admitted(payload) => {
                self.sink.publish(&self.topic, payload.as_bytes()).await?;
                debug!(worker = self.worker, topic = %self.topic, "Forwarded payload");
                Ok(Cycle::Forwarded)
            }
        }
    }

    /// Run until `cancel` fires.
    pub async fn run(&self, cancel: CancellationToken) -> DrainStats {
        let mut stats = DrainStats::default();
        info!(worker = self.worker, topic = %self.topic, "Drain loop started");

        while !cancel.is_cancelled() {
            match self.run_once(&cancel).await {
                Ok(Cycle::Forwarded) => stats.forwarded += 1,
                Ok(Cycle::Rejected) => {
                    stats.rejected += 1;
                    pause(self.reject_backoff, &cancel).await;
                }
                Ok(Cycle::Cancelled) => break,
                Err(SluiceError::Sink(e)) => {
                    stats.failed += 1;
                    warn!(worker = self.worker, error = %e, "Publish failed, payload dropped");
                }
                Err(e) => {
                    stats.failed += 1;
                    warn!(worker = self.worker, error = %e, "Drain iteration failed");
                    pause(self.error_backoff, &cancel).await;
                }
            }
        }

        info!(
            worker = self.worker,
            forwarded = stats.forwarded,
            rejected = stats.rejected,
            failed = stats.failed,
            "Drain loop stopped"
        );
        stats
    }
}

/// Sleep for `duration` unless cancelled first. A zero pause only yields.
async fn pause(duration: Duration, cancel: &CancellationToken) {
    if duration.is_zero() {
        tokio::task::yield_now().await;
        return;
    }
    tokio::select! {
        _ = cancel.cancelled() => {}
        _ = tokio::time::sleep(duration) => {}
    }
}

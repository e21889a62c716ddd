//! Downstream publish targets.
//!
//! The drain loop hands every admitted payload to a [`PublishSink`] under a
//! fixed topic. Delivery is fire-and-forget: a failed publish is reported to
//! the caller, which logs it and moves on.

mod log;
mod redis_channel;

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tracing::info;

use crate::config::{SinkConfig, SinkKind, StoreConfig};

pub use self::log::LogSink;
pub use redis_channel::RedisChannelSink;

/// Errors raised while publishing.
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Trait for publish sink implementations.
#[async_trait]
pub trait PublishSink: Send + Sync {
    /// Publish `payload` under `topic`.
    async fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), SinkError>;
}

/// Build the sink named by the configuration.
///
/// Connecting sinks verify their credentials here, so a bad key fails at
/// startup rather than on the first publish.
pub async fn connect(
    config: &SinkConfig,
    store: &StoreConfig,
) -> Result<Arc<dyn PublishSink>, SinkError> {
    let sink: Arc<dyn PublishSink> = match config.kind {
        SinkKind::Redis => Arc::new(RedisChannelSink::connect(config, store).await?),
        SinkKind::Log => Arc::new(LogSink::new(config.channel.clone())),
    };
    info!(kind = ?config.kind, channel = %config.channel, "Publish sink ready");
    Ok(sink)
}

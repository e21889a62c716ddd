//! Sink that only logs what it would publish.

use async_trait::async_trait;
use tracing::info;

use super::{PublishSink, SinkError};

/// Emits each publish as a tracing event; never fails.
#[derive(Debug, Clone)]
pub struct LogSink {
    channel: String,
}

impl LogSink {
    pub fn new(channel: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
        }
    }
}

#[async_trait]
impl PublishSink for LogSink {
    async fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), SinkError> {
        info!(
            channel = %self.channel,
            topic,
            payload = %String::from_utf8_lossy(payload),
            "Publish"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_log_sink_accepts_anything() {
        let sink = LogSink::new("ticker");
        assert!(sink.publish("trade", b"200.125000").await.is_ok());
        assert!(sink.publish("trade", &[0xff, 0xfe]).await.is_ok());
    }
}

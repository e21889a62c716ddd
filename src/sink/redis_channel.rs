//! Redis pub/sub sink.
//!
//! Each publish is a JSON envelope `{"name": <topic>, "data": <payload>}`
//! sent with PUBLISH on the configured channel, so subscribers can tell
//! topics apart on a shared channel.
//!
//! The connection is a [`ConnectionManager`], which re-establishes itself
//! after the sink server drops it. The publish that hit the broken
//! connection still fails; later publishes go through once the server is
//! back.

use std::borrow::Cow;
use std::fmt;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::Client;
use serde::Serialize;
use tracing::{debug, trace};

use super::{PublishSink, SinkError};
use crate::config::{SinkConfig, StoreConfig};
use crate::store::connection_info;

#[derive(Debug, Serialize)]
struct Envelope<'a> {
    name: &'a str,
    data: Cow<'a, str>,
}

/// Encode a publish as the JSON envelope subscribers receive.
fn encode(topic: &str, payload: &[u8]) -> Result<String, SinkError> {
    let envelope = Envelope {
        name: topic,
        data: String::from_utf8_lossy(payload),
    };
    Ok(serde_json::to_string(&envelope)?)
}

/// Publishes onto a Redis channel.
pub struct RedisChannelSink {
    conn: ConnectionManager,
    channel: String,
}

impl fmt::Debug for RedisChannelSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisChannelSink")
            .field("channel", &self.channel)
            .finish_non_exhaustive()
    }
}

impl RedisChannelSink {
    /// Connect to the sink's Redis and authenticate.
    ///
    /// Host and port default to the store's. The sink key is the AUTH
    /// password; without one the store password is used.
    ///
    /// # Errors
    /// Returns error if the server is unreachable or rejects the credential.
    pub async fn connect(config: &SinkConfig, store: &StoreConfig) -> Result<Self, SinkError> {
        let host = config.host.as_deref().unwrap_or(&store.host);
        let port = config.port.unwrap_or(store.port);
        let password = config.key.clone().or_else(|| store.password.clone());

        let client = Client::open(connection_info(host, port, password)?)?;
        let mut conn = ConnectionManager::new(client).await?;
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;

        debug!(host, port, channel = %config.channel, "Connected publish sink");
        Ok(Self {
            conn,
            channel: config.channel.clone(),
        })
    }
}

#[async_trait]
impl PublishSink for RedisChannelSink {
    async fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), SinkError> {
        let message = encode(topic, payload)?;
        let mut conn = self.conn.clone();
        let receivers: u64 = redis::cmd("PUBLISH")
            .arg(&self.channel)
            .arg(message)
            .query_async(&mut conn)
            .await?;
        trace!(channel = %self.channel, topic, receivers, "Published");
        Ok(())
    }
}

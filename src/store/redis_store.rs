//! Redis-backed shared store.
//!
//! The rate-limit log is a sorted set (`score = admission time in ns`,
//! `member = unique token`) and the queue is a plain list. Log transactions
//! use WATCH/MULTI/EXEC on a connection reserved for that purpose, since
//! WATCH state belongs to a connection. Queue traffic, including the
//! blocking pop, runs on a second connection so a long BLPOP never sits
//! behind, or holds, the transaction lock.
//!
//! The queue connection is a [`ConnectionManager`], which reconnects on its
//! own. The WATCH connection is private and rebuilt lazily after an I/O
//! failure, since a shared or silently replaced connection would lose the
//! WATCH.
//!
//! Sub-second BLPOP timeouts need Redis 6.0 or newer.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::{ConnectionManager, MultiplexedConnection};
use redis::{Client, ConnectionInfo, IntoConnectionInfo, RedisError, RedisResult};
use tracing::{debug, trace};

use super::backend::{Attempt, LogSnapshot, LogWrite, SharedStore, StoreError};
use crate::config::StoreConfig;

/// Build connection details for a Redis server, with an optional password.
pub(crate) fn connection_info(
    host: &str,
    port: u16,
    password: Option<String>,
) -> RedisResult<ConnectionInfo> {
    let mut info = (host.to_string(), port).into_connection_info()?;
    info.redis.password = password.filter(|p| !p.is_empty());
    Ok(info)
}

/// Shortest BLPOP timeout sent to the server, in seconds.
const MIN_BLPOP_TIMEOUT_SECS: f64 = 0.001;

/// BLPOP timeout in seconds for a poll of `timeout`.
///
/// A zero timeout makes BLPOP block forever, so the result is never zero.
fn blpop_timeout_secs(timeout: Duration) -> f64 {
    timeout.as_secs_f64().max(MIN_BLPOP_TIMEOUT_SECS)
}

/// Whether the connection behind `err` should be thrown away.
pub(crate) fn is_disconnect(err: &RedisError) -> bool {
    err.is_io_error() || err.is_connection_dropped() || err.is_connection_refusal()
}

/// Redis implementation of [`SharedStore`].
///
/// A `RedisStore` belongs to one worker. Competing workers, in this process
/// or elsewhere, each connect their own.
pub struct RedisStore {
    client: Client,
    /// Reserved for WATCH/MULTI/EXEC; never cloned.
    tx_conn: tokio::sync::Mutex<Option<MultiplexedConnection>>,
    /// Queue traffic; cloned for each command.
    queue_conn: ConnectionManager,
    addr: String,
}

impl fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisStore")
            .field("addr", &self.addr)
            .finish_non_exhaustive()
    }
}

impl RedisStore {
    /// Connect to Redis and verify the server answers.
    ///
    /// # Errors
    /// Returns error if the server is unreachable or rejects the credentials.
    pub async fn connect(config: &StoreConfig) -> Result<Self, StoreError> {
        let info = connection_info(&config.host, config.port, config.password.clone())?;
        let client = Client::open(info)?;

        let queue_conn = ConnectionManager::new(client.clone()).await?;

        let store = Self {
            client,
            tx_conn: tokio::sync::Mutex::new(None),
            queue_conn,
            addr: format!("{}:{}", config.host, config.port),
        };
        store.ping().await?;

        debug!(addr = %store.addr, "Connected to Redis");
        Ok(store)
    }

    fn queue_connection(&self) -> ConnectionManager {
        self.queue_conn.clone()
    }

    fn check_queue<T>(&self, result: RedisResult<T>) -> Result<T, StoreError> {
        result.map_err(|err| {
            if is_disconnect(&err) {
                debug!(addr = %self.addr, error = %err, "Queue connection lost, reconnecting");
            }
            StoreError::from(err)
        })
    }
}

/// One WATCH/MULTI/EXEC round on the log key.
async fn watch_and_commit(
    conn: &mut MultiplexedConnection,
    log_key: &str,
    clear_before: i64,
    body: &(dyn Fn(LogSnapshot) -> LogWrite + Send + Sync),
) -> RedisResult<Attempt<LogWrite>> {
    let _: () = redis::cmd("WATCH").arg(log_key).query_async(conn).await?;

    let live: u64 = redis::cmd("ZCOUNT")
        .arg(log_key)
        .arg(format!("({}", clear_before))
        .arg("+inf")
        .query_async(conn)
        .await?;

    let write = body(LogSnapshot { live });

    let mut pipe = redis::pipe();
    pipe.atomic()
        .cmd("ZREMRANGEBYSCORE")
        .arg(log_key)
        .arg("-inf")
        .arg(write.prune_through);
    if let Some(entry) = &write.insert {
        pipe.cmd("ZADD").arg(log_key).arg(entry.score).arg(&entry.member);
    }

    // EXEC answers nil when the watched key was touched.
    let replies: Option<Vec<i64>> = pipe.query_async(conn).await?;
    Ok(match replies {
        Some(_) => Attempt::Committed(write),
        None => Attempt::Conflict,
    })
}

#[async_trait]
impl SharedStore for RedisStore {
    async fn ping(&self) -> Result<(), StoreError> {
        let mut conn = self.queue_connection();
        let result: RedisResult<String> = redis::cmd("PING").query_async(&mut conn).await;
        self.check_queue(result).map(|_| ())
    }

    async fn transact_log(
        &self,
        log_key: &str,
        clear_before: i64,
        body: &(dyn Fn(LogSnapshot) -> LogWrite + Send + Sync),
    ) -> Result<Attempt<LogWrite>, StoreError> {
        let mut slot = self.tx_conn.lock().await;
        let mut conn = match slot.take() {
            Some(conn) => conn,
            None => self.client.get_multiplexed_async_connection().await?,
        };

        let result = watch_and_commit(&mut conn, log_key, clear_before, body).await;
        match &result {
            Ok(attempt) => {
                trace!(
                    log_key,
                    conflict = matches!(attempt, Attempt::Conflict),
                    "Log transaction finished"
                );
                *slot = Some(conn);
            }
            Err(err) if is_disconnect(err) => {
                debug!(addr = %self.addr, error = %err, "Dropping transaction connection");
            }
            Err(_) => {
                // Leave no WATCH behind for the next attempt.
                let _: RedisResult<()> = redis::cmd("UNWATCH").query_async(&mut conn).await;
                *slot = Some(conn);
            }
        }
        result.map_err(StoreError::from)
    }

    async fn log_len(&self, log_key: &str) -> Result<u64, StoreError> {
        let mut conn = self.queue_connection();
        let result = redis::cmd("ZCARD").arg(log_key).query_async(&mut conn).await;
        self.check_queue(result)
    }

    async fn push_back(&self, queue_key: &str, payloads: &[String]) -> Result<u64, StoreError> {
        if payloads.is_empty() {
            return self.queue_len(queue_key).await;
        }
        let mut conn = self.queue_connection();
        let result = redis::cmd("RPUSH")
            .arg(queue_key)
            .arg(payloads)
            .query_async(&mut conn)
            .await;
        self.check_queue(result)
    }

    async fn pop_front(
        &self,
        queue_key: &str,
        timeout: Duration,
    ) -> Result<Option<String>, StoreError> {
        let mut conn = self.queue_connection();
        let result: RedisResult<Option<(String, String)>> = redis::cmd("BLPOP")
            .arg(queue_key)
            .arg(blpop_timeout_secs(timeout))
            .query_async(&mut conn)
            .await;
        self.check_queue(result).map(|popped| popped.map(|(_, payload)| payload))
    }

    async fn queue_len(&self, queue_key: &str) -> Result<u64, StoreError> {
        let mut conn = self.queue_connection();
        let result = redis::cmd("LLEN").arg(queue_key).query_async(&mut conn).await;
        self.check_queue(result)
    }
}

//! Durable job queue
//!
//! Jobs are the raw declarative lines, appended to a Redis list that the
//! workers pop from.

use async_trait::async_trait;
use log::{debug, info};
use redis::aio::MultiplexedConnection;
use redis::{ConnectionAddr, ConnectionInfo, FromRedisValue, RedisConnectionInfo};
use std::time::Duration;
use tokio::time::timeout;

use crate::config::{QueueEndpoint, Settings};
use crate::error::QueueError;

/// List the workers consume jobs from
pub const JOBS_KEY: &str = "probewatch.jobs";

/// FIFO store for pending jobs
#[async_trait]
pub trait JobQueue: Send {
    /// Liveness check
    async fn ping(&mut self) -> Result<(), QueueError>;

    /// Append one job payload to the tail of the queue
    async fn push(&mut self, payload: &str) -> Result<(), QueueError>;
}

/// Redis-backed queue
///
/// Every command is bounded by the same timeout as the initial dial, so a
/// server that accepts the connection and then stalls cannot hang enqueue.
pub struct RedisQueue {
    connection: MultiplexedConnection,
    key: String,
    response_timeout: Duration,
}

impl RedisQueue {
    /// Connect using the queue part of `settings`
    pub async fn connect(settings: &Settings) -> Result<Self, QueueError> {
        let info = connection_info(settings)?;
        debug!("Connecting to queue at {:?}", info.addr);

        let client = redis::Client::open(info)?;
        let connection = timeout(settings.redis_timeout, client.get_multiplexed_async_connection())
            .await
            .map_err(|_| QueueError::Timeout(settings.redis_timeout))??;

        Ok(Self {
            connection,
            key: JOBS_KEY.to_string(),
            response_timeout: settings.redis_timeout,
        })
    }

    async fn query<T: FromRedisValue>(&mut self, cmd: &redis::Cmd) -> Result<T, QueueError> {
        timeout(self.response_timeout, cmd.query_async(&mut self.connection))
            .await
            .map_err(|_| QueueError::Timeout(self.response_timeout))?
            .map_err(QueueError::from)
    }
}

/// Translate settings into a redis connection description
pub fn connection_info(settings: &Settings) -> Result<ConnectionInfo, QueueError> {
    let addr = match settings
        .queue_endpoint()
        .map_err(|e| QueueError::Connection(e.to_string()))?
    {
        QueueEndpoint::Tcp { host, port } => ConnectionAddr::Tcp(host, port),
        #[cfg(unix)]
        QueueEndpoint::Unix(path) => ConnectionAddr::Unix(path),
        #[cfg(not(unix))]
        QueueEndpoint::Unix(path) => {
            return Err(QueueError::Connection(format!(
                "unix sockets are not supported here: {}",
                path.display()
            )))
        }
    };

    let password = Some(settings.redis_password.clone()).filter(|p| !p.is_empty());

    Ok(ConnectionInfo {
        addr,
        redis: RedisConnectionInfo {
            db: settings.redis_db,
            password,
            ..RedisConnectionInfo::default()
        },
    })
}

#[async_trait]
impl JobQueue for RedisQueue {
    async fn ping(&mut self) -> Result<(), QueueError> {
        let reply: String = self.query(&redis::cmd("PING")).await?;
        info!("Queue responded to ping: {}", reply);
        Ok(())
    }

    async fn push(&mut self, payload: &str) -> Result<(), QueueError> {
        let mut rpush = redis::cmd("RPUSH");
        rpush.arg(&self.key).arg(payload);
        let length: i64 = self.query(&rpush).await?;
        debug!("Queued job on {} (length {})", self.key, length);
        Ok(())
    }
}

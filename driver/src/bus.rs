//! This module implements the redis-backed ports: list topics for the
//! message bus, `SET NX PX` locks for the lock service and TTL strings for
//! the status cache.
//!

use std::time::Duration;

use redis::Commands;

use judge::{Error, ErrorKind, Result};
use sandbox::Context;

use crate::ports::{LockService, MessageQueue, QueueMessage, StatusCache};

/// Value stored under held lock keys.
const LOCK_TOKEN: &str = "tide-judge";

/// The redis connection shared by the bus, the lock service and the status
/// cache. Connections are created per call; redis handles small connection
/// churn well and this keeps the ports free of pooled mutable state.
pub struct RedisBus {
    client: redis::Client,
}

impl RedisBus {
    /// Create a bus over the given redis URL.
    pub fn connect(addr: &str) -> Result<Self> {
        let client = redis::Client::open(addr)
            .map_err(|e| Error::from(ErrorKind::System(format!(
                "invalid redis address {}: {}", addr, e))))?;
        Ok(RedisBus { client })
    }

    fn connection(&self) -> Result<redis::Connection> {
        self.client.get_connection()
            .map_err(|e| Error::from(ErrorKind::System(format!(
                "failed to connect to redis: {}", e))))
    }
}

impl MessageQueue for RedisBus {
    fn fetch(&self, ctx: &Context, topic: &str, wait: Duration)
        -> Result<Option<QueueMessage>> {
        ctx.ensure_active().map_err(judge::Error::from)?;

        let mut connection = self.connection()?;
        // BLPOP only supports whole-second waits.
        let wait_secs = wait.as_secs().max(1) as f64;
        let popped: Option<(String, String)> = connection.blpop(topic, wait_secs)
            .map_err(|e| Error::from(ErrorKind::System(format!(
                "failed to fetch from {}: {}", topic, e))))?;

        match popped {
            Some((_, raw)) => {
                let message: QueueMessage = serde_json::from_str(&raw)
                    .map_err(|e| Error::from(ErrorKind::System(format!(
                        "malformed envelope on {}: {}", topic, e))))?;
                Ok(Some(message))
            },
            None => Ok(None),
        }
    }

    fn publish(&self, ctx: &Context, topic: &str, message: &QueueMessage) -> Result<()> {
        ctx.ensure_active().map_err(judge::Error::from)?;

        let raw = serde_json::to_string(message)?;
        let mut connection = self.connection()?;
        connection.rpush(topic, raw)
            .map_err(|e| Error::from(ErrorKind::System(format!(
                "failed to publish to {}: {}", topic, e))))
    }
}

impl LockService for RedisBus {
    fn try_lock(&self, key: &str, ttl: Duration) -> Result<bool> {
        let mut connection = self.connection()
            .map_err(|e| Error::from(ErrorKind::LockFailed(e.to_string())))?;

        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(LOCK_TOKEN)
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis() as u64)
            .query(&mut connection)
            .map_err(|e| Error::from(ErrorKind::LockFailed(format!(
                "failed to take lock {}: {}", key, e))))?;

        Ok(reply.is_some())
    }

    fn unlock(&self, key: &str) -> Result<()> {
        let mut connection = self.connection()
            .map_err(|e| Error::from(ErrorKind::LockFailed(e.to_string())))?;
        connection.del(key)
            .map_err(|e| Error::from(ErrorKind::LockFailed(format!(
                "failed to release lock {}: {}", key, e))))
    }
}

impl StatusCache for RedisBus {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let mut connection = self.connection()?;
        connection.get(key)
            .map_err(|e| Error::from(ErrorKind::Cache(format!(
                "failed to read {}: {}", key, e))))
    }

    fn mget(&self, keys: &[String]) -> Result<Vec<Option<String>>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }

        let mut connection = self.connection()?;
        redis::cmd("MGET")
            .arg(keys)
            .query(&mut connection)
            .map_err(|e| Error::from(ErrorKind::Cache(format!(
                "failed to batch read {} keys: {}", keys.len(), e))))
    }

    fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let mut connection = self.connection()?;
        connection.set_ex(key, value, ttl.as_secs().max(1) as usize)
            .map_err(|e| Error::from(ErrorKind::Cache(format!(
                "failed to write {}: {}", key, e))))
    }
}

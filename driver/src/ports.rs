//! This module defines the external ports the judge driver consumes: the
//! message bus, the object storage, the distributed lock service and the
//! status cache. Production implementations live in the `bus` and `restful`
//! modules; tests substitute in-memory fakes.
//!

use std::collections::HashMap;
use std::io::Read;
use std::time::Duration;

use serde::{Serialize, Deserialize};

use judge::Result;
use sandbox::Context;

/// Name of the header carrying the pool-full requeue count.
pub const POOL_RETRY_HEADER: &str = "x-pool-retry";

/// One message travelling over the bus: an id, string headers and a raw JSON
/// body.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct QueueMessage {
    /// Message id. Status events use the submission id here.
    pub id: String,

    /// String headers, including `x-pool-retry`.
    #[serde(default)]
    pub headers: HashMap<String, String>,

    /// Raw JSON body.
    pub body: String,
}

impl QueueMessage {
    /// Create a message with no headers.
    pub fn new<I, B>(id: I, body: B) -> Self
        where I: Into<String>, B: Into<String> {
        QueueMessage {
            id: id.into(),
            headers: HashMap::new(),
            body: body.into(),
        }
    }

    /// Number of pool-full requeues this message went through. Absent or
    /// malformed headers count as zero.
    pub fn pool_retries(&self) -> u32 {
        self.headers.get(POOL_RETRY_HEADER)
            .and_then(|raw| raw.parse().ok())
            .unwrap_or(0)
    }

    /// A clone of this message with the pool-retry header incremented.
    pub fn with_incremented_retry(&self) -> QueueMessage {
        let mut message = self.clone();
        message.headers.insert(
            POOL_RETRY_HEADER.to_owned(),
            (self.pool_retries() + 1).to_string());
        message
    }
}

/// Consumer and producer half of the message bus.
///
/// Delivery is at-least-once from the broker's point of view: a fetched
/// message is considered acknowledged unless the caller republishes it.
pub trait MessageQueue: Send + Sync {
    /// Fetch one message from the given topic, waiting at most `wait`.
    fn fetch(&self, ctx: &Context, topic: &str, wait: Duration)
        -> Result<Option<QueueMessage>>;

    /// Publish one message to the given topic.
    fn publish(&self, ctx: &Context, topic: &str, message: &QueueMessage) -> Result<()>;
}

/// Read access to the object storage holding sources and data packs.
pub trait ObjectStorage: Send + Sync {
    /// Open the object under `bucket`/`key` as a byte stream. The caller
    /// drives and drops the stream.
    fn get_object(&self, ctx: &Context, bucket: &str, key: &str)
        -> Result<Box<dyn Read + Send>>;
}

/// The distributed lock service used for single-flight fetches.
pub trait LockService: Send + Sync {
    /// Try to take the lock `key` with the given TTL. Returns whether the
    /// lock was acquired; contention is not an error.
    fn try_lock(&self, key: &str, ttl: Duration) -> Result<bool>;

    /// Release the lock `key`.
    fn unlock(&self, key: &str) -> Result<()>;
}

/// The TTL key-value store backing submission status rows.
pub trait StatusCache: Send + Sync {
    /// Read one key.
    fn get(&self, key: &str) -> Result<Option<String>>;

    /// Read many keys, preserving input order; missing keys yield `None` at
    /// their position.
    fn mget(&self, keys: &[String]) -> Result<Vec<Option<String>>>;

    /// Write one key with a TTL.
    fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<()>;
}

//! Redis backend for the shared analysis cache.
//!
//! Entries are plain `SET key value EX ttl` strings; each tag is a Redis set
//! holding the keys that carry it. A tag set expires no earlier than the
//! longest-lived entry added to it.

use crate::error::CacheError;
use redis::aio::MultiplexedConnection;
use std::time::Duration;
use tokio::time::timeout;
use tracing::debug;

const KEY_PREFIX: &str = "yoinsight:analysis:";
const TAG_PREFIX: &str = "yoinsight:tag:";

/// Raise a key's TTL to `ARGV[1]` seconds; never shortens it.
const EXTEND_TTL: &str = r#"
local current = redis.call('TTL', KEYS[1])
if current < tonumber(ARGV[1]) then
  redis.call('EXPIRE', KEYS[1], ARGV[1])
end
return 0
"#;

pub struct RedisStore {
    connection: MultiplexedConnection,
    op_timeout: Duration,
}

impl RedisStore {
    /// Connect within `connect_timeout`; the same bound applies to every
    /// later operation.
    pub async fn connect(url: &str, connect_timeout: Duration) -> Result<Self, CacheError> {
        let client = redis::Client::open(url)?;
        let connection = timeout(connect_timeout, client.get_multiplexed_async_connection())
            .await
            .map_err(|_| CacheError::Unavailable(format!("connect to {} timed out", url)))??;

        let store = Self {
            connection,
            op_timeout: connect_timeout.max(Duration::from_millis(250)),
        };
        store.ping().await?;
        debug!("Connected to Redis at {}", url);
        Ok(store)
    }

    async fn ping(&self) -> Result<(), CacheError> {
        let mut conn = self.connection.clone();
        self.bounded(redis::cmd("PING").query_async::<String>(&mut conn))
            .await
            .map(|_| ())
    }

    async fn bounded<T>(
        &self,
        op: impl std::future::Future<Output = redis::RedisResult<T>>,
    ) -> Result<T, CacheError> {
        match timeout(self.op_timeout, op).await {
            Ok(result) => result.map_err(CacheError::from),
            Err(_) => Err(CacheError::Unavailable("redis operation timed out".to_string())),
        }
    }

    pub async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let mut conn = self.connection.clone();
        self.bounded(
            redis::cmd("GET")
                .arg(format!("{}{}", KEY_PREFIX, key))
                .query_async::<Option<String>>(&mut conn),
        )
        .await
    }

    pub async fn set(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
        tags: &[String],
    ) -> Result<(), CacheError> {
        let full_key = format!("{}{}", KEY_PREFIX, key);
        let ttl_secs = ttl.as_secs().max(1);
        let mut pipe = redis::pipe();
        pipe.atomic()
            .cmd("SET")
            .arg(&full_key)
            .arg(value)
            .arg("EX")
            .arg(ttl_secs)
            .ignore();
        for tag in tags {
            let tag_key = format!("{}{}", TAG_PREFIX, tag);
            pipe.cmd("SADD").arg(&tag_key).arg(&full_key).ignore();
            pipe.cmd("EVAL")
                .arg(EXTEND_TTL)
                .arg(1)
                .arg(&tag_key)
                .arg(ttl_secs)
                .ignore();
        }

        let mut conn = self.connection.clone();
        self.bounded(pipe.query_async::<()>(&mut conn)).await
    }

    /// Delete every key tagged `tag`; returns the number of keys removed.
    pub async fn invalidate(&self, tag: &str) -> Result<usize, CacheError> {
        let tag_key = format!("{}{}", TAG_PREFIX, tag);
        let mut conn = self.connection.clone();

        let keys: Vec<String> = self
            .bounded(redis::cmd("SMEMBERS").arg(&tag_key).query_async(&mut conn))
            .await?;

        let removed: usize = if keys.is_empty() {
            0
        } else {
            self.bounded(redis::cmd("DEL").arg(&keys).query_async(&mut conn))
                .await?
        };

        self.bounded(redis::cmd("DEL").arg(&tag_key).query_async::<()>(&mut conn))
            .await?;
        Ok(removed)
    }
}

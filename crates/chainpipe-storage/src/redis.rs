//! Redis storage backend.
//!
//! Key layout under the configured prefix (default `solana:`):
//!
//! | Kind          | Key                       | Redis type  |
//! |---------------|---------------------------|-------------|
//! | ordered queue | `{prefix}queue:{name}`    | sorted set  |
//! | queue seq     | `{prefix}seq:{name}`      | string      |
//! | list          | `{prefix}list:{key}`      | list        |
//! | hash          | `{prefix}hash:{key}`      | hash        |
//!
//! Sorted-set members are `{seq}|{value}` so equal values pushed twice stay
//! two items. Scores are `f64`; ranks above 2^53 lose precision.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};

use chainpipe_core::error::StoreError;
use chainpipe_core::store::TaskStore;

/// Connection settings for [`RedisStore`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisStoreConfig {
    #[serde(default = "default_url")]
    pub url: String,
    #[serde(default = "default_prefix")]
    pub key_prefix: String,
}

fn default_url() -> String {
    "redis://127.0.0.1:6379/0".into()
}

fn default_prefix() -> String {
    "solana:".into()
}

impl Default for RedisStoreConfig {
    fn default() -> Self {
        Self {
            url: default_url(),
            key_prefix: default_prefix(),
        }
    }
}

/// [`TaskStore`] over a single multiplexed Redis connection.
#[derive(Clone)]
pub struct RedisStore {
    conn: MultiplexedConnection,
    prefix: String,
}

fn backend(key: &str, e: redis::RedisError) -> StoreError {
    if e.kind() == redis::ErrorKind::TypeError {
        StoreError::WrongKind { key: key.to_string() }
    } else {
        StoreError::Backend(e.to_string())
    }
}

impl RedisStore {
    /// Open the connection and verify it with a `PING`.
    pub async fn connect(config: &RedisStoreConfig) -> Result<Self, StoreError> {
        let client = redis::Client::open(config.url.as_str())
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        let mut conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;

        tracing::info!(prefix = %config.key_prefix, "connected to redis");
        Ok(Self {
            conn,
            prefix: config.key_prefix.clone(),
        })
    }

    fn queue_key(&self, name: &str) -> String {
        format!("{}queue:{name}", self.prefix)
    }

    fn seq_key(&self, name: &str) -> String {
        format!("{}seq:{name}", self.prefix)
    }

    fn list_key(&self, key: &str) -> String {
        format!("{}list:{key}", self.prefix)
    }

    fn hash_key(&self, key: &str) -> String {
        format!("{}hash:{key}", self.prefix)
    }
}

fn encode_member(seq: i64, value: &str) -> String {
    format!("{seq}|{value}")
}

fn decode_member(member: &str) -> &str {
    member.split_once('|').map(|(_, v)| v).unwrap_or(member)
}

#[async_trait]
impl TaskStore for RedisStore {
    async fn push_min(&self, queue: &str, value: String, rank: i64) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let key = self.queue_key(queue);
        let seq: i64 = conn
            .incr(self.seq_key(queue), 1)
            .await
            .map_err(|e| backend(&key, e))?;
        let _: () = conn
            .zadd(&key, encode_member(seq, &value), rank as f64)
            .await
            .map_err(|e| backend(&key, e))?;
        Ok(())
    }

    async fn pop_min(&self, queue: &str) -> Result<Option<(String, i64)>, StoreError> {
        let mut conn = self.conn.clone();
        let key = self.queue_key(queue);
        let popped: Vec<(String, f64)> = conn
            .zpopmin(&key, 1)
            .await
            .map_err(|e| backend(&key, e))?;
        Ok(popped
            .into_iter()
            .next()
            .map(|(member, score)| (decode_member(&member).to_string(), score as i64)))
    }

    async fn push_list(&self, key: &str, value: String) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let key = self.list_key(key);
        let _: () = conn.rpush(&key, value).await.map_err(|e| backend(&key, e))?;
        Ok(())
    }

    async fn pop_list(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.conn.clone();
        let key = self.list_key(key);
        conn.lpop(&key, None).await.map_err(|e| backend(&key, e))
    }

    async fn set_field(
        &self,
        hash: &str,
        field: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let key = self.hash_key(hash);
        let mut pipe = redis::pipe();
        pipe.hset(&key, field, value).ignore();
        if let Some(ttl) = ttl {
            let secs = i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX).max(1);
            pipe.expire(&key, secs).ignore();
        }
        pipe.query_async::<_, ()>(&mut conn)
            .await
            .map_err(|e| backend(&key, e))
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let keys = vec![self.queue_key(key), self.list_key(key), self.hash_key(key)];
        let found: usize = conn.exists(keys).await.map_err(|e| backend(key, e))?;
        Ok(found > 0)
    }

    async fn length(&self, key: &str) -> Result<usize, StoreError> {
        let mut conn = self.conn.clone();
        let (queued, listed, fields): (usize, usize, usize) = redis::pipe()
            .zcard(self.queue_key(key))
            .llen(self.list_key(key))
            .hlen(self.hash_key(key))
            .query_async(&mut conn)
            .await
            .map_err(|e| backend(key, e))?;
        Ok(queued + listed + fields)
    }
}

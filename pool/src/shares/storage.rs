/// Redis Async Storage - key layout and atomic writes
///
/// Every component shares one key namespace (`<prefix>:...`). Balance and
/// round mutations are expressed as `StoreOp` lists and applied in one
/// MULTI/EXEC so a transition is never half-written.
///
/// Uses redis::aio::ConnectionManager for async operations

use anyhow::{anyhow, Result};
use redis::AsyncCommands;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::metrics::prometheus as metrics;

/// Key builder for the configured prefix
#[derive(Debug, Clone)]
pub struct Keys {
    prefix: String,
}

impl Keys {
    pub fn new(prefix: &str) -> Self {
        Self { prefix: prefix.to_string() }
    }

    fn key(&self, suffix: &str) -> String {
        format!("{}:{}", self.prefix, suffix)
    }

    pub fn round_current(&self) -> String {
        self.key("shares:roundCurrent")
    }

    pub fn round(&self, height: u64) -> String {
        self.key(&format!("shares:round{}", height))
    }

    pub fn worker(&self, worker: &str) -> String {
        self.key(&format!("workers:{}", worker))
    }

    /// Pattern matching every worker hash
    pub fn workers_pattern(&self) -> String {
        self.key("workers:*")
    }

    pub fn unique_worker(&self, worker: &str, name: &str) -> String {
        self.key(&format!("unique_workers:{}:{}", worker, name))
    }

    pub fn hashrate(&self) -> String {
        self.key("hashrate")
    }

    pub fn stats(&self) -> String {
        self.key("stats")
    }

    pub fn candidates(&self) -> String {
        self.key("blocks:candidates")
    }

    pub fn matured(&self) -> String {
        self.key("blocks:matured")
    }

    pub fn payments_all(&self) -> String {
        self.key("payments:all")
    }

    pub fn payments(&self, worker: &str) -> String {
        self.key(&format!("payments:{}", worker))
    }

    pub fn pasa_payments_all(&self) -> String {
        self.key("pasaPayments:all")
    }

    pub fn pasa_payments(&self, worker: &str) -> String {
        self.key(&format!("pasaPayments:{}", worker))
    }

    pub fn pasa_donations(&self) -> String {
        self.key("pasaPayments:donation")
    }

    pub fn outbox(&self) -> String {
        self.key("payments:outbox")
    }

    pub fn notifications(&self) -> String {
        self.key("notifications")
    }

    /// Worker identity from a `workers:<id>` key
    pub fn worker_from_key<'a>(&self, key: &'a str) -> Option<&'a str> {
        key.strip_prefix(&self.prefix)?.strip_prefix(":workers:")
    }
}

/// One command inside an atomic transaction
#[derive(Debug, Clone, PartialEq)]
pub enum StoreOp {
    HIncrBy { key: String, field: String, delta: i64 },
    HSet { key: String, field: String, value: String },
    HDel { key: String, field: String },
    ZAdd { key: String, score: i64, member: String },
    ZRem { key: String, member: String },
    RPush { key: String, value: String },
    Del { key: String },
    Expire { key: String, seconds: i64 },
    /// No-op when the target exists
    RenameNx { from: String, to: String },
}

impl StoreOp {
    pub fn hincrby(key: impl Into<String>, field: impl Into<String>, delta: i64) -> Self {
        StoreOp::HIncrBy { key: key.into(), field: field.into(), delta }
    }

    pub fn hset(key: impl Into<String>, field: impl Into<String>, value: impl ToString) -> Self {
        StoreOp::HSet { key: key.into(), field: field.into(), value: value.to_string() }
    }

    pub fn zadd(key: impl Into<String>, score: i64, member: impl Into<String>) -> Self {
        StoreOp::ZAdd { key: key.into(), score, member: member.into() }
    }

    pub fn zrem(key: impl Into<String>, member: impl Into<String>) -> Self {
        StoreOp::ZRem { key: key.into(), member: member.into() }
    }

    pub fn rename_nx(from: impl Into<String>, to: impl Into<String>) -> Self {
        StoreOp::RenameNx { from: from.into(), to: to.into() }
    }

    fn append_to(&self, pipe: &mut redis::Pipeline) {
        let cmd = match self {
            StoreOp::HIncrBy { key, field, delta } => pipe.cmd("HINCRBY").arg(key).arg(field).arg(*delta),
            StoreOp::HSet { key, field, value } => pipe.cmd("HSET").arg(key).arg(field).arg(value),
            StoreOp::HDel { key, field } => pipe.cmd("HDEL").arg(key).arg(field),
            StoreOp::ZAdd { key, score, member } => pipe.cmd("ZADD").arg(key).arg(*score).arg(member),
            StoreOp::ZRem { key, member } => pipe.cmd("ZREM").arg(key).arg(member),
            StoreOp::RPush { key, value } => pipe.cmd("RPUSH").arg(key).arg(value),
            StoreOp::Del { key } => pipe.cmd("DEL").arg(key),
            StoreOp::Expire { key, seconds } => pipe.cmd("EXPIRE").arg(key).arg(*seconds),
            StoreOp::RenameNx { from, to } => pipe.cmd("RENAMENX").arg(from).arg(to),
        };
        cmd.ignore();
    }
}

/// Redis storage manager
pub struct RedisStorage {
    client: redis::Client,
    connection: Arc<RwLock<Option<redis::aio::ConnectionManager>>>,
    keys: Keys,
}

impl RedisStorage {
    /// Create new Redis storage
    pub fn new(redis_url: &str, prefix: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| anyhow!("Failed to create Redis client: {}", e))?;

        Ok(Self {
            client,
            connection: Arc::new(RwLock::new(None)),
            keys: Keys::new(prefix),
        })
    }

    pub fn keys(&self) -> &Keys {
        &self.keys
    }

    /// Get async connection (lazy initialization)
    pub async fn connection(&self) -> Result<redis::aio::ConnectionManager> {
        let mut conn_guard = self.connection.write().await;

        if let Some(manager) = conn_guard.as_ref() {
            return Ok(manager.clone());
        }
        let manager = self
            .client
            .get_connection_manager()
            .await
            .map_err(|e| anyhow!("Failed to get connection manager: {}", e))?;
        *conn_guard = Some(manager.clone());
        Ok(manager)
    }

    /// Applies all ops in one MULTI/EXEC.
    pub async fn apply_atomic(&self, ops: &[StoreOp]) -> Result<()> {
        if ops.is_empty() {
            return Ok(());
        }
        let mut conn = self.connection().await?;
        let mut pipe = redis::pipe();
        pipe.atomic();
        for op in ops {
            op.append_to(&mut pipe);
        }
        pipe.query_async::<_, ()>(&mut conn).await.map_err(|e| {
            metrics::inc_redis_errors();
            anyhow!("Failed to apply transaction of {} commands: {}", ops.len(), e)
        })
    }

    pub async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>> {
        let mut conn = self.connection().await?;
        conn.hgetall(key).await.map_err(|e| {
            metrics::inc_redis_errors();
            anyhow!("Failed to read {}: {}", key, e)
        })
    }

    /// Round share weights per worker, unparsable entries skipped
    pub async fn round_shares(&self, height: u64) -> Result<HashMap<String, i64>> {
        let raw = self.hgetall(&self.keys.round(height)).await?;
        Ok(raw
            .into_iter()
            .filter_map(|(worker, weight)| weight.parse::<i64>().ok().map(|w| (worker, w)))
            .collect())
    }

    /// All members of a sorted set, lowest score first
    pub async fn zrange_all(&self, key: &str) -> Result<Vec<String>> {
        let mut conn = self.connection().await?;
        conn.zrange(key, 0, -1).await.map_err(|e| {
            metrics::inc_redis_errors();
            anyhow!("Failed to read {}: {}", key, e)
        })
    }

    /// Members with integer scores, lowest score first
    pub async fn zrange_scored(&self, key: &str) -> Result<Vec<(String, u64)>> {
        let mut conn = self.connection().await?;
        let raw: Vec<(String, f64)> = conn.zrange_withscores(key, 0, -1).await.map_err(|e| {
            metrics::inc_redis_errors();
            anyhow!("Failed to read {}: {}", key, e)
        })?;
        Ok(raw.into_iter().map(|(member, score)| (member, score.max(0.0) as u64)).collect())
    }

    pub async fn hget_i64(&self, key: &str, field: &str) -> Result<i64> {
        let mut conn = self.connection().await?;
        let value: Option<i64> = conn.hget(key, field).await.map_err(|e| {
            metrics::inc_redis_errors();
            anyhow!("Failed to read {} {}: {}", key, field, e)
        })?;
        Ok(value.unwrap_or(0))
    }

    /// Non-blocking key enumeration
    pub async fn scan_keys(&self, pattern: &str) -> Result<Vec<String>> {
        let mut conn = self.connection().await?;
        let mut cursor: u64 = 0;
        let mut keys = Vec::new();
        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(1000)
                .query_async(&mut conn)
                .await
                .map_err(|e| {
                    metrics::inc_redis_errors();
                    anyhow!("Failed to scan {}: {}", pattern, e)
                })?;
            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }
        keys.sort();
        keys.dedup();
        Ok(keys)
    }

    /// Health check
    pub async fn ping(&self) -> Result<()> {
        let mut conn = self.connection().await?;
        let pong: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| anyhow!("Redis PING failed: {}", e))?;

        if pong != "PONG" {
            return Err(anyhow!("Redis health check failed: got {}", pong));
        }

        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::memory::MemoryStore;
    use super::*;

    #[tokio::test]
    async fn test_storage_creation() {
        // Client creation succeeds, connection fails later
        let result = RedisStorage::new("redis://invalid", "pascal");
        assert!(result.is_ok());
        assert!(RedisStorage::new("not a url", "pascal").is_err());
    }

    #[test]
    fn test_keys() {
        let keys = Keys::new("pascal");
        assert_eq!(keys.round_current(), "pascal:shares:roundCurrent");
        assert_eq!(keys.round(400100), "pascal:shares:round400100");
        assert_eq!(keys.worker("77-44.0"), "pascal:workers:77-44.0");
        assert_eq!(keys.unique_worker("77-44.0", "rig1"), "pascal:unique_workers:77-44.0:rig1");
        assert_eq!(keys.pasa_donations(), "pascal:pasaPayments:donation");
        assert_eq!(keys.worker_from_key("pascal:workers:77-44.0"), Some("77-44.0"));
        assert_eq!(keys.worker_from_key("pascal:stats"), None);
    }

    #[test]
    fn test_memory_store_ops() {
        let mut store = MemoryStore::default();
        store.apply(&[
            StoreOp::hincrby("w", "balance", 10),
            StoreOp::hincrby("w", "balance", -3),
            StoreOp::hset("w", "lastShare", 5),
            StoreOp::zadd("z", 1, "a"),
            StoreOp::zadd("z", 2, "b"),
            StoreOp::zrem("z", "a"),
        ]);
        assert_eq!(store.hget_i64("w", "balance"), 7);
        assert_eq!(store.hget_i64("w", "lastShare"), 5);
        assert_eq!(store.members("z"), vec!["b".to_string()]);

        store.apply(&[StoreOp::rename_nx("w", "w2"), StoreOp::hset("w", "lastShare", 6)]);
        assert_eq!(store.hget_i64("w2", "balance"), 7);
        store.apply(&[StoreOp::rename_nx("w", "w2")]);
        assert_eq!(store.hget_i64("w2", "lastShare"), 5);
        assert_eq!(store.hget_i64("w", "lastShare"), 6);
    }

    #[tokio::test]
    #[ignore] // Requires Redis
    async fn test_apply_atomic() {
        let storage = RedisStorage::new("redis://127.0.0.1:6379", "pascal-test").unwrap();
        let key = storage.keys().worker("test");
        storage
            .apply_atomic(&[
                StoreOp::Del { key: key.clone() },
                StoreOp::hincrby(key.clone(), "balance", 42),
            ])
            .await
            .unwrap();
        assert_eq!(storage.hget_i64(&key, "balance").await.unwrap(), 42);
    }
}

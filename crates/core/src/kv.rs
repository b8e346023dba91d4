//! Key/value backing for state that may live outside the process, such as
//! the rate-limit buckets shared by multiple proxy replicas.

use crate::error::GatewayError;
use async_trait::async_trait;
use dashmap::DashMap;
use redis::AsyncCommands;

#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, GatewayError>;
    async fn set(&self, key: &str, value: &str) -> Result<(), GatewayError>;
}

/// Process-local store, the default when no external endpoint is configured.
#[derive(Default)]
pub struct MemoryKvStore {
    entries: DashMap<String, String>,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KvStore for MemoryKvStore {
    async fn get(&self, key: &str) -> Result<Option<String>, GatewayError> {
        Ok(self.entries.get(key).map(|entry| entry.value().clone()))
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), GatewayError> {
        self.entries.insert(key.to_string(), value.to_string());
        Ok(())
    }
}

/// Redis-backed store (TLS, port 6380, managed-cache style endpoint).
pub struct RedisKvStore {
    conn: redis::aio::ConnectionManager,
}

impl RedisKvStore {
    pub async fn connect(host: &str, password: &str) -> Result<Self, GatewayError> {
        let url = format!("rediss://:{password}@{host}:6380/0");
        let client = redis::Client::open(url)
            .map_err(|e| GatewayError::Config(format!("invalid redis endpoint: {e}")))?;
        let conn = redis::aio::ConnectionManager::new(client)
            .await
            .map_err(|e| GatewayError::Network(format!("redis connect failed: {e}")))?;
        Ok(Self { conn })
    }
}

#[async_trait]
impl KvStore for RedisKvStore {
    async fn get(&self, key: &str) -> Result<Option<String>, GatewayError> {
        let mut conn = self.conn.clone();
        conn.get(key)
            .await
            .map_err(|e| GatewayError::Network(format!("redis get failed: {e}")))
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), GatewayError> {
        let mut conn = self.conn.clone();
        conn.set::<_, _, ()>(key, value)
            .await
            .map_err(|e| GatewayError::Network(format!("redis set failed: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_store_round_trip() {
        let store = MemoryKvStore::new();
        assert_eq!(store.get("missing").await.unwrap(), None);
        store.set("k", "v1").await.unwrap();
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("v1"));
        store.set("k", "v2").await.unwrap();
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("v2"));
    }
}

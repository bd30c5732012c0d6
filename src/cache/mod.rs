//! Best-effort read-through cache of per-medicine stock snapshots. The cache
//! is advisory: the database stays authoritative, and stale entries converge
//! on the next invalidation or read-miss.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::AsyncCommands;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("Cache operation failed: {0}")]
    OperationFailed(String),
}

#[async_trait]
pub trait CacheBackend: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError>;
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), CacheError>;
    async fn delete(&self, key: &str) -> Result<(), CacheError>;
    async fn exists(&self, key: &str) -> Result<bool, CacheError>;
}

/// Redis cache backend
pub struct RedisCache {
    conn: redis::aio::ConnectionManager,
}

impl RedisCache {
    pub async fn new(client: Arc<redis::Client>) -> Result<Self, CacheError> {
        let conn = client.get_tokio_connection_manager().await?;
        Ok(Self { conn })
    }
}

#[async_trait]
impl CacheBackend for RedisCache {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let mut conn = self.conn.clone();
        Ok(conn.get(key).await?)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), CacheError> {
        let mut conn = self.conn.clone();
        match ttl {
            Some(ttl) => {
                let _: () = conn.set_ex(key, value, ttl.as_secs() as usize).await?;
            }
            None => {
                let _: () = conn.set(key, value).await?;
            }
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        let mut conn = self.conn.clone();
        let _: () = conn.del(key).await?;
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool, CacheError> {
        let mut conn = self.conn.clone();
        Ok(conn.exists(key).await?)
    }
}

#[derive(Debug, Clone)]
struct CacheEntry {
    value: String,
    expires_at: Option<Instant>,
}

impl CacheEntry {
    fn new(value: String, ttl: Option<Duration>) -> Self {
        Self {
            value,
            expires_at: ttl.map(|d| Instant::now() + d),
        }
    }

    fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| Instant::now() > at)
    }
}

/// In-memory cache backend for tests and brokerless local runs
#[derive(Debug, Clone, Default)]
pub struct InMemoryCache {
    store: Arc<Mutex<HashMap<String, CacheEntry>>>,
}

impl InMemoryCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CacheBackend for InMemoryCache {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let mut store = self.store.lock().unwrap();
        match store.get(key) {
            Some(entry) if entry.is_expired() => {
                store.remove(key);
                Ok(None)
            }
            Some(entry) => Ok(Some(entry.value.clone())),
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), CacheError> {
        let mut store = self.store.lock().unwrap();
        store.insert(key.to_string(), CacheEntry::new(value.to_string(), ttl));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        let mut store = self.store.lock().unwrap();
        store.remove(key);
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool, CacheError> {
        let mut store = self.store.lock().unwrap();
        match store.get(key) {
            Some(entry) if entry.is_expired() => {
                store.remove(key);
                Ok(false)
            }
            Some(_) => Ok(true),
            None => Ok(false),
        }
    }
}

/// Point-in-time view of one medicine's stock, as served from the cache.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StockSnapshot {
    pub medicine_id: i32,
    pub stock_quantity: i32,
    pub unit_price: Decimal,
    pub updated_at: DateTime<Utc>,
}

/// Typed wrapper over a cache backend for stock snapshots.
#[derive(Clone)]
pub struct StockCache {
    backend: Arc<dyn CacheBackend>,
    ttl: Duration,
}

impl StockCache {
    pub fn new(backend: Arc<dyn CacheBackend>, ttl: Duration) -> Self {
        Self { backend, ttl }
    }

    fn key(medicine_id: i32) -> String {
        format!("medicine:stock:{medicine_id}")
    }

    pub async fn get(&self, medicine_id: i32) -> Result<Option<StockSnapshot>, CacheError> {
        let raw = self.backend.get(&Self::key(medicine_id)).await?;
        match raw {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    pub async fn put(&self, snapshot: &StockSnapshot) -> Result<(), CacheError> {
        let raw = serde_json::to_string(snapshot)?;
        self.backend
            .set(&Self::key(snapshot.medicine_id), &raw, Some(self.ttl))
            .await?;
        debug!(medicine_id = snapshot.medicine_id, "stock snapshot cached");
        Ok(())
    }

    pub async fn invalidate(&self, medicine_id: i32) -> Result<(), CacheError> {
        self.backend.delete(&Self::key(medicine_id)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn snapshot(medicine_id: i32, stock_quantity: i32) -> StockSnapshot {
        StockSnapshot {
            medicine_id,
            stock_quantity,
            unit_price: dec!(9.99),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn put_get_invalidate_round_trip() {
        let cache = StockCache::new(Arc::new(InMemoryCache::new()), Duration::from_secs(60));

        assert!(cache.get(1).await.unwrap().is_none());

        cache.put(&snapshot(1, 25)).await.unwrap();
        let cached = cache.get(1).await.unwrap().unwrap();
        assert_eq!(cached.stock_quantity, 25);

        cache.invalidate(1).await.unwrap();
        assert!(cache.get(1).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn expired_entries_read_as_misses() {
        let backend = InMemoryCache::new();
        backend
            .set("medicine:stock:2", "{}", Some(Duration::from_millis(5)))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(backend.get("medicine:stock:2").await.unwrap().is_none());
    }
}

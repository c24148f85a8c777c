//! Redis layer for Ledgerline
//!
//! One multiplexed `ConnectionManager` backs three things:
//!
//! - [`RedisCache`]: JSON values with TTL (the `CacheService` trait), used
//!   for rate lookups
//! - [`RedisLockStore`]: exclusive job locks (`SET NX EX` plus a
//!   token-checked release script)
//! - [`RedisNotificationQueue`]: notification events pushed onto a list
//!   for the delivery workers
//!
//! # Example
//!
//! ```no_run
//! use ledgerline_cache::RedisCache;
//! use ledgerline_core::traits::CacheService;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let cache = RedisCache::new("redis://127.0.0.1:6379").await?;
//!     cache.set("my_key", &"my_value", 60).await?;
//!     let value: Option<String> = cache.get("my_key").await?;
//!     assert_eq!(value, Some("my_value".to_string()));
//!     Ok(())
//! }
//! ```

pub mod keys;
pub mod lock;
pub mod notify;

pub use lock::RedisLockStore;
pub use notify::RedisNotificationQueue;

use async_trait::async_trait;
use ledgerline_core::error::AppError;
use ledgerline_core::traits::CacheService;
use redis::{aio::ConnectionManager, AsyncCommands, Client, RedisError};
use serde::{de::DeserializeOwned, Serialize};
use tracing::{debug, error, warn};

/// Redis cache implementation with connection pooling
///
/// Cloning is cheap; clones share the underlying multiplexed connection.
#[derive(Clone)]
pub struct RedisCache {
    manager: ConnectionManager,
}

impl RedisCache {
    /// Connect to Redis
    ///
    /// # Errors
    ///
    /// Returns `AppError::CacheConnection` if the connection fails
    pub async fn new(url: &str) -> Result<Self, AppError> {
        debug!("Connecting to Redis at {}", url);

        let client = Client::open(url).map_err(|e| {
            error!("Failed to create Redis client: {}", e);
            AppError::CacheConnection(format!("Invalid Redis URL: {}", e))
        })?;

        let manager = ConnectionManager::new(client).await.map_err(|e| {
            error!("Failed to establish Redis connection: {}", e);
            AppError::CacheConnection(format!("Connection failed: {}", e))
        })?;

        debug!("Redis connection established successfully");
        Ok(Self { manager })
    }

    /// A handle on the shared connection
    pub fn connection(&self) -> ConnectionManager {
        self.manager.clone()
    }
}

/// Convert RedisError to AppError
pub(crate) fn map_redis_error(err: RedisError) -> AppError {
    match err.kind() {
        redis::ErrorKind::IoError => {
            error!("Redis I/O error: {}", err);
            AppError::CacheConnection(format!("I/O error: {}", err))
        }
        redis::ErrorKind::TypeError => {
            warn!("Redis type error: {}", err);
            AppError::Cache(format!("Type mismatch: {}", err))
        }
        _ => {
            error!("Redis error: {}", err);
            AppError::Cache(err.to_string())
        }
    }
}

#[async_trait]
impl CacheService for RedisCache {
    async fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, AppError> {
        let mut conn = self.manager.clone();

        let result: Option<String> = conn.get(key).await.map_err(map_redis_error)?;

        match result {
            Some(json) => {
                let value = serde_json::from_str::<T>(&json).map_err(|e| {
                    error!("Failed to deserialize value for key {}: {}", key, e);
                    AppError::Serialization(format!("Deserialization failed: {}", e))
                })?;
                debug!("Cache HIT: {}", key);
                Ok(Some(value))
            }
            None => {
                debug!("Cache MISS: {}", key);
                Ok(None)
            }
        }
    }

    async fn set<T: Serialize + Send + Sync>(
        &self,
        key: &str,
        value: &T,
        ttl_secs: u64,
    ) -> Result<(), AppError> {
        let mut conn = self.manager.clone();
        let json = serde_json::to_string(value)?;

        let _: () = conn
            .set_ex(key, json, ttl_secs)
            .await
            .map_err(map_redis_error)?;

        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, AppError> {
        let mut conn = self.manager.clone();
        let deleted: i32 = conn.del(key).await.map_err(map_redis_error)?;
        Ok(deleted > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Cached {
        prefix: String,
        increment: i32,
    }

    #[tokio::test]
    #[ignore] // Requires Redis running
    async fn test_set_get_delete() {
        let cache = RedisCache::new("redis://127.0.0.1:6379").await.unwrap();

        let value = Cached {
            prefix: "979".to_string(),
            increment: 60,
        };
        cache.set("ledgerline:test:cache", &value, 60).await.unwrap();

        let back: Option<Cached> = cache.get("ledgerline:test:cache").await.unwrap();
        assert_eq!(back, Some(value));

        assert!(cache.delete("ledgerline:test:cache").await.unwrap());
        let gone: Option<Cached> = cache.get("ledgerline:test:cache").await.unwrap();
        assert!(gone.is_none());
    }
}

//! Exclusive job locks in Redis
//!
//! The lock value is the JSON [`LockHolder`], so `holder()` shows which
//! process owns a job. The TTL bounds how long a crashed process can keep
//! a job blocked.

use async_trait::async_trait;
use ledgerline_core::{models::LockHolder, traits::LockStore, AppError};
use redis::{aio::ConnectionManager, AsyncCommands, Script};
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

use crate::map_redis_error;

// Deletes the key only while it still carries the caller's token
const RELEASE_SCRIPT: &str = r#"
local current = redis.call('GET', KEYS[1])
if not current then
    return 0
end
local ok, holder = pcall(cjson.decode, current)
if ok and holder['token'] == ARGV[1] then
    return redis.call('DEL', KEYS[1])
end
return 0
"#;

#[derive(Clone)]
pub struct RedisLockStore {
    manager: ConnectionManager,
}

impl RedisLockStore {
    pub fn new(manager: ConnectionManager) -> Self {
        Self { manager }
    }
}

fn ttl_secs(ttl: Duration) -> u64 {
    ttl.as_secs().max(1)
}

#[async_trait]
impl LockStore for RedisLockStore {
    #[instrument(skip(self, holder), fields(token = %holder.token))]
    async fn acquire(
        &self,
        key: &str,
        ttl: Duration,
        holder: &LockHolder,
        force: bool,
    ) -> Result<bool, AppError> {
        let mut conn = self.manager.clone();

        if force {
            let removed: i32 = conn.del(key).await.map_err(map_redis_error)?;
            if removed > 0 {
                warn!("Forced release of lock {}", key);
            }
        }

        let value = serde_json::to_string(holder)?;
        let result: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("EX")
            .arg(ttl_secs(ttl))
            .arg("NX")
            .query_async(&mut conn)
            .await
            .map_err(map_redis_error)?;

        let acquired = result.is_some();
        if acquired {
            info!("Acquired lock {} for {}s", key, ttl_secs(ttl));
        } else {
            debug!("Lock {} is held by another process", key);
        }
        Ok(acquired)
    }

    #[instrument(skip(self, holder), fields(token = %holder.token))]
    async fn release(&self, key: &str, holder: &LockHolder) -> Result<bool, AppError> {
        let mut conn = self.manager.clone();
        let removed: i32 = Script::new(RELEASE_SCRIPT)
            .key(key)
            .arg(&holder.token)
            .invoke_async(&mut conn)
            .await
            .map_err(map_redis_error)?;

        if removed == 0 {
            warn!("Lock {} was no longer ours at release", key);
        }
        Ok(removed > 0)
    }

    async fn holder(&self, key: &str) -> Result<Option<LockHolder>, AppError> {
        let mut conn = self.manager.clone();
        let value: Option<String> = conn.get(key).await.map_err(map_redis_error)?;

        match value {
            Some(json) => match serde_json::from_str::<LockHolder>(&json) {
                Ok(holder) => Ok(Some(holder)),
                Err(e) => {
                    warn!("Unreadable holder on lock {}: {}", key, e);
                    Ok(None)
                }
            },
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{keys, RedisCache};

    #[test]
    fn test_ttl_never_zero() {
        assert_eq!(ttl_secs(Duration::from_millis(200)), 1);
        assert_eq!(ttl_secs(Duration::from_secs(3600)), 3600);
    }

    #[tokio::test]
    #[ignore] // Requires Redis running
    async fn test_lock_is_exclusive_until_released() {
        let cache = RedisCache::new("redis://127.0.0.1:6379").await.unwrap();
        let locks = RedisLockStore::new(cache.connection());
        let key = keys::lock_key("test-exclusive");
        let first = LockHolder::for_command("test");
        let second = LockHolder::for_command("test");
        let ttl = Duration::from_secs(30);

        locks.release(&key, &first).await.unwrap();
        assert!(locks.acquire(&key, ttl, &first, false).await.unwrap());
        assert!(!locks.acquire(&key, ttl, &second, false).await.unwrap());
        assert_eq!(locks.holder(&key).await.unwrap(), Some(first.clone()));

        // A stranger's token does not release it
        assert!(!locks.release(&key, &second).await.unwrap());
        assert!(locks.release(&key, &first).await.unwrap());
        assert!(locks.acquire(&key, ttl, &second, false).await.unwrap());

        // Force takes it over
        assert!(locks.acquire(&key, ttl, &first, true).await.unwrap());
        assert!(locks.release(&key, &first).await.unwrap());
    }
}

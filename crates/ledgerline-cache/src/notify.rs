//! Notification queue
//!
//! Events at or above the configured severity are pushed as JSON onto a
//! Redis list; the delivery workers (email, webhooks) pop from the other
//! end.

use async_trait::async_trait;
use ledgerline_core::{
    models::{NotificationEvent, Severity},
    traits::Notifier,
    AppError,
};
use redis::{aio::ConnectionManager, AsyncCommands};
use tracing::{debug, instrument};

use crate::map_redis_error;

#[derive(Clone)]
pub struct RedisNotificationQueue {
    manager: ConnectionManager,
    queue: String,
    min_severity: Severity,
}

impl RedisNotificationQueue {
    pub fn new(manager: ConnectionManager, queue: impl Into<String>, min_severity: Severity) -> Self {
        Self {
            manager,
            queue: queue.into(),
            min_severity,
        }
    }

    fn accepts(&self, event: &NotificationEvent) -> bool {
        event.severity >= self.min_severity
    }
}

#[async_trait]
impl Notifier for RedisNotificationQueue {
    #[instrument(skip(self, event), fields(category = %event.category))]
    async fn notify(&self, event: &NotificationEvent) -> Result<(), AppError> {
        if !self.accepts(event) {
            debug!("Dropping {} notification below {}", event.severity, self.min_severity);
            return Ok(());
        }

        let payload = serde_json::to_string(event)?;
        let mut conn = self.manager.clone();
        let _: i64 = conn
            .lpush(&self.queue, payload)
            .await
            .map_err(map_redis_error)?;

        debug!("Queued {} notification on {}", event.severity, self.queue);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::RedisCache;

    #[tokio::test]
    #[ignore] // Requires Redis running
    async fn test_filters_by_severity() {
        let cache = RedisCache::new("redis://127.0.0.1:6379").await.unwrap();
        let queue_name = "ledgerline:test:notifications";
        let queue = RedisNotificationQueue::new(cache.connection(), queue_name, Severity::Warning);

        let mut conn = cache.connection();
        let _: () = conn.del(queue_name).await.unwrap();

        queue
            .notify(&NotificationEvent::info("cdr.batch", "processed"))
            .await
            .unwrap();
        queue
            .notify(&NotificationEvent::critical("recurring.suspended", "DID suspended"))
            .await
            .unwrap();

        let len: i64 = conn.llen(queue_name).await.unwrap();
        assert_eq!(len, 1);
    }
}

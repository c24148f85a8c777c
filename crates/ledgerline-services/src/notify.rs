//! Notification sinks
//!
//! A failed delivery never fails a job: [`emit`] logs and moves on.

use async_trait::async_trait;
use ledgerline_core::{
    models::{NotificationEvent, Severity},
    traits::Notifier,
    AppError,
};
use std::sync::Arc;
use tracing::{error, info, warn};

/// Logs every event at a level matching its severity
#[derive(Debug, Default, Clone)]
pub struct TracingNotifier;

#[async_trait]
impl Notifier for TracingNotifier {
    async fn notify(&self, event: &NotificationEvent) -> Result<(), AppError> {
        match event.severity {
            Severity::Info => info!(
                category = %event.category,
                metadata = %event.metadata,
                "{}", event.message
            ),
            Severity::Warning => warn!(
                category = %event.category,
                metadata = %event.metadata,
                "{}", event.message
            ),
            Severity::Critical => error!(
                category = %event.category,
                metadata = %event.metadata,
                "{}", event.message
            ),
        }
        Ok(())
    }
}

/// Delivers to every sink; succeeds if at least one accepted the event
pub struct FanoutNotifier {
    sinks: Vec<Arc<dyn Notifier>>,
}

impl FanoutNotifier {
    pub fn new(sinks: Vec<Arc<dyn Notifier>>) -> Self {
        Self { sinks }
    }
}

#[async_trait]
impl Notifier for FanoutNotifier {
    async fn notify(&self, event: &NotificationEvent) -> Result<(), AppError> {
        let mut last_error = None;
        let mut delivered = self.sinks.is_empty();

        for sink in &self.sinks {
            match sink.notify(event).await {
                Ok(()) => delivered = true,
                Err(e) => last_error = Some(e),
            }
        }

        match (delivered, last_error) {
            (false, Some(e)) => Err(AppError::Notification(e.to_string())),
            _ => Ok(()),
        }
    }
}

/// Deliver an event, logging instead of propagating failure
pub async fn emit(notifier: &dyn Notifier, event: NotificationEvent) {
    if let Err(e) = notifier.notify(&event).await {
        warn!("Failed to deliver {} notification: {}", event.category, e);
    }
}

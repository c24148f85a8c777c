//! Notification events handed to the delivery collaborator

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Severity, ordered from least to most urgent
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    #[default]
    Info,
    Warning,
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Info => write!(f, "info"),
            Severity::Warning => write!(f, "warning"),
            Severity::Critical => write!(f, "critical"),
        }
    }
}

impl Severity {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "info" => Some(Severity::Info),
            "warning" | "warn" => Some(Severity::Warning),
            "critical" => Some(Severity::Critical),
            _ => None,
        }
    }
}

/// Structured event: `{severity, category, message, metadata}`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationEvent {
    pub severity: Severity,
    /// Dotted category, e.g. `recurring.suspended`
    pub category: String,
    pub message: String,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl NotificationEvent {
    pub fn new(severity: Severity, category: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            severity,
            category: category.into(),
            message: message.into(),
            metadata: serde_json::Value::Object(Default::default()),
            created_at: Utc::now(),
        }
    }

    pub fn info(category: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(Severity::Info, category, message)
    }

    pub fn warning(category: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(Severity::Warning, category, message)
    }

    pub fn critical(category: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(Severity::Critical, category, message)
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_order() {
        assert!(Severity::Info < Severity::Warning);
        assert!(Severity::Warning < Severity::Critical);
        assert_eq!(Severity::from_str("WARN"), Some(Severity::Warning));
    }

    #[test]
    fn test_event_serializes_flat() {
        let event = NotificationEvent::warning("recurring.suspended", "DID suspended")
            .with_metadata(serde_json::json!({ "required": "5.00" }));
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["severity"], "warning");
        assert_eq!(json["metadata"]["required"], "5.00");
    }
}

//! Job lock holder metadata

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Who holds a job lock
///
/// Stored as the lock value so operators can see which process owns a
/// job. `token` is what a release must present.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockHolder {
    pub token: String,
    pub command: String,
    pub pid: u32,
    pub host: String,
    pub started_at: DateTime<Utc>,
}

impl LockHolder {
    /// Holder metadata for the current process
    pub fn for_command(command: impl Into<String>) -> Self {
        Self {
            token: Uuid::new_v4().to_string(),
            command: command.into(),
            pid: std::process::id(),
            host: hostname::get()
                .ok()
                .and_then(|h| h.into_string().ok())
                .unwrap_or_else(|| "unknown".to_string()),
            started_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_holder_tokens_are_unique() {
        let a = LockHolder::for_command("process-cdrs");
        let b = LockHolder::for_command("process-cdrs");
        assert_ne!(a.token, b.token);
        assert_eq!(a.pid, std::process::id());

        let json = serde_json::to_string(&a).unwrap();
        let back: LockHolder = serde_json::from_str(&json).unwrap();
        assert_eq!(back, a);
    }
}

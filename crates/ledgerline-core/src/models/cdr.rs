//! Raw call data as reported by the telephony switch
//!
//! `RawCdr` is what the switch emits once a call has ended; `ActiveCall`
//! is a snapshot of a call that is still connected. Both are inputs only:
//! the billing jobs turn them into [`CallRecord`](super::CallRecord)s.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::AppError;

/// Final disposition of a call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Disposition {
    Answered,
    NoAnswer,
    Busy,
    Failed,
    Cancelled,
    Other(String),
}

impl Disposition {
    /// Parse a disposition or hangup cause (case-insensitive)
    ///
    /// Accepts both generic CDR dispositions (`ANSWERED`, `completed`) and
    /// FreeSWITCH hangup causes (`NORMAL_CLEARING`, `USER_BUSY`, ...).
    pub fn parse(s: &str) -> Self {
        match s.trim().to_uppercase().as_str() {
            "ANSWERED" | "ANSWER" | "COMPLETED" | "NORMAL_CLEARING" => Disposition::Answered,
            "NO ANSWER" | "NO_ANSWER" | "NOANSWER" | "NO_USER_RESPONSE" => Disposition::NoAnswer,
            "BUSY" | "USER_BUSY" => Disposition::Busy,
            "CANCEL" | "CANCELLED" | "ORIGINATOR_CANCEL" => Disposition::Cancelled,
            "FAILED" | "CALL_REJECTED" | "UNALLOCATED_NUMBER" | "NORMAL_TEMPORARY_FAILURE" => {
                Disposition::Failed
            }
            other => Disposition::Other(other.to_string()),
        }
    }

    #[inline]
    pub fn is_answered(&self) -> bool {
        matches!(self, Disposition::Answered)
    }
}

impl fmt::Display for Disposition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Disposition::Answered => write!(f, "answered"),
            Disposition::NoAnswer => write!(f, "no_answer"),
            Disposition::Busy => write!(f, "busy"),
            Disposition::Failed => write!(f, "failed"),
            Disposition::Cancelled => write!(f, "cancelled"),
            Disposition::Other(s) => write!(f, "{}", s.to_lowercase()),
        }
    }
}

/// Raw CDR as fetched from the telephony collaborator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawCdr {
    /// External call identifier (de-duplication key)
    pub call_id: String,

    /// Caller number (ANI)
    pub source: String,

    /// Called number (DNIS)
    pub destination: String,

    /// Call start timestamp
    pub start_time: DateTime<Utc>,

    /// Answer timestamp, if the call was answered
    pub answer_time: Option<DateTime<Utc>>,

    /// Hangup timestamp
    pub end_time: Option<DateTime<Utc>>,

    /// Total duration in seconds (setup + talk)
    pub duration: i64,

    /// Talk time in seconds, when the switch reports it separately
    pub billsec: Option<i64>,

    /// Disposition or hangup cause
    pub disposition: String,
}

impl RawCdr {
    /// Reject records the pipeline cannot safely bill
    pub fn validate(&self) -> Result<(), AppError> {
        if self.call_id.trim().is_empty() {
            return Err(AppError::MalformedRecord("missing call identifier".to_string()));
        }
        if self.duration < 0 || self.billsec.is_some_and(|b| b < 0) {
            return Err(AppError::MalformedRecord(format!(
                "negative duration on call {}",
                self.call_id
            )));
        }
        Ok(())
    }

    /// Talk time used for billing
    #[inline]
    pub fn billable_duration(&self) -> i64 {
        self.billsec.unwrap_or(self.duration).max(0)
    }

    pub fn disposition(&self) -> Disposition {
        Disposition::parse(&self.disposition)
    }
}

/// Position in the CDR stream, ordered by `(end_time, call_id)`
///
/// Fetches page strictly after a cursor, so CDRs sharing an end time are
/// never skipped or re-read.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CdrCursor {
    pub end_time: DateTime<Utc>,
    pub call_id: String,
}

impl CdrCursor {
    /// Cursor just past `raw`; `None` for a CDR without an end time
    pub fn after(raw: &RawCdr) -> Option<Self> {
        raw.end_time.map(|end_time| Self {
            end_time,
            call_id: raw.call_id.clone(),
        })
    }

    /// Whether `raw` sorts strictly after this cursor
    pub fn precedes(&self, raw: &RawCdr) -> bool {
        match raw.end_time {
            Some(end_time) => {
                (end_time, raw.call_id.as_str()) > (self.end_time, self.call_id.as_str())
            }
            None => false,
        }
    }
}

/// A call that is currently connected on the switch
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActiveCall {
    /// External call identifier
    pub call_id: String,

    /// Caller number
    pub source: String,

    /// Called number
    pub destination: String,

    /// When the call was set up
    pub start_time: DateTime<Utc>,

    /// When the call was answered
    pub answer_time: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(disposition: &str) -> RawCdr {
        RawCdr {
            call_id: "abc-1".to_string(),
            source: "5551000".to_string(),
            destination: "5199988877".to_string(),
            start_time: Utc::now(),
            answer_time: None,
            end_time: None,
            duration: 30,
            billsec: Some(25),
            disposition: disposition.to_string(),
        }
    }

    #[test]
    fn test_disposition_parse() {
        assert_eq!(Disposition::parse("ANSWERED"), Disposition::Answered);
        assert_eq!(Disposition::parse("normal_clearing"), Disposition::Answered);
        assert_eq!(Disposition::parse("USER_BUSY"), Disposition::Busy);
        assert_eq!(Disposition::parse("NO ANSWER"), Disposition::NoAnswer);
        assert_eq!(
            Disposition::parse("recovery_on_timer_expire"),
            Disposition::Other("RECOVERY_ON_TIMER_EXPIRE".to_string())
        );
    }

    #[test]
    fn test_billable_duration_prefers_billsec() {
        assert_eq!(raw("ANSWERED").billable_duration(), 25);

        let mut cdr = raw("ANSWERED");
        cdr.billsec = None;
        assert_eq!(cdr.billable_duration(), 30);
    }

    #[test]
    fn test_validate() {
        assert!(raw("ANSWERED").validate().is_ok());

        let mut cdr = raw("ANSWERED");
        cdr.call_id = "  ".to_string();
        assert!(matches!(cdr.validate(), Err(AppError::MalformedRecord(_))));

        let mut cdr = raw("ANSWERED");
        cdr.duration = -1;
        assert!(cdr.validate().is_err());
    }

    #[test]
    fn test_cursor_orders_ties_by_call_id() {
        let end = Utc::now();
        let mut first = raw("ANSWERED");
        first.end_time = Some(end);
        let mut second = first.clone();
        second.call_id = "abc-2".to_string();

        let cursor = CdrCursor::after(&first).unwrap();
        assert!(!cursor.precedes(&first));
        assert!(cursor.precedes(&second));
        assert!(!CdrCursor::after(&second).unwrap().precedes(&first));

        // no end time, no position
        assert!(CdrCursor::after(&raw("ANSWERED")).is_none());
        assert!(!cursor.precedes(&raw("ANSWERED")));
    }
}

//! Call record model and its billing state machine
//!
//! A `CallRecord` is the billable view of one call attempt. It is created
//! either when the monitor first sees the call connected or when its raw
//! CDR arrives, and is driven through [`BillingStatus`] by the ingestion
//! pipeline and the real-time monitor.
//!
//! ```text
//! pending ──claim──▶ processing ──charged──────▶ completed
//!    ▲                   │  ──not billable──▶ no_billing_required
//!    │                   └──fail──▶ failed ──(retries exhausted)──▶ permanently_failed
//!    └──────────────── failed ──claim──▶ processing
//! ```

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

use super::cdr::{ActiveCall, Disposition, RawCdr};
use crate::error::AppError;

/// Billing status of a call record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BillingStatus {
    #[default]
    Pending,
    Processing,
    Completed,
    NoBillingRequired,
    Failed,
    PermanentlyFailed,
}

impl fmt::Display for BillingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl BillingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BillingStatus::Pending => "pending",
            BillingStatus::Processing => "processing",
            BillingStatus::Completed => "completed",
            BillingStatus::NoBillingRequired => "no_billing_required",
            BillingStatus::Failed => "failed",
            BillingStatus::PermanentlyFailed => "permanently_failed",
        }
    }

    /// Parse from string
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "pending" => Some(BillingStatus::Pending),
            "processing" => Some(BillingStatus::Processing),
            "completed" => Some(BillingStatus::Completed),
            "no_billing_required" => Some(BillingStatus::NoBillingRequired),
            "failed" => Some(BillingStatus::Failed),
            "permanently_failed" => Some(BillingStatus::PermanentlyFailed),
            _ => None,
        }
    }

    /// No automatic processing ever touches a terminal record again
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BillingStatus::Completed
                | BillingStatus::NoBillingRequired
                | BillingStatus::PermanentlyFailed
        )
    }
}

/// Input to the billing state machine
#[derive(Debug, Clone)]
pub enum BillingEvent {
    /// A job takes ownership of the record for this run
    Claim,
    /// The charge (or credit) for the final cost was applied
    Charged { cost: Decimal },
    /// The call is not billable; cost is zero and the ledger is untouched
    NotBillable,
    /// The attempt failed
    Failed {
        code: String,
        message: String,
        retryable: bool,
        max_retries: i32,
    },
}

impl BillingEvent {
    /// Build a failure event from an application error
    pub fn failure(err: &AppError, max_retries: i32) -> Self {
        BillingEvent::Failed {
            code: err.error_code().to_string(),
            message: err.to_string(),
            retryable: err.is_retryable(),
            max_retries,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            BillingEvent::Claim => "processing",
            BillingEvent::Charged { .. } => "completed",
            BillingEvent::NotBillable => "no_billing_required",
            BillingEvent::Failed { .. } => "failed",
        }
    }
}

/// Pure transition table
///
/// `retry_count` is the count *after* this event has been applied, so a
/// failure that brings it to `max_retries` is terminal.
pub fn next_status(
    current: BillingStatus,
    event: &BillingEvent,
    retry_count: i32,
) -> Result<BillingStatus, AppError> {
    use BillingStatus::*;

    let next = match (current, event) {
        // Processing -> Processing re-claims a record abandoned by a crashed run
        (Pending | Failed | Processing, BillingEvent::Claim) => Processing,
        (Processing, BillingEvent::Charged { .. }) => Completed,
        (Processing, BillingEvent::NotBillable) => NoBillingRequired,
        (
            Processing,
            BillingEvent::Failed {
                retryable,
                max_retries,
                ..
            },
        ) => {
            if !*retryable || retry_count >= *max_retries {
                PermanentlyFailed
            } else {
                Failed
            }
        }
        (from, event) => {
            return Err(AppError::InvalidTransition {
                from: from.to_string(),
                to: event.name().to_string(),
            })
        }
    };

    Ok(next)
}

/// Connection state of the underlying call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CallStatus {
    /// Still connected on the switch
    Connected,
    /// Ended normally; final CDR received
    #[default]
    Ended,
    /// Hung up by the monitor
    Terminated,
}

impl fmt::Display for CallStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallStatus::Connected => write!(f, "connected"),
            CallStatus::Ended => write!(f, "ended"),
            CallStatus::Terminated => write!(f, "terminated"),
        }
    }
}

impl CallStatus {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "connected" => Some(CallStatus::Connected),
            "ended" => Some(CallStatus::Ended),
            "terminated" => Some(CallStatus::Terminated),
            _ => None,
        }
    }
}

/// One entry of a record's billing log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BillingAttempt {
    pub at: DateTime<Utc>,
    pub status: BillingStatus,
    pub retry_count: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Structured, append-only billing details of a call record
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BillingDetails {
    /// Last error message, cleared on success
    #[serde(default)]
    pub last_error: Option<String>,

    /// When the last failed attempt happened
    #[serde(default)]
    pub last_failed_at: Option<DateTime<Utc>>,

    /// Amount that could not be collected from a prepaid balance
    #[serde(default)]
    pub shortfall: Decimal,

    /// Failed hang-up attempts by the monitor
    #[serde(default)]
    pub termination_attempts: u32,

    /// Why the monitor hung the call up
    #[serde(default)]
    pub termination_reason: Option<String>,

    /// Last monitor pass that saw the call connected
    #[serde(default)]
    pub last_seen_at: Option<DateTime<Utc>>,

    /// Closed by the monitor from its last sighting; no CDR had arrived
    #[serde(default)]
    pub closed_without_cdr: bool,

    /// Attempt history; entries are only ever appended
    #[serde(default)]
    pub attempts: Vec<BillingAttempt>,
}

impl BillingDetails {
    fn append(&mut self, attempt: BillingAttempt) {
        self.attempts.push(attempt);
    }
}

/// Call record entity
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallRecord {
    /// Unique identifier
    pub id: i64,

    /// External call identifier (unique)
    pub call_id: String,

    /// Payer account, once resolved
    pub account_id: Option<i32>,

    /// Caller number
    pub source: String,

    /// Called number
    pub destination: String,

    /// Call start timestamp
    pub start_time: DateTime<Utc>,

    /// Answer timestamp
    pub answer_time: Option<DateTime<Utc>>,

    /// Hangup timestamp
    pub end_time: Option<DateTime<Utc>>,

    /// Total duration in seconds
    pub duration: i64,

    /// Talk time in seconds
    pub billsec: i64,

    /// Final disposition, once known
    pub disposition: Option<String>,

    /// Connection state
    pub call_status: CallStatus,

    /// Applied rate per minute
    pub rate_per_minute: Option<Decimal>,

    /// Applied billing increment in seconds
    pub billing_increment: Option<i32>,

    /// Applied connection fee
    pub connection_fee: Decimal,

    /// Final computed cost
    pub cost: Option<Decimal>,

    /// Net amount already collected through the ledger for this call
    pub charged_amount: Decimal,

    /// Talk seconds covered by `charged_amount` (increment-rounded)
    pub charged_seconds: i64,

    /// Billing state
    pub billing_status: BillingStatus,

    /// Failed billing attempts so far
    pub retry_count: i32,

    /// Error/retry log
    pub billing_details: BillingDetails,

    /// Creation timestamp
    pub created_at: DateTime<Utc>,

    /// Last update timestamp
    pub updated_at: DateTime<Utc>,
}

impl CallRecord {
    /// New pending record from a final CDR
    pub fn from_raw_cdr(raw: &RawCdr) -> Self {
        let now = Utc::now();
        Self {
            call_id: raw.call_id.clone(),
            source: raw.source.clone(),
            destination: raw.destination.clone(),
            start_time: raw.start_time,
            answer_time: raw.answer_time,
            end_time: raw.end_time,
            duration: raw.duration,
            billsec: raw.billable_duration(),
            disposition: Some(raw.disposition.clone()),
            call_status: CallStatus::Ended,
            created_at: now,
            updated_at: now,
            ..Default::default()
        }
    }

    /// New pending record for a call seen connected on the switch
    pub fn from_active_call(call: &ActiveCall) -> Self {
        let now = Utc::now();
        Self {
            call_id: call.call_id.clone(),
            source: call.source.clone(),
            destination: call.destination.clone(),
            start_time: call.start_time,
            answer_time: Some(call.answer_time),
            call_status: CallStatus::Connected,
            created_at: now,
            updated_at: now,
            ..Default::default()
        }
    }

    /// Fold the final CDR into a record first created while connected
    pub fn merge_final_cdr(&mut self, raw: &RawCdr) {
        self.answer_time = raw.answer_time.or(self.answer_time);
        self.end_time = raw.end_time;
        self.duration = raw.duration;
        self.billsec = raw.billable_duration();
        self.disposition = Some(raw.disposition.clone());
        if self.call_status == CallStatus::Connected {
            self.call_status = CallStatus::Ended;
        }
        self.billing_details.closed_without_cdr = false;
        self.updated_at = Utc::now();
    }

    /// When the monitor last saw the call connected
    pub fn last_seen(&self) -> DateTime<Utc> {
        self.billing_details.last_seen_at.unwrap_or(self.created_at)
    }

    /// Close a connected call whose final CDR never arrived
    ///
    /// Talk time runs to the last sighting, so the record can be settled
    /// like any ended call. A CDR arriving later still replaces it.
    pub fn close_unseen(&mut self) {
        let last_seen = self.last_seen();
        self.end_time = Some(last_seen);
        self.duration = (last_seen - self.start_time).num_seconds().max(0);
        self.billsec = self.elapsed_seconds(last_seen);
        if self.answer_time.is_some() {
            self.disposition = Some("ANSWERED".to_string());
        }
        self.call_status = CallStatus::Ended;
        self.billing_details.closed_without_cdr = true;
        self.updated_at = Utc::now();
    }

    /// Billable: answered with nonzero talk time
    pub fn is_billable(&self) -> bool {
        self.billsec > 0
            && self
                .disposition
                .as_deref()
                .map(|d| Disposition::parse(d).is_answered())
                .unwrap_or(false)
    }

    /// Seconds elapsed since answer, as seen at `now`
    pub fn elapsed_seconds(&self, now: DateTime<Utc>) -> i64 {
        self.answer_time
            .map(|answered| (now - answered).num_seconds().max(0))
            .unwrap_or(0)
    }

    /// Signed amount still to collect for a final cost
    ///
    /// Negative when the monitor collected more than the final CDR bills
    /// (the difference is credited back).
    #[inline]
    pub fn outstanding(&self, final_cost: Decimal) -> Decimal {
        final_cost - self.charged_amount
    }

    /// Ledger idempotency key for the final CDR settlement
    pub fn settlement_key(&self) -> String {
        format!("cdr:{}", self.call_id)
    }

    /// Ledger idempotency key for the monitor increment that starts at
    /// charge point `from_seconds`
    ///
    /// Keyed on where the increment starts, so a pass that booked it but
    /// failed to record it is recognised by the next one.
    pub fn increment_key(&self, from_seconds: i64) -> String {
        format!("call:{}:{}", self.call_id, from_seconds)
    }

    /// Ledger idempotency key for the settlement after a forced hang-up
    pub fn termination_key(&self) -> String {
        format!("call:{}:final", self.call_id)
    }

    /// Apply a billing event: status transition plus bookkeeping
    pub fn apply(&mut self, event: BillingEvent) -> Result<BillingStatus, AppError> {
        let now = Utc::now();
        let retry_count = match event {
            BillingEvent::Failed { .. } => self.retry_count + 1,
            _ => self.retry_count,
        };
        let next = next_status(self.billing_status, &event, retry_count)?;

        match event {
            BillingEvent::Claim => {}
            BillingEvent::Charged { cost } => {
                self.cost = Some(cost);
                self.billing_details.last_error = None;
                self.billing_details.append(BillingAttempt {
                    at: now,
                    status: next,
                    retry_count,
                    error_code: None,
                    error: None,
                });
            }
            BillingEvent::NotBillable => {
                self.cost = Some(Decimal::ZERO);
            }
            BillingEvent::Failed { code, message, .. } => {
                self.retry_count = retry_count;
                self.billing_details.last_error = Some(message.clone());
                self.billing_details.last_failed_at = Some(now);
                self.billing_details.append(BillingAttempt {
                    at: now,
                    status: next,
                    retry_count,
                    error_code: Some(code),
                    error: Some(message),
                });
            }
        }

        self.billing_status = next;
        self.updated_at = now;
        Ok(next)
    }
}

impl Default for CallRecord {
    fn default() -> Self {
        let now = Utc::now();
        Self {
            id: 0,
            call_id: String::new(),
            account_id: None,
            source: String::new(),
            destination: String::new(),
            start_time: now,
            answer_time: None,
            end_time: None,
            duration: 0,
            billsec: 0,
            disposition: None,
            call_status: CallStatus::Ended,
            rate_per_minute: None,
            billing_increment: None,
            connection_fee: Decimal::ZERO,
            cost: None,
            charged_amount: Decimal::ZERO,
            charged_seconds: 0,
            billing_status: BillingStatus::Pending,
            retry_count: 0,
            billing_details: BillingDetails::default(),
            created_at: now,
            updated_at: now,
        }
    }
}

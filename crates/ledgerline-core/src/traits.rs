//! Common traits for stores, collaborators and services
//!
//! Every job receives its dependencies through these narrow interfaces so
//! that the PostgreSQL/Redis/FreeSWITCH implementations can be swapped for
//! in-memory ones.

use crate::error::AppError;
use crate::models::{
    Account, ActiveCall, BalanceTransaction, BillableResource, BillingPeriod, CallRecord,
    CdrCursor, ChargeRequest, ChargeResult, LockHolder, NotificationEvent, RateCard, RawCdr,
    RecurringDecision,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{de::DeserializeOwned, Serialize};
use std::time::Duration;

/// Exclusive, TTL-bounded job lock
#[async_trait]
pub trait LockStore: Send + Sync {
    /// Take `key` for `holder`
    ///
    /// Returns `false` when another live holder has it. `force` clears any
    /// previous holder first.
    async fn acquire(
        &self,
        key: &str,
        ttl: Duration,
        holder: &LockHolder,
        force: bool,
    ) -> Result<bool, AppError>;

    /// Release `key` if `holder` still owns it
    async fn release(&self, key: &str, holder: &LockHolder) -> Result<bool, AppError>;

    /// Current holder, if any
    async fn holder(&self, key: &str) -> Result<Option<LockHolder>, AppError>;
}

/// Append-only balance ledger
#[async_trait]
pub trait Ledger: Send + Sync {
    /// Atomically append one transaction and move the cached balance
    ///
    /// Serialized per account. Never rejects a charge for driving the
    /// balance negative and never retries. A request whose idempotency key
    /// is already booked returns the original transaction as a duplicate.
    async fn charge_account(&self, request: &ChargeRequest) -> Result<ChargeResult, AppError>;

    /// All transactions of an account in creation order
    async fn transactions(&self, account_id: i32) -> Result<Vec<BalanceTransaction>, AppError>;
}

/// Account lookups
#[async_trait]
pub trait AccountRepository: Send + Sync {
    async fn find_by_id(&self, id: i32) -> Result<Option<Account>, AppError>;

    /// Find account by phone number (ANI)
    async fn find_by_phone(&self, phone: &str) -> Result<Option<Account>, AppError>;

    /// Every account, for auditing
    async fn list_all(&self) -> Result<Vec<Account>, AppError>;
}

/// Call record persistence
///
/// Selection methods only return records a job is allowed to own; no two
/// selections overlap for the same record in the same state.
#[async_trait]
pub trait CallRecordRepository: Send + Sync {
    async fn find_by_call_id(&self, call_id: &str) -> Result<Option<CallRecord>, AppError>;

    /// Insert a new record; the call id is unique
    ///
    /// Returns `None` when a record with the same call id already exists.
    async fn insert(&self, record: &CallRecord) -> Result<Option<CallRecord>, AppError>;

    /// Persist every mutable field of an existing record
    async fn save(&self, record: &CallRecord) -> Result<(), AppError>;

    /// Add a monitor increment to a record without touching its status
    ///
    /// `amount` and `shortfall` are added to the stored values;
    /// `charged_seconds` only ever moves forward.
    async fn add_charge(
        &self,
        call_id: &str,
        amount: Decimal,
        charged_seconds: i64,
        shortfall: Decimal,
    ) -> Result<(), AppError>;

    /// Stamp `billing_details.last_seen_at` on connected records
    async fn mark_seen(&self, call_ids: &[String], seen_at: DateTime<Utc>) -> Result<(), AppError>;

    /// Ended records never processed, plus `processing` records last
    /// touched before `stale_before`
    async fn find_backlog(
        &self,
        stale_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<CallRecord>, AppError>;

    /// `failed` records below `max_retries` last touched before
    /// `cooldown_before`
    async fn find_retryable(
        &self,
        max_retries: i32,
        cooldown_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<CallRecord>, AppError>;

    /// Records of calls still connected and not yet finalized
    async fn find_connected(&self) -> Result<Vec<CallRecord>, AppError>;
}

/// Rate card lookups
#[async_trait]
pub trait RateRepository: Send + Sync {
    /// Find rate by destination using Longest Prefix Match
    async fn find_by_destination(&self, destination: &str) -> Result<Option<RateCard>, AppError>;
}

/// Outcome of one resource inside a recurring chunk
#[derive(Debug, Clone)]
pub struct ResourceOutcome {
    pub resource_id: i64,
    pub number: String,
    pub owner_account_id: i32,
    pub amount: Decimal,
    pub decision: RecurringDecision,
    pub balance_before: Decimal,
    pub balance_after: Decimal,
    pub transaction_id: Option<i64>,
}

/// Billable resource persistence
#[async_trait]
pub trait ResourceRepository: Send + Sync {
    /// Assigned resources due for `period`, ordered by id, after `after_id`
    async fn find_due(
        &self,
        period: BillingPeriod,
        after_id: i64,
        limit: usize,
    ) -> Result<Vec<BillableResource>, AppError>;

    /// Charge, overdue-charge or suspend every listed resource in one
    /// atomic unit
    ///
    /// The owner's balance is read under lock inside the unit and the
    /// decision made with [`RecurringDecision::decide`]. Resources that
    /// already carry an entry for `period` are skipped. Any error rolls the
    /// whole chunk back.
    async fn bill_chunk(
        &self,
        period: BillingPeriod,
        resource_ids: &[i64],
        suspend_insufficient: bool,
    ) -> Result<Vec<ResourceOutcome>, AppError>;
}

/// A persisted setting/watermark
#[derive(Debug, Clone)]
pub struct Setting {
    pub key: String,
    pub value: serde_json::Value,
    pub updated_at: DateTime<Utc>,
}

/// Durable key/value watermark store
#[async_trait]
pub trait SettingsStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Setting>, AppError>;

    async fn put(&self, key: &str, value: serde_json::Value) -> Result<(), AppError>;
}

/// Telephony switch
#[async_trait]
pub trait TelephonyProvider: Send + Sync {
    /// Final CDRs of calls that ended in `[start, end)`, ordered by
    /// `(end_time, call_id)`, starting strictly after `after` when given
    async fn fetch_cdrs(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        after: Option<&CdrCursor>,
        limit: usize,
    ) -> Result<Vec<RawCdr>, AppError>;

    /// Calls currently connected
    async fn active_calls(&self) -> Result<Vec<ActiveCall>, AppError>;

    /// Hang a call up; `false` when the switch did not confirm
    async fn terminate_call(&self, call_id: &str) -> Result<bool, AppError>;
}

/// Notification delivery
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, event: &NotificationEvent) -> Result<(), AppError>;
}

/// Rating service trait
#[async_trait]
pub trait RatingService: Send + Sync {
    /// Find rate for a destination
    async fn find_rate(&self, destination: &str) -> Result<Option<RateCard>, AppError>;

    /// Calculate cost for a destination and duration
    async fn calculate_cost(&self, destination: &str, duration_seconds: i64)
        -> Result<Decimal, AppError>;
}

/// Cache service trait
#[async_trait]
pub trait CacheService: Send + Sync {
    /// Get value from cache
    async fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, AppError>;

    /// Set value in cache with TTL
    async fn set<T: Serialize + Send + Sync>(
        &self,
        key: &str,
        value: &T,
        ttl_secs: u64,
    ) -> Result<(), AppError>;

    /// Delete value from cache
    async fn delete(&self, key: &str) -> Result<bool, AppError>;
}

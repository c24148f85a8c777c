//! Billable resources (DIDs) and billing periods
//!
//! A resource is charged once per calendar month while assigned. Its
//! `billing_history` is an append-only log: the recurring sweep adds one
//! entry per period and never rewrites earlier ones.

use chrono::{DateTime, Datelike, TimeZone, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::AppError;

/// A calendar month, `YYYY-MM`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct BillingPeriod {
    year: i32,
    month: u32,
}

impl BillingPeriod {
    pub fn new(year: i32, month: u32) -> Result<Self, AppError> {
        if !(1..=12).contains(&month) {
            return Err(AppError::InvalidInput(format!(
                "month out of range: {}",
                month
            )));
        }
        Ok(Self { year, month })
    }

    /// Period containing `at`
    pub fn containing(at: DateTime<Utc>) -> Self {
        Self {
            year: at.year(),
            month: at.month(),
        }
    }

    pub fn current() -> Self {
        Self::containing(Utc::now())
    }

    /// Parse `YYYY-MM`
    pub fn parse(s: &str) -> Result<Self, AppError> {
        let invalid = || AppError::InvalidInput(format!("expected YYYY-MM, got '{}'", s));

        let (year, month) = s.trim().split_once('-').ok_or_else(invalid)?;
        if year.len() != 4 || month.len() != 2 {
            return Err(invalid());
        }
        let year: i32 = year.parse().map_err(|_| invalid())?;
        let month: u32 = month.parse().map_err(|_| invalid())?;
        Self::new(year, month)
    }

    pub fn next(&self) -> Self {
        if self.month == 12 {
            Self {
                year: self.year + 1,
                month: 1,
            }
        } else {
            Self {
                year: self.year,
                month: self.month + 1,
            }
        }
    }

    /// First instant of the period
    pub fn start(&self) -> DateTime<Utc> {
        // Month is validated on construction, so the instant always exists
        Utc.with_ymd_and_hms(self.year, self.month, 1, 0, 0, 0)
            .single()
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    /// First instant after the period (exclusive end)
    pub fn end(&self) -> DateTime<Utc> {
        self.next().start()
    }
}

impl fmt::Display for BillingPeriod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:02}", self.year, self.month)
    }
}

impl TryFrom<String> for BillingPeriod {
    type Error = AppError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<BillingPeriod> for String {
    fn from(period: BillingPeriod) -> Self {
        period.to_string()
    }
}

/// Resource status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ResourceStatus {
    #[default]
    Available,
    Assigned,
    Suspended,
}

impl fmt::Display for ResourceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceStatus::Available => write!(f, "available"),
            ResourceStatus::Assigned => write!(f, "assigned"),
            ResourceStatus::Suspended => write!(f, "suspended"),
        }
    }
}

impl ResourceStatus {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "available" => Some(ResourceStatus::Available),
            "assigned" => Some(ResourceStatus::Assigned),
            "suspended" => Some(ResourceStatus::Suspended),
            _ => None,
        }
    }
}

/// Outcome recorded for one period
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryStatus {
    Charged,
    ChargedOverdue,
    Suspended,
}

impl fmt::Display for HistoryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HistoryStatus::Charged => write!(f, "charged"),
            HistoryStatus::ChargedOverdue => write!(f, "charged_overdue"),
            HistoryStatus::Suspended => write!(f, "suspended"),
        }
    }
}

/// One `billing_history` entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub period: BillingPeriod,
    pub amount: Decimal,
    pub status: HistoryStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

/// Append-only per-period log
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BillingHistory(Vec<HistoryEntry>);

impl BillingHistory {
    pub fn entries(&self) -> &[HistoryEntry] {
        &self.0
    }

    pub fn append(&mut self, entry: HistoryEntry) {
        self.0.push(entry);
    }

    /// Whether the period already has an entry
    pub fn covers(&self, period: BillingPeriod) -> bool {
        self.0.iter().any(|e| e.period == period)
    }

    pub fn last(&self) -> Option<&HistoryEntry> {
        self.0.last()
    }
}

/// Billable resource entity
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BillableResource {
    /// Unique identifier
    pub id: i64,

    /// The provisioned number
    pub number: String,

    /// Owner account; `None` while available
    pub owner_account_id: Option<i32>,

    /// Recurring charge per period
    pub monthly_cost: Decimal,

    pub status: ResourceStatus,

    /// When the resource was assigned to its owner
    pub assigned_at: Option<DateTime<Utc>>,

    /// Paid-through date
    pub expires_at: Option<DateTime<Utc>>,

    pub suspended_at: Option<DateTime<Utc>>,

    pub suspension_reason: Option<String>,

    pub billing_history: BillingHistory,

    pub created_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,
}

impl BillableResource {
    /// Assigned before the period ends and not yet billed for it
    pub fn is_due(&self, period: BillingPeriod) -> bool {
        self.status == ResourceStatus::Assigned
            && self.owner_account_id.is_some()
            && self.assigned_at.is_some_and(|at| at < period.end())
            && !self.billing_history.covers(period)
    }

    /// Ledger idempotency key for this resource's charge in `period`
    pub fn charge_key(&self, period: BillingPeriod) -> String {
        format!("did:{}:{}", self.id, period)
    }
}

impl Default for BillableResource {
    fn default() -> Self {
        let now = Utc::now();
        Self {
            id: 0,
            number: String::new(),
            owner_account_id: None,
            monthly_cost: Decimal::ZERO,
            status: ResourceStatus::Available,
            assigned_at: None,
            expires_at: None,
            suspended_at: None,
            suspension_reason: None,
            billing_history: BillingHistory::default(),
            created_at: now,
            updated_at: now,
        }
    }
}

/// What the recurring sweep does with one resource
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecurringDecision {
    /// Enough balance: debit and record `charged`
    Charge,
    /// Not enough balance, suspension disabled: debit anyway, record
    /// `charged_overdue`
    ChargeOverdue,
    /// Not enough balance, suspension enabled: no debit
    Suspend,
}

impl RecurringDecision {
    pub fn decide(monthly_cost: Decimal, owner_balance: Decimal, suspend_insufficient: bool) -> Self {
        if owner_balance >= monthly_cost {
            RecurringDecision::Charge
        } else if suspend_insufficient {
            RecurringDecision::Suspend
        } else {
            RecurringDecision::ChargeOverdue
        }
    }

    pub fn history_status(&self) -> HistoryStatus {
        match self {
            RecurringDecision::Charge => HistoryStatus::Charged,
            RecurringDecision::ChargeOverdue => HistoryStatus::ChargedOverdue,
            RecurringDecision::Suspend => HistoryStatus::Suspended,
        }
    }
}

//! Domain models for Ledgerline
//!
//! This module contains all the core domain models used throughout the application.

pub mod account;
pub mod call_record;
pub mod cdr;
pub mod ledger;
pub mod lock;
pub mod notification;
pub mod rate;
pub mod resource;

pub use account::{Account, AccountType};
pub use call_record::{
    next_status, BillingAttempt, BillingDetails, BillingEvent, BillingStatus, CallRecord,
    CallStatus,
};
pub use cdr::{ActiveCall, CdrCursor, Disposition, RawCdr};
pub use ledger::{
    verify_chain, BalanceTransaction, ChargeRequest, ChargeResult, Direction, LedgerDiscrepancy,
    ReferenceType,
};
pub use lock::LockHolder;
pub use notification::{NotificationEvent, Severity};
pub use rate::{billable_seconds, cost_for_seconds, RateCard, COST_SCALE};
pub use resource::{
    BillableResource, BillingHistory, BillingPeriod, HistoryEntry, HistoryStatus,
    RecurringDecision, ResourceStatus,
};

//! Billing jobs for Ledgerline
//!
//! Every job is a short-lived, lockable entry point meant to be driven by
//! an external scheduler:
//!
//! - [`CdrProcessor`]: ingest final CDRs and drive call records through
//!   the billing state machine (new, backlog and retry phases)
//! - [`CallMonitor`]: meter connected calls, charge increments, flag and
//!   terminate over-budget or over-long calls
//! - [`RecurringBilling`]: the monthly DID sweep
//! - [`LedgerAuditor`]: recompute balances from the transaction log
//!
//! Jobs receive their stores and collaborators through a
//! [`BillingContext`] of trait objects; [`memory`] has in-process
//! implementations of all of them.

pub mod call_monitor;
pub mod cdr_processor;
pub mod context;
pub mod did_billing;
pub mod job;
pub mod ledger_audit;
pub mod memory;
pub mod notify;
pub mod rating;

pub use call_monitor::{CallMonitor, MonitorOptions, MonitorSummary};
pub use cdr_processor::{CdrOptions, CdrProcessor, CdrSummary, PhaseStats};
pub use context::BillingContext;
pub use did_billing::{RecurringBilling, RecurringOptions, RecurringSummary};
pub use job::{with_lock, ExecutionBudget};
pub use ledger_audit::{AuditSummary, LedgerAuditor};
pub use notify::{FanoutNotifier, TracingNotifier};
pub use rating::RatingServiceImpl;

/// Lock names, one per job family
pub mod jobs {
    pub const PROCESS_CDRS: &str = "process-cdrs";
    pub const MONITOR_CALLS: &str = "monitor-calls";
    pub const BILL_DIDS: &str = "bill-dids";
    pub const AUDIT_LEDGER: &str = "audit-ledger";
}

/// Watermark keys in the settings store
pub mod watermarks {
    pub const LAST_CDR_PROCESSING_AT: &str = "last_cdr_processing_at";
    pub const LAST_CDR_PROCESSING_STATS: &str = "last_cdr_processing_stats";
    /// `(end_time, call_id)` of the newest CDR ingested without error
    pub const LAST_CDR_CURSOR: &str = "last_cdr_cursor";
    pub const LAST_CALL_MONITOR_AT: &str = "last_call_monitor_at";
    pub const LAST_CALL_MONITOR_STATS: &str = "last_call_monitor_stats";
    pub const RECURRING_LAST_PERIOD: &str = "recurring_billing:last_period";
    pub const LAST_RECURRING_BILLING_STATS: &str = "last_recurring_billing_stats";
    pub const LAST_LEDGER_AUDIT_AT: &str = "last_ledger_audit_at";
}

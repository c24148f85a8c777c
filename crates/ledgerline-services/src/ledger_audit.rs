//! Ledger consistency audit
//!
//! Replays each account's transaction log and compares the result with the
//! cached balance. Anything that does not add up is raised as a critical
//! alert and left exactly as found.

use chrono::{DateTime, Utc};
use ledgerline_core::{
    models::{verify_chain, Account, LedgerDiscrepancy, NotificationEvent},
    AppResult,
};
use serde::Serialize;
use std::time::Duration;
use tracing::{error, info, instrument};

use crate::context::BillingContext;
use crate::job::with_lock;
use crate::notify::emit;
use crate::{jobs, watermarks};

/// One account whose ledger does not add up
#[derive(Debug, Clone, Serialize)]
pub struct AccountFinding {
    pub account_id: i32,
    pub account_number: String,
    pub discrepancies: Vec<LedgerDiscrepancy>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct AuditSummary {
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub accounts: usize,
    pub transactions: usize,
    pub findings: Vec<AccountFinding>,
}

impl AuditSummary {
    pub fn is_consistent(&self) -> bool {
        self.findings.is_empty()
    }
}

pub struct LedgerAuditor {
    ctx: BillingContext,
    lock_ttl: Duration,
    force: bool,
}

impl LedgerAuditor {
    pub fn new(ctx: BillingContext, lock_ttl: Duration, force: bool) -> Self {
        Self { ctx, lock_ttl, force }
    }

    pub async fn run(&self) -> AppResult<AuditSummary> {
        with_lock(
            self.ctx.locks.as_ref(),
            jobs::AUDIT_LEDGER,
            self.lock_ttl,
            self.force,
            || self.audit(),
        )
        .await
    }

    #[instrument(skip(self))]
    async fn audit(&self) -> AppResult<AuditSummary> {
        let mut summary = AuditSummary {
            started_at: Some(Utc::now()),
            ..Default::default()
        };

        for account in self.ctx.accounts.list_all().await? {
            summary.accounts += 1;
            let transactions = self.ctx.ledger.transactions(account.id).await?;
            summary.transactions += transactions.len();

            let discrepancies = verify_chain(&transactions, account.balance);
            if !discrepancies.is_empty() {
                self.alert(&account, &discrepancies).await;
                summary.findings.push(AccountFinding {
                    account_id: account.id,
                    account_number: account.account_number,
                    discrepancies,
                });
            }
        }

        summary.finished_at = Some(Utc::now());
        info!(
            accounts = summary.accounts,
            transactions = summary.transactions,
            inconsistent = summary.findings.len(),
            "Ledger audit finished"
        );

        if let Err(e) = self
            .ctx
            .settings
            .put(watermarks::LAST_LEDGER_AUDIT_AT, serde_json::json!(summary.finished_at))
            .await
        {
            error!("Failed to store audit watermark: {}", e);
        }

        Ok(summary)
    }

    async fn alert(&self, account: &Account, discrepancies: &[LedgerDiscrepancy]) {
        for d in discrepancies {
            error!(account_id = account.id, "Ledger inconsistency: {}", d);
        }
        emit(
            self.ctx.notifier.as_ref(),
            NotificationEvent::critical(
                "ledger.inconsistency",
                format!(
                    "Ledger of account {} does not add up ({} problems)",
                    account.account_number,
                    discrepancies.len()
                ),
            )
            .with_metadata(serde_json::json!({
                "account_id": account.id,
                "cached_balance": account.balance.to_string(),
                "discrepancies": discrepancies.iter().map(|d| d.to_string()).collect::<Vec<_>>(),
            })),
        )
        .await;
    }
}

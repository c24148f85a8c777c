//! Monthly recurring charges for assigned DIDs
//!
//! Resources are walked in id order, `batch_size` at a time. Each chunk is
//! billed in one atomic unit by the resource store; a failing chunk is
//! rolled back and counted, and the sweep moves on to the next one.
//!
//! The period watermark only advances when every chunk went through, so a
//! partial sweep is completed by simply running it again.

use chrono::{DateTime, Utc};
use ledgerline_core::{
    config::RecurringConfig,
    models::{BillableResource, BillingPeriod, NotificationEvent, RecurringDecision},
    traits::ResourceOutcome,
    AppResult,
};
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn};

use crate::context::BillingContext;
use crate::job::{with_lock, ExecutionBudget};
use crate::notify::emit;
use crate::{jobs, watermarks};

#[derive(Debug, Clone)]
pub struct RecurringOptions {
    pub period: BillingPeriod,
    pub batch_size: usize,
    pub suspend_insufficient: bool,
    pub lock_ttl: Duration,
    pub timeout: Duration,
    pub dry_run: bool,
    /// Re-run a period the watermark already covers
    pub force_period: bool,
    /// Take the job lock over from a live holder
    pub force_lock: bool,
}

impl From<&RecurringConfig> for RecurringOptions {
    fn from(config: &RecurringConfig) -> Self {
        Self {
            period: BillingPeriod::current(),
            batch_size: config.batch_size.max(1),
            suspend_insufficient: config.suspend_insufficient,
            lock_ttl: Duration::from_secs(config.lock_ttl_secs),
            timeout: config.timeout(),
            dry_run: false,
            force_period: false,
            force_lock: false,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RecurringSummary {
    pub period: Option<BillingPeriod>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub dry_run: bool,
    /// The watermark already covered the period
    pub already_processed: bool,
    pub budget_exhausted: bool,
    pub chunks: usize,
    pub failed_chunks: usize,
    pub charged: usize,
    pub charged_overdue: usize,
    pub suspended: usize,
    /// Resources in chunks that were rolled back
    pub failed: usize,
    pub total_amount: Decimal,
}

impl RecurringSummary {
    pub fn processed(&self) -> usize {
        self.charged + self.charged_overdue + self.suspended
    }

    pub fn is_success(&self) -> bool {
        self.failed_chunks == 0
    }

    fn record(&mut self, decision: RecurringDecision, amount: Decimal) {
        match decision {
            RecurringDecision::Charge => self.charged += 1,
            RecurringDecision::ChargeOverdue => self.charged_overdue += 1,
            RecurringDecision::Suspend => self.suspended += 1,
        }
        if decision != RecurringDecision::Suspend {
            self.total_amount += amount;
        }
    }
}

pub struct RecurringBilling {
    ctx: BillingContext,
    options: RecurringOptions,
}

impl RecurringBilling {
    pub fn new(ctx: BillingContext, options: RecurringOptions) -> Self {
        Self { ctx, options }
    }

    pub async fn run(&self) -> AppResult<RecurringSummary> {
        with_lock(
            self.ctx.locks.as_ref(),
            jobs::BILL_DIDS,
            self.options.lock_ttl,
            self.options.force_lock,
            || self.sweep(),
        )
        .await
    }

    /// Last period a sweep fully completed
    pub async fn last_period(&self) -> AppResult<Option<BillingPeriod>> {
        let Some(setting) = self.ctx.settings.get(watermarks::RECURRING_LAST_PERIOD).await? else {
            return Ok(None);
        };
        match setting.value.as_str().map(BillingPeriod::parse) {
            Some(Ok(period)) => Ok(Some(period)),
            _ => {
                warn!("Ignoring unreadable period watermark: {}", setting.value);
                Ok(None)
            }
        }
    }

    #[instrument(skip(self), fields(period = %self.options.period, dry_run = self.options.dry_run))]
    async fn sweep(&self) -> AppResult<RecurringSummary> {
        let period = self.options.period;
        let budget = ExecutionBudget::start(self.options.timeout);
        let mut summary = RecurringSummary {
            period: Some(period),
            started_at: Some(Utc::now()),
            dry_run: self.options.dry_run,
            ..Default::default()
        };

        let last = self.last_period().await?;
        if !self.options.force_period && last.is_some_and(|done| done >= period) {
            info!("Period {} already processed; nothing to do", period);
            summary.already_processed = true;
            summary.finished_at = Some(Utc::now());
            return Ok(summary);
        }

        let mut after_id = 0;
        // Simulated owner balances, carried across chunks
        let mut preview_balances = HashMap::new();
        loop {
            if budget.exhausted() {
                warn!("Execution budget exhausted after {} chunks", summary.chunks);
                summary.budget_exhausted = true;
                break;
            }

            let due = self
                .ctx
                .resources
                .find_due(period, after_id, self.options.batch_size)
                .await?;
            let Some(last_in_chunk) = due.last() else {
                break;
            };
            after_id = last_in_chunk.id;
            summary.chunks += 1;

            if self.options.dry_run {
                self.preview(&due, &mut summary, &mut preview_balances).await?;
            } else {
                self.bill(&due, &mut summary).await;
            }

            if due.len() < self.options.batch_size {
                break;
            }
        }

        summary.finished_at = Some(Utc::now());
        info!(
            period = %period,
            charged = summary.charged,
            overdue = summary.charged_overdue,
            suspended = summary.suspended,
            failed_chunks = summary.failed_chunks,
            total = %summary.total_amount,
            "Recurring sweep finished"
        );

        if !self.options.dry_run {
            self.persist(&summary, last).await;
        }
        self.report(&summary).await;

        Ok(summary)
    }

    async fn bill(&self, due: &[BillableResource], summary: &mut RecurringSummary) {
        let ids: Vec<i64> = due.iter().map(|r| r.id).collect();
        let period = self.options.period;

        let outcomes = match self
            .ctx
            .resources
            .bill_chunk(period, &ids, self.options.suspend_insufficient)
            .await
        {
            Ok(outcomes) => outcomes,
            Err(e) => {
                error!(
                    first = ids.first().copied().unwrap_or_default(),
                    last = ids.last().copied().unwrap_or_default(),
                    "Chunk rolled back: {}",
                    e
                );
                summary.failed_chunks += 1;
                summary.failed += ids.len();
                emit(
                    self.ctx.notifier.as_ref(),
                    NotificationEvent::warning(
                        "recurring.chunk_failed",
                        format!("Recurring billing chunk failed for {}", period),
                    )
                    .with_metadata(serde_json::json!({
                        "period": period,
                        "resource_ids": ids,
                        "error": e.to_string(),
                    })),
                )
                .await;
                return;
            }
        };

        for outcome in outcomes {
            summary.record(outcome.decision, outcome.amount);
            debug!(
                "{} {} for {}: {:?}",
                outcome.number, outcome.amount, period, outcome.decision
            );
            self.notify_owner(&outcome).await;
        }
    }

    async fn notify_owner(&self, outcome: &ResourceOutcome) {
        let period = self.options.period;
        let event = match outcome.decision {
            RecurringDecision::Charge => return,
            RecurringDecision::Suspend => NotificationEvent::warning(
                "recurring.suspended",
                format!("DID {} suspended for insufficient balance", outcome.number),
            ),
            RecurringDecision::ChargeOverdue => NotificationEvent::warning(
                "recurring.overdue",
                format!("DID {} charged into overdue balance", outcome.number),
            ),
        };
        emit(
            self.ctx.notifier.as_ref(),
            event.with_metadata(serde_json::json!({
                "resource_id": outcome.resource_id,
                "number": outcome.number,
                "account_id": outcome.owner_account_id,
                "period": period,
                "required": outcome.amount.to_string(),
                "balance": outcome.balance_before.to_string(),
            })),
        )
        .await;
    }

    /// Decide without writing
    ///
    /// Each owner starts from their current balance and is debited by the
    /// charges previewed before, as the real sweep would.
    async fn preview(
        &self,
        due: &[BillableResource],
        summary: &mut RecurringSummary,
        balances: &mut HashMap<i32, Decimal>,
    ) -> AppResult<()> {
        for resource in due {
            let Some(owner) = resource.owner_account_id else {
                continue;
            };
            let balance = match balances.get(&owner) {
                Some(balance) => *balance,
                None => match self.ctx.accounts.find_by_id(owner).await? {
                    Some(account) => account.balance,
                    None => {
                        warn!("[dry-run] owner {} of {} not found", owner, resource.number);
                        continue;
                    }
                },
            };
            let decision = RecurringDecision::decide(
                resource.monthly_cost,
                balance,
                self.options.suspend_insufficient,
            );
            info!(
                "[dry-run] {} (account {}): {:?}, cost {}, balance {}",
                resource.number, owner, decision, resource.monthly_cost, balance
            );
            let after = if decision == RecurringDecision::Suspend {
                balance
            } else {
                balance - resource.monthly_cost
            };
            balances.insert(owner, after);
            summary.record(decision, resource.monthly_cost);
        }
        Ok(())
    }

    async fn persist(&self, summary: &RecurringSummary, last: Option<BillingPeriod>) {
        let period = self.options.period;
        if summary.is_success() && !summary.budget_exhausted {
            let mark = last.map_or(period, |done| done.max(period));
            if let Err(e) = self
                .ctx
                .settings
                .put(watermarks::RECURRING_LAST_PERIOD, serde_json::json!(mark))
                .await
            {
                error!("Failed to store period watermark: {}", e);
            }
        } else {
            warn!("Sweep for {} incomplete; watermark not advanced", period);
        }

        if let Err(e) = self
            .ctx
            .settings
            .put(
                watermarks::LAST_RECURRING_BILLING_STATS,
                serde_json::to_value(summary).unwrap_or_default(),
            )
            .await
        {
            error!("Failed to store recurring billing stats: {}", e);
        }
    }

    async fn report(&self, summary: &RecurringSummary) {
        let period = self.options.period;
        let metadata = serde_json::to_value(summary).unwrap_or_default();
        emit(
            self.ctx.notifier.as_ref(),
            NotificationEvent::info(
                "recurring.summary",
                format!(
                    "Recurring billing {}: {} charged, {} overdue, {} suspended",
                    period, summary.charged, summary.charged_overdue, summary.suspended
                ),
            )
            .with_metadata(metadata.clone()),
        )
        .await;

        if !summary.is_success() {
            emit(
                self.ctx.notifier.as_ref(),
                NotificationEvent::warning(
                    "recurring.failures",
                    format!(
                        "Recurring billing {}: {} chunks failed ({} resources)",
                        period, summary.failed_chunks, summary.failed
                    ),
                )
                .with_metadata(metadata),
            )
            .await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_summary_totals_skip_suspensions() {
        let mut summary = RecurringSummary::default();
        summary.record(RecurringDecision::Charge, dec!(5.00));
        summary.record(RecurringDecision::ChargeOverdue, dec!(2.50));
        summary.record(RecurringDecision::Suspend, dec!(5.00));

        assert_eq!(summary.processed(), 3);
        assert_eq!(summary.total_amount, dec!(7.50));
        assert!(summary.is_success());
    }

    #[test]
    fn test_options_default_to_current_period() {
        let options = RecurringOptions::from(&RecurringConfig::default());
        assert_eq!(options.period, BillingPeriod::current());
        assert!(options.suspend_insufficient);
        assert!(!options.force_period);
        assert!(!options.force_lock);
    }
}

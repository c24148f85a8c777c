//! Real-time metering and termination
//!
//! Each pass, under the `monitor-calls` lock:
//!
//! 1. asks the switch for connected calls and starts tracking new ones
//!    (account and rate resolved at first sight)
//! 2. for every tracked call still connected, charges the increment-rounded
//!    cost accrued since the last charge point
//! 3. flags calls whose accrued cost exceeds the funds the payer had for
//!    them, and hangs up at-risk calls of auto-terminating accounts and
//!    calls over the duration ceiling
//!
//! Tracked calls the switch no longer reports are left to the CDR
//! pipeline, which settles them from their final CDR. One that stays gone
//! past the CDR grace period is closed at its last sighting so the
//! pipeline's backlog phase settles it anyway.

use chrono::{DateTime, Utc};
use ledgerline_core::{
    config::MonitorConfig,
    models::{
        billable_seconds, cost_for_seconds, Account, ActiveCall, BillingEvent, CallRecord,
        CallStatus, ChargeRequest, NotificationEvent, ReferenceType,
    },
    AppError, AppResult,
};
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::HashSet;
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn};

use crate::context::BillingContext;
use crate::job::{with_lock, ExecutionBudget};
use crate::notify::emit;
use crate::{jobs, watermarks};

#[derive(Debug, Clone)]
pub struct MonitorOptions {
    /// Actually hang calls up; otherwise they are only reported
    pub terminate: bool,
    pub max_duration_secs: i64,
    /// Never auto-terminate postpaid accounts for balance
    pub exempt_postpaid: bool,
    /// Time a call may be gone from the switch before it is closed
    /// without its CDR
    pub cdr_grace: chrono::Duration,
    pub lock_ttl: Duration,
    pub timeout: Duration,
    pub dry_run: bool,
    pub force: bool,
}

impl From<&MonitorConfig> for MonitorOptions {
    fn from(config: &MonitorConfig) -> Self {
        Self {
            terminate: config.terminate,
            max_duration_secs: config.max_duration_secs,
            exempt_postpaid: config.exempt_postpaid,
            cdr_grace: chrono::Duration::seconds(config.cdr_grace_secs),
            lock_ttl: Duration::from_secs(config.lock_ttl_secs),
            timeout: config.timeout(),
            dry_run: false,
            force: false,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct MonitorSummary {
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub dry_run: bool,
    /// Calls the switch reported connected
    pub active_calls: usize,
    /// Newly tracked this pass
    pub discovered: usize,
    /// Tracked calls metered this pass
    pub monitored: usize,
    pub increments: usize,
    pub charged: Decimal,
    pub shortfall: Decimal,
    pub at_risk: usize,
    pub over_duration: usize,
    pub terminated: usize,
    pub termination_failures: usize,
    /// Calls gone past the grace period and closed at their last sighting
    pub closed_without_cdr: usize,
    /// Calls without a resolvable account or rate
    pub skipped: usize,
    pub errors: usize,
}

/// Why a call is being hung up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationReason {
    InsufficientBalance,
    MaxDuration,
}

impl TerminationReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            TerminationReason::InsufficientBalance => "insufficient_balance",
            TerminationReason::MaxDuration => "max_duration",
        }
    }
}

/// Pricing applied to one call
#[derive(Debug, Clone, Copy)]
struct Tariff {
    rate_per_minute: Decimal,
    increment: i32,
    connection_fee: Decimal,
}

impl Tariff {
    /// Increment-rounded cost of `elapsed` seconds, connection fee included
    fn accrued(&self, elapsed: i64) -> Decimal {
        if elapsed <= 0 {
            return Decimal::ZERO;
        }
        cost_for_seconds(elapsed, self.increment, self.rate_per_minute) + self.connection_fee
    }
}

/// Strictly greater: a call costing exactly the funds it had is not at risk
pub fn is_at_risk(accrued: Decimal, funds: Decimal) -> bool {
    accrued > funds
}

pub struct CallMonitor {
    ctx: BillingContext,
    options: MonitorOptions,
}

impl CallMonitor {
    pub fn new(ctx: BillingContext, options: MonitorOptions) -> Self {
        Self { ctx, options }
    }

    pub async fn run(&self) -> AppResult<MonitorSummary> {
        with_lock(
            self.ctx.locks.as_ref(),
            jobs::MONITOR_CALLS,
            self.options.lock_ttl,
            self.options.force,
            || self.pass(),
        )
        .await
    }

    #[instrument(skip(self), fields(dry_run = self.options.dry_run, terminate = self.options.terminate))]
    async fn pass(&self) -> AppResult<MonitorSummary> {
        let budget = ExecutionBudget::start(self.options.timeout);
        let mut summary = MonitorSummary {
            started_at: Some(Utc::now()),
            dry_run: self.options.dry_run,
            ..Default::default()
        };

        let active = self.ctx.telephony.active_calls().await?;
        summary.active_calls = active.len();
        let live: HashSet<&str> = active.iter().map(|c| c.call_id.as_str()).collect();

        let mut previews = Vec::new();
        for call in &active {
            match self.discover(call).await {
                Ok(Some(record)) => {
                    summary.discovered += 1;
                    if self.options.dry_run {
                        previews.push(record);
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(call_id = %call.call_id, "Failed to start tracking call: {}", e);
                    summary.errors += 1;
                }
            }
        }

        let now = Utc::now();
        let mut tracked = Vec::new();
        for record in self.ctx.calls.find_connected().await? {
            if live.contains(record.call_id.as_str()) {
                tracked.push(record);
            } else if now - record.last_seen() >= self.options.cdr_grace {
                let call_id = record.call_id.clone();
                match self.close_unseen(record).await {
                    Ok(()) => summary.closed_without_cdr += 1,
                    Err(e) => {
                        error!(call_id = %call_id, "Failed to close call without CDR: {}", e);
                        summary.errors += 1;
                    }
                }
            } else {
                debug!("Call {} no longer connected; left for its CDR", record.call_id);
            }
        }

        if !self.options.dry_run && !tracked.is_empty() {
            let seen: Vec<String> = tracked.iter().map(|r| r.call_id.clone()).collect();
            if let Err(e) = self.ctx.calls.mark_seen(&seen, now).await {
                warn!("Failed to record sighting of {} calls: {}", seen.len(), e);
            }
        }
        tracked.extend(previews);

        for record in tracked {
            if budget.exhausted() {
                warn!("Execution budget exhausted; remaining calls wait for the next pass");
                break;
            }
            let call_id = record.call_id.clone();
            match self.meter(record, now, &mut summary).await {
                Ok(()) => summary.monitored += 1,
                Err(e) => {
                    error!(call_id = %call_id, "Failed to meter call: {}", e);
                    summary.errors += 1;
                }
            }
        }

        summary.finished_at = Some(Utc::now());
        info!(
            active = summary.active_calls,
            monitored = summary.monitored,
            at_risk = summary.at_risk,
            terminated = summary.terminated,
            charged = %summary.charged,
            "Call monitor pass finished"
        );

        if !self.options.dry_run {
            self.persist(&summary).await;
        }
        emit(
            self.ctx.notifier.as_ref(),
            NotificationEvent::info(
                "monitor.summary",
                format!(
                    "Call monitor: {} active, {} at risk, {} terminated",
                    summary.active_calls, summary.at_risk, summary.terminated
                ),
            )
            .with_metadata(serde_json::to_value(&summary).unwrap_or_default()),
        )
        .await;

        Ok(summary)
    }

    /// Start tracking a call seen for the first time
    ///
    /// Returns the new record, or `None` when it was already tracked.
    async fn discover(&self, call: &ActiveCall) -> AppResult<Option<CallRecord>> {
        if self.ctx.calls.find_by_call_id(&call.call_id).await?.is_some() {
            return Ok(None);
        }

        let mut record = CallRecord::from_active_call(call);
        if let Some(account) = self.ctx.accounts.find_by_phone(&call.source).await? {
            record.account_id = Some(account.id);
        }
        if let Some(rate) = self.ctx.rating.find_rate(&call.destination).await? {
            record.rate_per_minute = Some(rate.rate_per_minute);
            record.billing_increment = Some(rate.billing_increment);
            record.connection_fee = rate.connection_fee;
        }

        if self.options.dry_run {
            info!("[dry-run] would start tracking call {}", call.call_id);
            return Ok(Some(record));
        }

        let stored = self.ctx.calls.insert(&record).await?;
        if stored.is_some() {
            debug!("Tracking call {} from {}", call.call_id, call.source);
        }
        Ok(stored)
    }

    /// Close a call whose CDR never came, at its last sighting
    ///
    /// The record becomes an ended, pending record that the CDR backlog
    /// phase settles against what the monitor already collected.
    async fn close_unseen(&self, mut record: CallRecord) -> AppResult<()> {
        let last_seen = record.last_seen();
        if self.options.dry_run {
            info!("[dry-run] would close call {} at {}", record.call_id, last_seen);
            return Ok(());
        }

        record.close_unseen();
        self.ctx.calls.save(&record).await?;
        warn!(
            call_id = %record.call_id,
            billsec = record.billsec,
            "Call gone since {} without a CDR; closed at last sighting",
            last_seen
        );
        emit(
            self.ctx.notifier.as_ref(),
            NotificationEvent::warning(
                "monitor.missing_cdr",
                format!("No CDR for call {}; billed to its last sighting", record.call_id),
            )
            .with_metadata(serde_json::json!({
                "call_id": record.call_id,
                "last_seen_at": last_seen,
                "billsec": record.billsec,
            })),
        )
        .await;
        Ok(())
    }

    async fn account_for(&self, record: &CallRecord) -> AppResult<Option<Account>> {
        match record.account_id {
            Some(id) => self.ctx.accounts.find_by_id(id).await,
            None => self.ctx.accounts.find_by_phone(&record.source).await,
        }
    }

    async fn tariff_for(&self, record: &CallRecord) -> AppResult<Option<Tariff>> {
        if let Some(rate_per_minute) = record.rate_per_minute {
            return Ok(Some(Tariff {
                rate_per_minute,
                increment: record.billing_increment.unwrap_or(60),
                connection_fee: record.connection_fee,
            }));
        }
        Ok(self
            .ctx
            .rating
            .find_rate(&record.destination)
            .await?
            .map(|rate| Tariff {
                rate_per_minute: rate.rate_per_minute,
                increment: rate.billing_increment,
                connection_fee: rate.connection_fee,
            }))
    }

    async fn meter(
        &self,
        record: CallRecord,
        now: DateTime<Utc>,
        summary: &mut MonitorSummary,
    ) -> AppResult<()> {
        let Some(mut account) = self.account_for(&record).await? else {
            warn!("No account for call {} from {}", record.call_id, record.source);
            summary.skipped += 1;
            return Ok(());
        };
        let Some(tariff) = self.tariff_for(&record).await? else {
            warn!("No rate for call {} to {}", record.call_id, record.destination);
            summary.skipped += 1;
            return Ok(());
        };

        let elapsed = record.elapsed_seconds(now);
        let billed = billable_seconds(elapsed, tariff.increment);
        let accrued = tariff.accrued(elapsed);
        let mut charged = record.charged_amount;

        // Progressive billing up to the current increment boundary
        if billed > record.charged_seconds {
            let owed = accrued - record.charged_amount - record.billing_details.shortfall;
            if owed > Decimal::ZERO {
                let mut collect = account.collectable(owed);
                let mut shortfall = owed - collect;

                if self.options.dry_run {
                    info!("[dry-run] would charge {} on call {} ({}s)", collect, record.call_id, billed);
                    account.balance -= collect;
                } else {
                    if collect > Decimal::ZERO {
                        let result = self
                            .ctx
                            .ledger
                            .charge_account(&ChargeRequest::debit(
                                account.id,
                                collect,
                                format!("Call {} in progress ({}s)", record.call_id, billed),
                                ReferenceType::CallIncrement,
                                &record.call_id,
                                record.increment_key(record.charged_seconds),
                            ))
                            .await?;
                        if result.duplicate {
                            // Booked by a pass that failed to record it; the
                            // rest is collected at the next boundary
                            warn!(
                                call_id = %record.call_id,
                                transaction_id = result.transaction_id,
                                "Recording increment booked by an earlier pass"
                            );
                            collect = result.amount();
                            shortfall = Decimal::ZERO;
                        } else {
                            account.balance = result.balance_after;
                        }
                    }
                    self.ctx
                        .calls
                        .add_charge(&record.call_id, collect, billed, shortfall)
                        .await?;
                }

                summary.increments += 1;
                summary.charged += collect;
                charged += collect;

                if shortfall > Decimal::ZERO {
                    summary.shortfall += shortfall;
                    self.alert_shortfall(&record, &account, shortfall).await;
                }
            }
        }

        let funds = account.available_balance() + charged;
        let at_risk = is_at_risk(accrued, funds);
        let over_duration = elapsed > self.options.max_duration_secs;

        if at_risk {
            summary.at_risk += 1;
            warn!(
                call_id = %record.call_id,
                accrued = %accrued,
                funds = %funds,
                "Call is at risk"
            );
            emit(
                self.ctx.notifier.as_ref(),
                NotificationEvent::warning(
                    "monitor.at_risk",
                    format!("Call {} has outrun the balance of {}", record.call_id, account.account_number),
                )
                .with_metadata(serde_json::json!({
                    "call_id": record.call_id,
                    "account_id": account.id,
                    "accrued": accrued.to_string(),
                    "balance": account.balance.to_string(),
                })),
            )
            .await;
        }
        if over_duration {
            summary.over_duration += 1;
        }

        let reason = if over_duration {
            Some(TerminationReason::MaxDuration)
        } else if at_risk && account.may_auto_terminate(self.options.exempt_postpaid) {
            Some(TerminationReason::InsufficientBalance)
        } else {
            None
        };
        let Some(reason) = reason else {
            return Ok(());
        };

        if !self.options.terminate {
            info!("Call {} qualifies for termination ({}); termination disabled", record.call_id, reason.as_str());
            return Ok(());
        }
        if self.options.dry_run {
            info!("[dry-run] would terminate call {} ({})", record.call_id, reason.as_str());
            return Ok(());
        }

        self.terminate(&record.call_id, account, tariff, reason, summary).await
    }

    /// Hang up, then settle the call for its actual elapsed time
    ///
    /// A hang-up the switch does not confirm is counted on the record and
    /// tried again next pass.
    async fn terminate(
        &self,
        call_id: &str,
        mut account: Account,
        tariff: Tariff,
        reason: TerminationReason,
        summary: &mut MonitorSummary,
    ) -> AppResult<()> {
        let refused = match self.ctx.telephony.terminate_call(call_id).await {
            Ok(true) => None,
            Ok(false) => Some("switch did not confirm".to_string()),
            Err(e) => Some(e.to_string()),
        };

        // Reloaded so the increments recorded this pass are not overwritten
        let mut record = self
            .ctx
            .calls
            .find_by_call_id(call_id)
            .await?
            .ok_or_else(|| AppError::CallRecordNotFound(call_id.to_string()))?;

        if let Some(why) = refused {
            summary.termination_failures += 1;
            record.billing_details.termination_attempts += 1;
            self.ctx.calls.save(&record).await?;
            warn!("Failed to terminate call {}: {}", call_id, why);
            emit(
                self.ctx.notifier.as_ref(),
                NotificationEvent::warning(
                    "monitor.termination_failed",
                    format!("Could not terminate call {}", call_id),
                )
                .with_metadata(serde_json::json!({
                    "call_id": call_id,
                    "attempts": record.billing_details.termination_attempts,
                    "error": why,
                })),
            )
            .await;
            return Ok(());
        }

        let now = Utc::now();
        let elapsed = record.elapsed_seconds(now);
        let final_cost = tariff.accrued(elapsed);
        let owed = final_cost - record.charged_amount - record.billing_details.shortfall;

        if owed > Decimal::ZERO {
            let collect = account.collectable(owed);
            let shortfall = owed - collect;
            if collect > Decimal::ZERO {
                let result = self
                    .ctx
                    .ledger
                    .charge_account(&ChargeRequest::debit(
                        account.id,
                        collect,
                        format!("Call {} terminated ({}s)", call_id, elapsed),
                        ReferenceType::CallIncrement,
                        call_id,
                        record.termination_key(),
                    ))
                    .await?;
                account.balance = result.balance_after;
            }
            // charged_amount must cover this charge even if the save below fails
            self.ctx
                .calls
                .add_charge(call_id, collect, billable_seconds(elapsed, tariff.increment), shortfall)
                .await?;
            record.charged_amount += collect;
            record.billing_details.shortfall += shortfall;
            summary.charged += collect;
            if shortfall > Decimal::ZERO {
                summary.shortfall += shortfall;
                self.alert_shortfall(&record, &account, shortfall).await;
            }
        }

        record.account_id = Some(account.id);
        record.rate_per_minute = Some(tariff.rate_per_minute);
        record.billing_increment = Some(tariff.increment);
        record.connection_fee = tariff.connection_fee;
        record.charged_seconds = billable_seconds(elapsed, tariff.increment);
        record.call_status = CallStatus::Terminated;
        record.end_time = Some(now);
        record.duration = (now - record.start_time).num_seconds().max(0);
        record.billsec = elapsed;
        record.disposition = Some("ANSWERED".to_string());
        record.billing_details.termination_reason = Some(reason.as_str().to_string());
        record.apply(BillingEvent::Claim)?;
        record.apply(BillingEvent::Charged { cost: final_cost })?;
        self.ctx.calls.save(&record).await?;

        summary.terminated += 1;
        info!("Terminated call {} after {}s ({})", call_id, elapsed, reason.as_str());
        emit(
            self.ctx.notifier.as_ref(),
            NotificationEvent::warning(
                "monitor.terminated",
                format!("Call {} terminated: {}", call_id, reason.as_str()),
            )
            .with_metadata(serde_json::json!({
                "call_id": call_id,
                "account_id": account.id,
                "reason": reason.as_str(),
                "elapsed_seconds": elapsed,
                "cost": final_cost.to_string(),
            })),
        )
        .await;

        Ok(())
    }

    async fn alert_shortfall(&self, record: &CallRecord, account: &Account, shortfall: Decimal) {
        emit(
            self.ctx.notifier.as_ref(),
            NotificationEvent::warning(
                "monitor.shortfall",
                format!("Prepaid balance of {} exhausted on call {}", account.account_number, record.call_id),
            )
            .with_metadata(serde_json::json!({
                "call_id": record.call_id,
                "account_id": account.id,
                "shortfall": shortfall.to_string(),
            })),
        )
        .await;
    }

    async fn persist(&self, summary: &MonitorSummary) {
        let writes = [
            (watermarks::LAST_CALL_MONITOR_AT, serde_json::json!(summary.finished_at)),
            (
                watermarks::LAST_CALL_MONITOR_STATS,
                serde_json::to_value(summary).unwrap_or_default(),
            ),
        ];
        for (key, value) in writes {
            if let Err(e) = self.ctx.settings.put(key, value).await {
                error!("Failed to store {}: {}", key, e);
            }
        }
    }
}

//! CDR ingestion pipeline
//!
//! One invocation runs three phases under the `process-cdrs` lock:
//!
//! 1. **new**: final CDRs of the trailing window, keyset-paged at twice
//!    the batch size and processed in batch-sized chunks. When the stored
//!    cursor lags behind the window the run resumes from the cursor
//!    instead, so CDRs are never aged out unread
//! 2. **backlog**: pending records never billed, plus `processing`
//!    records abandoned by a crashed run
//! 3. **retry**: `failed` records below the retry limit whose cooldown
//!    has elapsed
//!
//! A record failure is recorded on the record and never aborts its batch.
//! Every settlement carries the `cdr:{call_id}` idempotency key, so
//! re-running a record after a crash cannot charge it twice.

use chrono::{DateTime, Utc};
use ledgerline_core::{
    config::CdrConfig,
    models::{
        billable_seconds, Account, BillingEvent, BillingStatus, CallRecord, CallStatus,
        CdrCursor, ChargeRequest, NotificationEvent, RawCdr, ReferenceType,
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

/// Tunables of one pipeline run
#[derive(Debug, Clone)]
pub struct CdrOptions {
    pub batch_size: usize,
    pub max_retries: i32,
    pub window: chrono::Duration,
    pub retry_cooldown: chrono::Duration,
    pub stale_after: chrono::Duration,
    pub batch_pause: Duration,
    pub timeout: Duration,
    pub failure_threshold_percent: u32,
    pub lock_ttl: Duration,
    pub dry_run: bool,
    pub force: bool,
}

impl From<&CdrConfig> for CdrOptions {
    fn from(config: &CdrConfig) -> Self {
        Self {
            batch_size: config.batch_size.max(1),
            max_retries: config.max_retries,
            window: chrono::Duration::minutes(config.window_minutes),
            retry_cooldown: chrono::Duration::seconds(config.retry_cooldown_secs),
            stale_after: chrono::Duration::seconds(config.stale_processing_secs),
            batch_pause: config.batch_pause(),
            timeout: config.timeout(),
            failure_threshold_percent: config.failure_threshold_percent,
            lock_ttl: Duration::from_secs(config.lock_ttl_secs),
            dry_run: false,
            force: false,
        }
    }
}

/// Counters of one phase
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PhaseStats {
    pub selected: usize,
    pub batches: usize,
    pub completed: usize,
    pub no_billing_required: usize,
    pub failed: usize,
    pub permanently_failed: usize,
    /// Duplicates and records owned by another state
    pub skipped: usize,
    /// Selections or fetches that failed as a whole
    pub batch_errors: usize,
}

impl PhaseStats {
    fn record(&mut self, status: BillingStatus) {
        match status {
            BillingStatus::Completed => self.completed += 1,
            BillingStatus::NoBillingRequired => self.no_billing_required += 1,
            BillingStatus::Failed => self.failed += 1,
            BillingStatus::PermanentlyFailed => self.permanently_failed += 1,
            BillingStatus::Pending | BillingStatus::Processing => self.skipped += 1,
        }
    }

    pub fn processed(&self) -> usize {
        self.completed + self.no_billing_required + self.failed + self.permanently_failed
    }

    pub fn failures(&self) -> usize {
        self.failed + self.permanently_failed
    }
}

/// Result of one pipeline run, persisted as `last_cdr_processing_stats`
#[derive(Debug, Clone, Serialize)]
pub struct CdrSummary {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub dry_run: bool,
    pub budget_exhausted: bool,
    pub new_records: PhaseStats,
    pub backlog: PhaseStats,
    pub retries: PhaseStats,
}

impl CdrSummary {
    fn phases(&self) -> [&PhaseStats; 3] {
        [&self.new_records, &self.backlog, &self.retries]
    }

    pub fn processed(&self) -> usize {
        self.phases().iter().map(|p| p.processed()).sum()
    }

    pub fn failures(&self) -> usize {
        self.phases().iter().map(|p| p.failures()).sum()
    }

    pub fn batch_errors(&self) -> usize {
        self.phases().iter().map(|p| p.batch_errors).sum()
    }

    /// Whether failures exceed `threshold_percent` of the attempted work
    ///
    /// A failed fetch or selection counts as one failed unit.
    pub fn exceeds_failure_threshold(&self, threshold_percent: u32) -> bool {
        let failed = self.failures() + self.batch_errors();
        let attempted = self.processed() + self.batch_errors();
        if attempted == 0 {
            return false;
        }
        failed * 100 > attempted * threshold_percent as usize
    }
}

#[derive(Debug, Clone, Copy)]
enum Phase {
    Backlog,
    Retry,
}

impl Phase {
    fn name(&self) -> &'static str {
        match self {
            Phase::Backlog => "backlog",
            Phase::Retry => "retry",
        }
    }
}

pub struct CdrProcessor {
    ctx: BillingContext,
    options: CdrOptions,
}

impl CdrProcessor {
    pub fn new(ctx: BillingContext, options: CdrOptions) -> Self {
        Self { ctx, options }
    }

    /// Run all three phases under the job lock
    pub async fn run(&self) -> AppResult<CdrSummary> {
        with_lock(
            self.ctx.locks.as_ref(),
            jobs::PROCESS_CDRS,
            self.options.lock_ttl,
            self.options.force,
            || self.process(),
        )
        .await
    }

    #[instrument(skip(self), fields(dry_run = self.options.dry_run))]
    async fn process(&self) -> AppResult<CdrSummary> {
        let budget = ExecutionBudget::start(self.options.timeout);
        let mut summary = CdrSummary {
            started_at: Utc::now(),
            finished_at: Utc::now(),
            dry_run: self.options.dry_run,
            budget_exhausted: false,
            new_records: PhaseStats::default(),
            backlog: PhaseStats::default(),
            retries: PhaseStats::default(),
        };

        // Call ids attempted this run; each record gets one attempt per run
        let mut attempted = HashSet::new();

        summary.new_records = self.ingest_new(&budget, &mut attempted).await;
        if !budget.exhausted() {
            summary.backlog = self.drain(Phase::Backlog, &budget, &mut attempted).await;
        }
        if !budget.exhausted() {
            summary.retries = self.drain(Phase::Retry, &budget, &mut attempted).await;
        }
        summary.budget_exhausted = budget.exhausted();
        summary.finished_at = Utc::now();

        info!(
            processed = summary.processed(),
            failed = summary.failures(),
            batch_errors = summary.batch_errors(),
            budget_exhausted = summary.budget_exhausted,
            "CDR processing finished in {:?}",
            budget.elapsed()
        );

        if !self.options.dry_run {
            self.persist(&summary).await;
        }
        self.report(&summary).await;
        Ok(summary)
    }

    async fn ingest_new(
        &self,
        budget: &ExecutionBudget,
        attempted: &mut HashSet<String>,
    ) -> PhaseStats {
        let mut stats = PhaseStats::default();
        let end = Utc::now();
        let window_start = end - self.options.window;
        let stored = self.load_cursor().await;

        // A cursor behind the window means an earlier run stopped short
        let (start, mut after) = match &stored {
            Some(cursor) if cursor.end_time < window_start => {
                (cursor.end_time, Some(cursor.clone()))
            }
            _ => (window_start, None),
        };
        let page_size = self.options.batch_size * 2;
        let mut progress = stored.clone();
        let mut blocked = false;

        'pages: loop {
            let page = match self
                .ctx
                .telephony
                .fetch_cdrs(start, end, after.as_ref(), page_size)
                .await
            {
                Ok(cdrs) => cdrs,
                Err(e) => {
                    error!("Failed to fetch CDRs: {}", e);
                    stats.batch_errors += 1;
                    emit(
                        self.ctx.notifier.as_ref(),
                        NotificationEvent::warning("cdr.fetch_failed", format!("CDR fetch failed: {}", e)),
                    )
                    .await;
                    break;
                }
            };
            stats.selected += page.len();
            debug!("Fetched {} CDRs between {} and {}", page.len(), start, end);
            let last_page = page.len() < page_size;

            for chunk in page.chunks(self.options.batch_size) {
                if budget.exhausted() {
                    warn!("Execution budget exhausted; remaining CDRs are left for the next run");
                    break 'pages;
                }
                if stats.batches > 0 {
                    tokio::time::sleep(self.options.batch_pause).await;
                }
                stats.batches += 1;

                for raw in chunk {
                    match self.ingest_one(raw).await {
                        Ok(Some(status)) => {
                            attempted.insert(raw.call_id.clone());
                            stats.record(status);
                        }
                        Ok(None) => stats.skipped += 1,
                        Err(e) => {
                            warn!(call_id = %raw.call_id, "Failed to ingest CDR: {}", e);
                            attempted.insert(raw.call_id.clone());
                            stats.failed += 1;
                            // Malformed input is final; anything else is re-read next run
                            if !matches!(e, AppError::MalformedRecord(_)) {
                                blocked = true;
                            }
                            continue;
                        }
                    }
                    if !blocked {
                        if let Some(position) = CdrCursor::after(raw) {
                            if progress.as_ref().map_or(true, |p| position > *p) {
                                progress = Some(position);
                            }
                        }
                    }
                }
            }

            match page.last().and_then(CdrCursor::after) {
                Some(next) if !last_page => after = Some(next),
                _ => break,
            }
        }

        if !self.options.dry_run {
            if let Some(cursor) = progress.filter(|p| stored.as_ref() != Some(p)) {
                self.store_cursor(&cursor).await;
            }
        }
        stats
    }

    async fn load_cursor(&self) -> Option<CdrCursor> {
        match self.ctx.settings.get(watermarks::LAST_CDR_CURSOR).await {
            Ok(setting) => setting.and_then(|s| match serde_json::from_value(s.value) {
                Ok(cursor) => Some(cursor),
                Err(e) => {
                    warn!("Ignoring unreadable CDR cursor: {}", e);
                    None
                }
            }),
            Err(e) => {
                warn!("Failed to load CDR cursor, reading the whole window: {}", e);
                None
            }
        }
    }

    async fn store_cursor(&self, cursor: &CdrCursor) {
        let value = match serde_json::to_value(cursor) {
            Ok(v) => v,
            Err(e) => {
                error!("Failed to serialize CDR cursor: {}", e);
                return;
            }
        };
        if let Err(e) = self.ctx.settings.put(watermarks::LAST_CDR_CURSOR, value).await {
            error!("Failed to store CDR cursor: {}", e);
        }
    }

    /// `None` when the CDR was already ingested
    async fn ingest_one(&self, raw: &RawCdr) -> AppResult<Option<BillingStatus>> {
        if let Err(invalid) = raw.validate() {
            return self.reject(raw, invalid).await;
        }

        let record = match self.ctx.calls.find_by_call_id(&raw.call_id).await? {
            None if self.options.dry_run => CallRecord::from_raw_cdr(raw),
            None => match self.ctx.calls.insert(&CallRecord::from_raw_cdr(raw)).await? {
                Some(record) => record,
                None => return Ok(None),
            },
            Some(mut existing) => match (existing.call_status, existing.billing_status) {
                (CallStatus::Connected, BillingStatus::Pending) => {
                    existing.merge_final_cdr(raw);
                    existing
                }
                // Closed from its last sighting; the real CDR replaces the estimate
                (_, BillingStatus::Pending) if existing.billing_details.closed_without_cdr => {
                    existing.merge_final_cdr(raw);
                    existing
                }
                (_, BillingStatus::Pending) => existing,
                (_, status) => {
                    debug!("Skipping CDR {} already {}", raw.call_id, status);
                    return Ok(None);
                }
            },
        };

        self.bill(record).await.map(Some)
    }

    /// Store a malformed CDR straight as permanently failed
    async fn reject(&self, raw: &RawCdr, invalid: AppError) -> AppResult<Option<BillingStatus>> {
        warn!("Malformed CDR {:?}: {}", raw.call_id, invalid);
        if raw.call_id.trim().is_empty() || self.options.dry_run {
            return Err(invalid);
        }

        let Some(mut record) = self.ctx.calls.insert(&CallRecord::from_raw_cdr(raw)).await? else {
            return Ok(None);
        };
        record.apply(BillingEvent::Claim)?;
        let status = record.apply(BillingEvent::failure(&invalid, self.options.max_retries))?;
        self.ctx.calls.save(&record).await?;
        self.alert_permanent(&record).await;
        Ok(Some(status))
    }

    /// Drive one record through claim, settlement and outcome
    async fn bill(&self, mut record: CallRecord) -> AppResult<BillingStatus> {
        if self.options.dry_run {
            return Ok(self.preview(&record).await);
        }

        record.apply(BillingEvent::Claim)?;
        self.ctx.calls.save(&record).await?;

        let event = match self.settle(&mut record).await {
            Ok(Some(cost)) => BillingEvent::Charged { cost },
            Ok(None) => BillingEvent::NotBillable,
            Err(e) => {
                warn!(
                    call_id = %record.call_id,
                    retry_count = record.retry_count,
                    "Billing attempt failed: {}", e
                );
                BillingEvent::failure(&e, self.options.max_retries)
            }
        };

        let status = record.apply(event)?;
        self.ctx.calls.save(&record).await?;

        if status == BillingStatus::PermanentlyFailed {
            self.alert_permanent(&record).await;
        }
        Ok(status)
    }

    /// Charge (or credit) the difference between the final cost and what
    /// the monitor already collected
    ///
    /// Returns `None` for a call that is not billable and owes nothing.
    async fn settle(&self, record: &mut CallRecord) -> AppResult<Option<Decimal>> {
        let billable = record.is_billable();
        if !billable && record.charged_amount.is_zero() {
            return Ok(None);
        }

        let account = self.resolve_account(record).await?;

        let final_cost = if billable {
            let rate = self
                .ctx
                .rating
                .find_rate(&record.destination)
                .await?
                .ok_or_else(|| AppError::RateNotFound(record.destination.clone()))?;
            record.rate_per_minute = Some(rate.rate_per_minute);
            record.billing_increment = Some(rate.billing_increment);
            record.connection_fee = rate.connection_fee;
            rate.calculate_cost(record.billsec)
        } else {
            Decimal::ZERO
        };

        let delta = record.outstanding(final_cost);
        let request = ChargeRequest::settle(
            account.id,
            delta,
            format!("Call {} to {} ({}s)", record.call_id, record.destination, record.billsec),
            ReferenceType::CallRecord,
            &record.call_id,
            record.settlement_key(),
        );

        if let Some(request) = request {
            let result = self.ctx.ledger.charge_account(&request).await?;
            if result.duplicate {
                info!("Call {} was already settled (transaction {})", record.call_id, result.transaction_id);
            } else {
                debug!(
                    "Settled call {}: {} {} ({} -> {})",
                    record.call_id, request.direction, request.amount, result.balance_before, result.balance_after
                );
            }
            if account.is_prepaid() && result.balance_after < Decimal::ZERO && !result.duplicate {
                emit(
                    self.ctx.notifier.as_ref(),
                    NotificationEvent::warning(
                        "cdr.negative_balance",
                        format!("Prepaid account {} went negative", account.account_number),
                    )
                    .with_metadata(serde_json::json!({
                        "account_id": account.id,
                        "call_id": record.call_id,
                        "balance": result.balance_after.to_string(),
                    })),
                )
                .await;
            }
        }

        record.charged_amount = final_cost;
        record.charged_seconds = if billable {
            billable_seconds(record.billsec, record.billing_increment.unwrap_or(60))
        } else {
            0
        };
        Ok(Some(final_cost))
    }

    async fn resolve_account(&self, record: &mut CallRecord) -> AppResult<Account> {
        let found = match record.account_id {
            Some(id) => self.ctx.accounts.find_by_id(id).await?,
            None => self.ctx.accounts.find_by_phone(&record.source).await?,
        };
        let account = found.ok_or_else(|| AppError::AccountNotFound(record.source.clone()))?;
        record.account_id = Some(account.id);
        Ok(account)
    }

    /// What `bill` would do, without writing anything
    async fn preview(&self, record: &CallRecord) -> BillingStatus {
        if !record.is_billable() {
            info!("[dry-run] {} is not billable", record.call_id);
            return BillingStatus::NoBillingRequired;
        }
        match self
            .ctx
            .rating
            .calculate_cost(&record.destination, record.billsec)
            .await
        {
            Ok(cost) => {
                info!(
                    "[dry-run] would settle {} for {} (final cost {})",
                    record.call_id,
                    record.outstanding(cost),
                    cost
                );
                BillingStatus::Completed
            }
            Err(e) => {
                info!("[dry-run] {} would fail: {}", record.call_id, e);
                BillingStatus::Failed
            }
        }
    }

    /// Backlog and retry phases: select, bill, repeat until dry
    async fn drain(
        &self,
        phase: Phase,
        budget: &ExecutionBudget,
        attempted: &mut HashSet<String>,
    ) -> PhaseStats {
        let mut stats = PhaseStats::default();
        let batch_size = self.options.batch_size;

        while !budget.exhausted() {
            let now = Utc::now();
            let selected = match phase {
                Phase::Backlog => {
                    self.ctx
                        .calls
                        .find_backlog(now - self.options.stale_after, batch_size)
                        .await
                }
                Phase::Retry => {
                    self.ctx
                        .calls
                        .find_retryable(self.options.max_retries, now - self.options.retry_cooldown, batch_size)
                        .await
                }
            };
            let selected = match selected {
                Ok(records) => records,
                Err(e) => {
                    error!("Failed to select {} records: {}", phase.name(), e);
                    stats.batch_errors += 1;
                    break;
                }
            };

            let full_batch = selected.len() >= batch_size;
            let fresh: Vec<CallRecord> = selected
                .into_iter()
                .filter(|r| attempted.insert(r.call_id.clone()))
                .collect();
            if fresh.is_empty() {
                break;
            }
            if stats.batches > 0 {
                tokio::time::sleep(self.options.batch_pause).await;
            }
            stats.batches += 1;
            stats.selected += fresh.len();

            for record in fresh {
                let call_id = record.call_id.clone();
                match self.bill(record).await {
                    Ok(status) => stats.record(status),
                    Err(e) => {
                        warn!(call_id = %call_id, "{} attempt failed: {}", phase.name(), e);
                        stats.failed += 1;
                    }
                }
            }

            if !full_batch {
                break;
            }
        }

        stats
    }

    async fn persist(&self, summary: &CdrSummary) {
        let stats = match serde_json::to_value(summary) {
            Ok(v) => v,
            Err(e) => {
                error!("Failed to serialize CDR summary: {}", e);
                return;
            }
        };
        let writes = [
            (watermarks::LAST_CDR_PROCESSING_AT, serde_json::json!(summary.finished_at)),
            (watermarks::LAST_CDR_PROCESSING_STATS, stats),
        ];
        for (key, value) in writes {
            if let Err(e) = self.ctx.settings.put(key, value).await {
                error!("Failed to store {}: {}", key, e);
            }
        }
    }

    async fn report(&self, summary: &CdrSummary) {
        let metadata = serde_json::to_value(summary).unwrap_or_default();
        let message = format!(
            "CDR processing: {} processed, {} failed",
            summary.processed(),
            summary.failures()
        );

        emit(
            self.ctx.notifier.as_ref(),
            NotificationEvent::info("cdr.summary", message.clone()).with_metadata(metadata.clone()),
        )
        .await;

        if summary.failures() + summary.batch_errors() > 0 {
            emit(
                self.ctx.notifier.as_ref(),
                NotificationEvent::warning("cdr.failures", message).with_metadata(metadata),
            )
            .await;
        }
    }

    async fn alert_permanent(&self, record: &CallRecord) {
        emit(
            self.ctx.notifier.as_ref(),
            NotificationEvent::critical(
                "cdr.permanently_failed",
                format!("Call {} needs manual billing", record.call_id),
            )
            .with_metadata(serde_json::json!({
                "call_id": record.call_id,
                "retry_count": record.retry_count,
                "last_error": record.billing_details.last_error,
            })),
        )
        .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stats(completed: usize, failed: usize, batch_errors: usize) -> PhaseStats {
        PhaseStats {
            completed,
            failed,
            batch_errors,
            ..Default::default()
        }
    }

    fn summary(new_records: PhaseStats, retries: PhaseStats) -> CdrSummary {
        CdrSummary {
            started_at: Utc::now(),
            finished_at: Utc::now(),
            dry_run: false,
            budget_exhausted: false,
            new_records,
            backlog: PhaseStats::default(),
            retries,
        }
    }

    #[test]
    fn test_failure_threshold() {
        // 1 of 50 failed
        assert!(!summary(stats(49, 1, 0), PhaseStats::default()).exceeds_failure_threshold(50));
        // 30 of 50 failed
        assert!(summary(stats(20, 30, 0), PhaseStats::default()).exceeds_failure_threshold(50));
        // exactly half is not over the threshold
        assert!(!summary(stats(5, 0, 0), stats(0, 5, 0)).exceeds_failure_threshold(50));
        // a failed fetch with nothing else done
        assert!(summary(stats(0, 0, 1), PhaseStats::default()).exceeds_failure_threshold(50));
        // nothing to do is a success
        assert!(!summary(PhaseStats::default(), PhaseStats::default()).exceeds_failure_threshold(50));
    }

    #[test]
    fn test_options_from_config() {
        let options = CdrOptions::from(&CdrConfig::default());
        assert_eq!(options.batch_size, 50);
        assert_eq!(options.max_retries, 3);
        assert_eq!(options.window, chrono::Duration::minutes(10));
        assert_eq!(options.retry_cooldown, chrono::Duration::seconds(300));
        assert_eq!(options.batch_pause, Duration::from_millis(100));
        assert!(!options.dry_run);
    }
}

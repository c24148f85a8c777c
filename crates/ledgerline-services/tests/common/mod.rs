//! Shared fixtures: an in-memory billing context plus scripted collaborators

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use ledgerline_core::{
    models::{
        Account, AccountType, ActiveCall, BillableResource, CallRecord, CdrCursor,
        NotificationEvent, RateCard, RawCdr,
    },
    traits::{CallRecordRepository, Notifier, RateRepository, TelephonyProvider},
    AppError, AppResult,
};
use ledgerline_services::memory::{
    MemoryBank, MemoryCache, MemoryCallRecords, MemoryLockStore, MemoryRates, MemoryResources,
    MemorySettings,
};
use ledgerline_services::{BillingContext, RatingServiceImpl};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use std::collections::HashSet;
use std::sync::Arc;

/// Switch double: returns whatever CDRs and calls the test scripted
#[derive(Default)]
pub struct ScriptedTelephony {
    cdrs: Mutex<Vec<RawCdr>>,
    active: Mutex<Vec<ActiveCall>>,
    refuse_hangup: Mutex<bool>,
    hung_up: Mutex<Vec<String>>,
    fetches: Mutex<Vec<Option<CdrCursor>>>,
}

impl ScriptedTelephony {
    pub fn push_cdr(&self, cdr: RawCdr) {
        self.cdrs.lock().push(cdr);
    }

    pub fn set_active(&self, calls: Vec<ActiveCall>) {
        *self.active.lock() = calls;
    }

    pub fn refuse_hangups(&self, refuse: bool) {
        *self.refuse_hangup.lock() = refuse;
    }

    pub fn hung_up(&self) -> Vec<String> {
        self.hung_up.lock().clone()
    }

    /// Cursor passed to each fetch so far
    pub fn fetches(&self) -> Vec<Option<CdrCursor>> {
        self.fetches.lock().clone()
    }
}

#[async_trait]
impl TelephonyProvider for ScriptedTelephony {
    async fn fetch_cdrs(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        after: Option<&CdrCursor>,
        limit: usize,
    ) -> AppResult<Vec<RawCdr>> {
        self.fetches.lock().push(after.cloned());
        let mut cdrs: Vec<RawCdr> = self
            .cdrs
            .lock()
            .iter()
            .filter(|c| c.end_time.is_some_and(|t| t >= start && t < end))
            .filter(|c| after.map_or(true, |cursor| cursor.precedes(c)))
            .cloned()
            .collect();
        cdrs.sort_by(|a, b| (a.end_time, &a.call_id).cmp(&(b.end_time, &b.call_id)));
        cdrs.truncate(limit);
        Ok(cdrs)
    }

    async fn active_calls(&self) -> AppResult<Vec<ActiveCall>> {
        Ok(self.active.lock().clone())
    }

    async fn terminate_call(&self, call_id: &str) -> AppResult<bool> {
        if *self.refuse_hangup.lock() {
            return Ok(false);
        }
        self.hung_up.lock().push(call_id.to_string());
        self.active.lock().retain(|c| c.call_id != call_id);
        Ok(true)
    }
}

/// Keeps every event it is handed
#[derive(Default)]
pub struct RecordingNotifier {
    events: Mutex<Vec<NotificationEvent>>,
}

impl RecordingNotifier {
    pub fn events(&self) -> Vec<NotificationEvent> {
        self.events.lock().clone()
    }

    pub fn in_category(&self, category: &str) -> Vec<NotificationEvent> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.category == category)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, event: &NotificationEvent) -> AppResult<()> {
        self.events.lock().push(event.clone());
        Ok(())
    }
}

/// Rate store that fails for chosen destinations
pub struct FlakyRates {
    inner: MemoryRates,
    failing: Mutex<HashSet<String>>,
}

impl FlakyRates {
    pub fn new(rates: Vec<RateCard>) -> Self {
        Self {
            inner: MemoryRates::new(rates),
            failing: Mutex::new(HashSet::new()),
        }
    }

    pub fn fail_for(&self, destination: &str) {
        self.failing.lock().insert(destination.to_string());
    }

    pub fn heal(&self) {
        self.failing.lock().clear();
    }
}

#[async_trait]
impl RateRepository for FlakyRates {
    async fn find_by_destination(&self, destination: &str) -> AppResult<Option<RateCard>> {
        if self.failing.lock().contains(destination) {
            return Err(AppError::Database(format!("rate lookup timed out for {}", destination)));
        }
        self.inner.find_by_destination(destination).await
    }
}

/// Call record store whose next few `add_charge` calls fail
pub struct FlakyCalls {
    inner: Arc<MemoryCallRecords>,
    failing_charges: Mutex<usize>,
}

impl FlakyCalls {
    pub fn new(inner: Arc<MemoryCallRecords>) -> Self {
        Self {
            inner,
            failing_charges: Mutex::new(0),
        }
    }

    pub fn fail_next_charges(&self, count: usize) {
        *self.failing_charges.lock() = count;
    }
}

#[async_trait]
impl CallRecordRepository for FlakyCalls {
    async fn find_by_call_id(&self, call_id: &str) -> AppResult<Option<CallRecord>> {
        self.inner.find_by_call_id(call_id).await
    }

    async fn insert(&self, record: &CallRecord) -> AppResult<Option<CallRecord>> {
        self.inner.insert(record).await
    }

    async fn save(&self, record: &CallRecord) -> AppResult<()> {
        self.inner.save(record).await
    }

    async fn add_charge(
        &self,
        call_id: &str,
        amount: Decimal,
        charged_seconds: i64,
        shortfall: Decimal,
    ) -> AppResult<()> {
        {
            let mut failing = self.failing_charges.lock();
            if *failing > 0 {
                *failing -= 1;
                return Err(AppError::Database("connection reset".to_string()));
            }
        }
        self.inner
            .add_charge(call_id, amount, charged_seconds, shortfall)
            .await
    }

    async fn mark_seen(&self, call_ids: &[String], seen_at: DateTime<Utc>) -> AppResult<()> {
        self.inner.mark_seen(call_ids, seen_at).await
    }

    async fn find_backlog(
        &self,
        stale_before: DateTime<Utc>,
        limit: usize,
    ) -> AppResult<Vec<CallRecord>> {
        self.inner.find_backlog(stale_before, limit).await
    }

    async fn find_retryable(
        &self,
        max_retries: i32,
        cooldown_before: DateTime<Utc>,
        limit: usize,
    ) -> AppResult<Vec<CallRecord>> {
        self.inner
            .find_retryable(max_retries, cooldown_before, limit)
            .await
    }

    async fn find_connected(&self) -> AppResult<Vec<CallRecord>> {
        self.inner.find_connected().await
    }
}

/// Every store in memory, with handles kept for assertions
pub struct Harness {
    pub bank: Arc<MemoryBank>,
    pub calls: Arc<MemoryCallRecords>,
    pub rates: Arc<FlakyRates>,
    pub resources: Arc<MemoryResources>,
    pub settings: Arc<MemorySettings>,
    pub locks: Arc<MemoryLockStore>,
    pub telephony: Arc<ScriptedTelephony>,
    pub notifier: Arc<RecordingNotifier>,
    pub ctx: BillingContext,
}

impl Harness {
    pub fn new(accounts: Vec<Account>, rates: Vec<RateCard>, resources: Vec<BillableResource>) -> Self {
        let bank = Arc::new(MemoryBank::new(accounts));
        let calls = Arc::new(MemoryCallRecords::new());
        let rates = Arc::new(FlakyRates::new(rates));
        let resources = Arc::new(MemoryResources::new(bank.clone(), resources));
        let settings = Arc::new(MemorySettings::new());
        let locks = Arc::new(MemoryLockStore::new());
        let telephony = Arc::new(ScriptedTelephony::default());
        let notifier = Arc::new(RecordingNotifier::default());
        let rating = Arc::new(RatingServiceImpl::new(rates.clone(), Arc::new(MemoryCache::new())));

        let ctx = BillingContext {
            accounts: bank.clone(),
            ledger: bank.clone(),
            calls: calls.clone(),
            rating,
            resources: resources.clone(),
            settings: settings.clone(),
            locks: locks.clone(),
            telephony: telephony.clone(),
            notifier: notifier.clone(),
        };

        Self {
            bank,
            calls,
            rates,
            resources,
            settings,
            locks,
            telephony,
            notifier,
            ctx,
        }
    }
}

pub fn prepaid(id: i32, phone: &str, balance: Decimal) -> Account {
    Account {
        id,
        account_number: format!("ACC{:04}", id),
        customer_phone: Some(phone.to_string()),
        account_type: AccountType::Prepaid,
        balance,
        ..Default::default()
    }
}

pub fn postpaid(id: i32, phone: &str, balance: Decimal, credit_limit: Decimal) -> Account {
    Account {
        account_type: AccountType::Postpaid,
        credit_limit,
        ..prepaid(id, phone, balance)
    }
}

pub fn rate(prefix: &str, per_minute: Decimal, increment: i32) -> RateCard {
    RateCard {
        destination_prefix: prefix.to_string(),
        destination_name: format!("Prefix {}", prefix),
        rate_per_minute: per_minute,
        billing_increment: increment,
        effective_start: Utc::now() - Duration::days(30),
        ..Default::default()
    }
}

/// An answered final CDR that ended a minute ago
pub fn answered_cdr(call_id: &str, source: &str, destination: &str, billsec: i64) -> RawCdr {
    let end = Utc::now() - Duration::minutes(1);
    let answer = end - Duration::seconds(billsec);
    RawCdr {
        call_id: call_id.to_string(),
        source: source.to_string(),
        destination: destination.to_string(),
        start_time: answer - Duration::seconds(5),
        answer_time: Some(answer),
        end_time: Some(end),
        duration: billsec + 5,
        billsec: Some(billsec),
        disposition: "ANSWERED".to_string(),
    }
}

/// A call answered `elapsed_secs` ago and still up
pub fn live_call(call_id: &str, source: &str, destination: &str, elapsed_secs: i64) -> ActiveCall {
    let answer = Utc::now() - Duration::seconds(elapsed_secs);
    ActiveCall {
        call_id: call_id.to_string(),
        source: source.to_string(),
        destination: destination.to_string(),
        start_time: answer - Duration::seconds(3),
        answer_time: answer,
    }
}

//! In-process implementations of every store
//!
//! Same contracts as the PostgreSQL/Redis implementations, guarded by
//! `parking_lot` mutexes that are never held across an await. Used by the
//! test suites and for local dry runs.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ledgerline_core::{
    models::{
        Account, BalanceTransaction, BillableResource, BillingPeriod, BillingStatus, CallRecord,
        CallStatus, ChargeRequest, ChargeResult, HistoryEntry, LockHolder, RateCard,
        RecurringDecision, ReferenceType, ResourceStatus,
    },
    traits::{
        AccountRepository, CacheService, CallRecordRepository, Ledger, LockStore, RateRepository,
        ResourceOutcome, ResourceRepository, Setting, SettingsStore,
    },
    AppError, AppResult,
};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde::{de::DeserializeOwned, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

// ==================== Locks ====================

#[derive(Default)]
pub struct MemoryLockStore {
    locks: Mutex<HashMap<String, (LockHolder, Instant)>>,
}

impl MemoryLockStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LockStore for MemoryLockStore {
    async fn acquire(
        &self,
        key: &str,
        ttl: Duration,
        holder: &LockHolder,
        force: bool,
    ) -> AppResult<bool> {
        let mut locks = self.locks.lock();
        let now = Instant::now();

        if force {
            locks.remove(key);
        }
        if let Some((_, expires)) = locks.get(key) {
            if *expires > now {
                return Ok(false);
            }
        }
        locks.insert(key.to_string(), (holder.clone(), now + ttl));
        Ok(true)
    }

    async fn release(&self, key: &str, holder: &LockHolder) -> AppResult<bool> {
        let mut locks = self.locks.lock();
        match locks.get(key) {
            Some((current, _)) if current.token == holder.token => {
                locks.remove(key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn holder(&self, key: &str) -> AppResult<Option<LockHolder>> {
        let locks = self.locks.lock();
        Ok(locks
            .get(key)
            .filter(|(_, expires)| *expires > Instant::now())
            .map(|(holder, _)| holder.clone()))
    }
}

// ==================== Accounts and ledger ====================

#[derive(Debug, Clone, Default)]
struct BankState {
    accounts: BTreeMap<i32, Account>,
    transactions: Vec<BalanceTransaction>,
    next_transaction_id: i64,
}

impl BankState {
    /// The ledger's atomic unit; callers hold the state lock
    fn charge(&mut self, request: &ChargeRequest) -> AppResult<ChargeResult> {
        request.validate()?;

        if let Some(existing) = self
            .transactions
            .iter()
            .find(|tx| tx.idempotency_key == request.idempotency_key)
        {
            return Ok(ChargeResult::duplicate_of(existing));
        }

        let account = self
            .accounts
            .get_mut(&request.account_id)
            .ok_or_else(|| AppError::AccountNotFound(request.account_id.to_string()))?;

        self.next_transaction_id += 1;
        let tx = BalanceTransaction::from_request(self.next_transaction_id, request, account.balance);
        account.balance = tx.balance_after;
        account.updated_at = tx.created_at;

        let result = ChargeResult::applied(&tx);
        self.transactions.push(tx);
        Ok(result)
    }
}

/// Accounts plus their ledger under one lock
#[derive(Default)]
pub struct MemoryBank {
    state: Mutex<BankState>,
}

impl MemoryBank {
    /// Provision `accounts`, booking each balance as an opening transaction
    pub fn new(accounts: Vec<Account>) -> Self {
        let mut state = BankState::default();
        for account in accounts {
            let opening = ChargeRequest::opening(account.id, account.balance);
            state.accounts.insert(
                account.id,
                Account {
                    balance: Decimal::ZERO,
                    ..account
                },
            );
            if let Some(request) = opening {
                // Fresh key on a known account
                let _ = state.charge(&request);
            }
        }
        Self {
            state: Mutex::new(state),
        }
    }

    pub fn balance(&self, account_id: i32) -> Option<Decimal> {
        self.state.lock().accounts.get(&account_id).map(|a| a.balance)
    }

    /// Transactions booked after provisioning
    pub fn charges(&self) -> Vec<BalanceTransaction> {
        self.state
            .lock()
            .transactions
            .iter()
            .filter(|tx| tx.reference_type != ReferenceType::OpeningBalance)
            .cloned()
            .collect()
    }

    /// Move a cached balance without a ledger entry
    ///
    /// Only for reproducing drift; the billing jobs never do this.
    pub fn overwrite_balance(&self, account_id: i32, balance: Decimal) {
        if let Some(account) = self.state.lock().accounts.get_mut(&account_id) {
            account.balance = balance;
        }
    }
}

#[async_trait]
impl Ledger for MemoryBank {
    async fn charge_account(&self, request: &ChargeRequest) -> AppResult<ChargeResult> {
        self.state.lock().charge(request)
    }

    async fn transactions(&self, account_id: i32) -> AppResult<Vec<BalanceTransaction>> {
        Ok(self
            .state
            .lock()
            .transactions
            .iter()
            .filter(|tx| tx.account_id == account_id)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl AccountRepository for MemoryBank {
    async fn find_by_id(&self, id: i32) -> AppResult<Option<Account>> {
        Ok(self.state.lock().accounts.get(&id).cloned())
    }

    async fn find_by_phone(&self, phone: &str) -> AppResult<Option<Account>> {
        let wanted = Account::normalize_phone(phone);
        if wanted.is_empty() {
            return Ok(None);
        }
        Ok(self
            .state
            .lock()
            .accounts
            .values()
            .find(|a| {
                a.customer_phone.as_deref().map(Account::normalize_phone) == Some(wanted.clone())
                    || a.account_number == phone
            })
            .cloned())
    }

    async fn list_all(&self) -> AppResult<Vec<Account>> {
        Ok(self.state.lock().accounts.values().cloned().collect())
    }
}

// ==================== Call records ====================

#[derive(Default)]
struct CallState {
    records: BTreeMap<i64, CallRecord>,
    next_id: i64,
}

impl CallState {
    fn by_call_id(&mut self, call_id: &str) -> Option<&mut CallRecord> {
        self.records.values_mut().find(|r| r.call_id == call_id)
    }
}

#[derive(Default)]
pub struct MemoryCallRecords {
    state: Mutex<CallState>,
}

impl MemoryCallRecords {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, call_id: &str) -> Option<CallRecord> {
        self.state.lock().by_call_id(call_id).map(|r| r.clone())
    }

    pub fn all(&self) -> Vec<CallRecord> {
        self.state.lock().records.values().cloned().collect()
    }

    /// Mutate a stored record in place, e.g. to age it
    pub fn update_with(&self, call_id: &str, f: impl FnOnce(&mut CallRecord)) {
        if let Some(record) = self.state.lock().by_call_id(call_id) {
            f(record);
        }
    }

    fn select(&self, limit: usize, keep: impl Fn(&CallRecord) -> bool) -> Vec<CallRecord> {
        self.state
            .lock()
            .records
            .values()
            .filter(|r| keep(r))
            .take(limit)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl CallRecordRepository for MemoryCallRecords {
    async fn find_by_call_id(&self, call_id: &str) -> AppResult<Option<CallRecord>> {
        Ok(self.get(call_id))
    }

    async fn insert(&self, record: &CallRecord) -> AppResult<Option<CallRecord>> {
        let mut state = self.state.lock();
        if state.by_call_id(&record.call_id).is_some() {
            return Ok(None);
        }
        state.next_id += 1;
        let mut stored = record.clone();
        stored.id = state.next_id;
        state.records.insert(stored.id, stored.clone());
        Ok(Some(stored))
    }

    async fn save(&self, record: &CallRecord) -> AppResult<()> {
        let mut state = self.state.lock();
        let stored = state
            .by_call_id(&record.call_id)
            .ok_or_else(|| AppError::CallRecordNotFound(record.call_id.clone()))?;
        let id = stored.id;
        *stored = CallRecord {
            id,
            ..record.clone()
        };
        Ok(())
    }

    async fn add_charge(
        &self,
        call_id: &str,
        amount: Decimal,
        charged_seconds: i64,
        shortfall: Decimal,
    ) -> AppResult<()> {
        let mut state = self.state.lock();
        let record = state
            .by_call_id(call_id)
            .ok_or_else(|| AppError::CallRecordNotFound(call_id.to_string()))?;
        record.charged_amount += amount;
        record.charged_seconds = record.charged_seconds.max(charged_seconds);
        record.billing_details.shortfall += shortfall;
        record.updated_at = Utc::now();
        Ok(())
    }

    async fn mark_seen(&self, call_ids: &[String], seen_at: DateTime<Utc>) -> AppResult<()> {
        let mut state = self.state.lock();
        for call_id in call_ids {
            if let Some(record) = state.by_call_id(call_id) {
                if record.call_status == CallStatus::Connected {
                    record.billing_details.last_seen_at = Some(seen_at);
                }
            }
        }
        Ok(())
    }

    async fn find_backlog(
        &self,
        stale_before: DateTime<Utc>,
        limit: usize,
    ) -> AppResult<Vec<CallRecord>> {
        Ok(self.select(limit, |r| match r.billing_status {
            BillingStatus::Pending => r.call_status != CallStatus::Connected,
            BillingStatus::Processing => r.updated_at < stale_before,
            _ => false,
        }))
    }

    async fn find_retryable(
        &self,
        max_retries: i32,
        cooldown_before: DateTime<Utc>,
        limit: usize,
    ) -> AppResult<Vec<CallRecord>> {
        Ok(self.select(limit, |r| {
            r.billing_status == BillingStatus::Failed
                && r.retry_count < max_retries
                && r.updated_at < cooldown_before
        }))
    }

    async fn find_connected(&self) -> AppResult<Vec<CallRecord>> {
        Ok(self.select(usize::MAX, |r| {
            r.call_status == CallStatus::Connected && r.billing_status == BillingStatus::Pending
        }))
    }
}

// ==================== Rates ====================

pub struct MemoryRates {
    rates: Vec<RateCard>,
}

impl MemoryRates {
    pub fn new(rates: Vec<RateCard>) -> Self {
        Self { rates }
    }
}

#[async_trait]
impl RateRepository for MemoryRates {
    async fn find_by_destination(&self, destination: &str) -> AppResult<Option<RateCard>> {
        for prefix in RateCard::generate_prefixes(destination) {
            let best = self
                .rates
                .iter()
                .filter(|r| r.destination_prefix == prefix && r.is_effective())
                .max_by(|a, b| {
                    a.priority
                        .cmp(&b.priority)
                        .then(a.effective_start.cmp(&b.effective_start))
                });
            if let Some(rate) = best {
                return Ok(Some(rate.clone()));
            }
        }
        Ok(None)
    }
}

// ==================== Billable resources ====================

/// Resources billed against a [`MemoryBank`]
///
/// `bill_chunk` snapshots both resources and bank and restores them on
/// any error, so a chunk is all or nothing.
pub struct MemoryResources {
    bank: Arc<MemoryBank>,
    resources: Mutex<BTreeMap<i64, BillableResource>>,
    fail_on: Mutex<Option<i64>>,
}

impl MemoryResources {
    pub fn new(bank: Arc<MemoryBank>, resources: Vec<BillableResource>) -> Self {
        Self {
            bank,
            resources: Mutex::new(resources.into_iter().map(|r| (r.id, r)).collect()),
            fail_on: Mutex::new(None),
        }
    }

    pub fn get(&self, id: i64) -> Option<BillableResource> {
        self.resources.lock().get(&id).cloned()
    }

    /// Make any chunk containing `resource_id` fail when it reaches it
    pub fn fail_on(&self, resource_id: Option<i64>) {
        *self.fail_on.lock() = resource_id;
    }

    fn bill_one(
        bank: &mut BankState,
        resource: &mut BillableResource,
        period: BillingPeriod,
        suspend_insufficient: bool,
    ) -> AppResult<Option<ResourceOutcome>> {
        if !resource.is_due(period) {
            return Ok(None);
        }
        let Some(owner) = resource.owner_account_id else {
            return Ok(None);
        };
        let balance = bank
            .accounts
            .get(&owner)
            .map(|a| a.balance)
            .ok_or_else(|| AppError::AccountNotFound(owner.to_string()))?;

        let decision = RecurringDecision::decide(resource.monthly_cost, balance, suspend_insufficient);
        let mut outcome = ResourceOutcome {
            resource_id: resource.id,
            number: resource.number.clone(),
            owner_account_id: owner,
            amount: resource.monthly_cost,
            decision,
            balance_before: balance,
            balance_after: balance,
            transaction_id: None,
        };

        if decision != RecurringDecision::Suspend && resource.monthly_cost > Decimal::ZERO {
            let charge = bank.charge(&ChargeRequest::debit(
                owner,
                resource.monthly_cost,
                format!("Monthly charge for {} ({})", resource.number, period),
                ReferenceType::RecurringCharge,
                resource.id.to_string(),
                resource.charge_key(period),
            ))?;
            outcome.balance_before = charge.balance_before;
            outcome.balance_after = charge.balance_after;
            outcome.transaction_id = Some(charge.transaction_id);
        }

        let now = Utc::now();
        let reason = (decision == RecurringDecision::Suspend).then(|| {
            format!(
                "Insufficient balance: required {}, available {}",
                outcome.amount, outcome.balance_before
            )
        });
        resource.billing_history.append(HistoryEntry {
            period,
            amount: resource.monthly_cost,
            status: decision.history_status(),
            transaction_id: outcome.transaction_id,
            reason: reason.clone(),
            recorded_at: now,
        });
        match decision {
            RecurringDecision::Suspend => {
                resource.status = ResourceStatus::Suspended;
                resource.suspended_at = Some(now);
                resource.suspension_reason = reason;
            }
            RecurringDecision::Charge | RecurringDecision::ChargeOverdue => {
                resource.expires_at = Some(period.end());
            }
        }
        resource.updated_at = now;

        Ok(Some(outcome))
    }
}

#[async_trait]
impl ResourceRepository for MemoryResources {
    async fn find_due(
        &self,
        period: BillingPeriod,
        after_id: i64,
        limit: usize,
    ) -> AppResult<Vec<BillableResource>> {
        Ok(self
            .resources
            .lock()
            .range(after_id + 1..)
            .map(|(_, r)| r)
            .filter(|r| r.is_due(period))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn bill_chunk(
        &self,
        period: BillingPeriod,
        resource_ids: &[i64],
        suspend_insufficient: bool,
    ) -> AppResult<Vec<ResourceOutcome>> {
        let fail_on = *self.fail_on.lock();
        let mut resources = self.resources.lock();
        let mut bank = self.bank.state.lock();
        let resources_before = resources.clone();
        let bank_before = bank.clone();

        let mut outcomes = Vec::with_capacity(resource_ids.len());
        for &id in resource_ids {
            let step = if fail_on == Some(id) {
                Err(AppError::Database(format!("injected failure at resource {}", id)))
            } else {
                match resources.get_mut(&id) {
                    Some(resource) => Self::bill_one(&mut bank, resource, period, suspend_insufficient),
                    None => Ok(None),
                }
            };

            match step {
                Ok(Some(outcome)) => outcomes.push(outcome),
                Ok(None) => {}
                Err(e) => {
                    *resources = resources_before;
                    *bank = bank_before;
                    return Err(e);
                }
            }
        }

        Ok(outcomes)
    }
}

// ==================== Settings ====================

#[derive(Default)]
pub struct MemorySettings {
    values: Mutex<HashMap<String, Setting>>,
}

impl MemorySettings {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SettingsStore for MemorySettings {
    async fn get(&self, key: &str) -> AppResult<Option<Setting>> {
        Ok(self.values.lock().get(key).cloned())
    }

    async fn put(&self, key: &str, value: serde_json::Value) -> AppResult<()> {
        self.values.lock().insert(
            key.to_string(),
            Setting {
                key: key.to_string(),
                value,
                updated_at: Utc::now(),
            },
        );
        Ok(())
    }
}

// ==================== Cache ====================

/// JSON cache without expiry
#[derive(Default)]
pub struct MemoryCache {
    values: Mutex<HashMap<String, String>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CacheService for MemoryCache {
    async fn get<T: DeserializeOwned>(&self, key: &str) -> AppResult<Option<T>> {
        let json = self.values.lock().get(key).cloned();
        json.map(|j| serde_json::from_str(&j).map_err(AppError::from))
            .transpose()
    }

    async fn set<T: Serialize + Send + Sync>(
        &self,
        key: &str,
        value: &T,
        _ttl_secs: u64,
    ) -> AppResult<()> {
        let json = serde_json::to_string(value)?;
        self.values.lock().insert(key.to_string(), json);
        Ok(())
    }

    async fn delete(&self, key: &str) -> AppResult<bool> {
        Ok(self.values.lock().remove(key).is_some())
    }
}

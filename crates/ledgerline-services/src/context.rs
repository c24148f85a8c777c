//! Dependencies shared by the billing jobs

use ledgerline_core::traits::{
    AccountRepository, CallRecordRepository, Ledger, LockStore, Notifier, RatingService,
    ResourceRepository, SettingsStore, TelephonyProvider,
};
use std::sync::Arc;

/// Stores and collaborators, each behind its narrow trait
///
/// Cloning is cheap; every field is reference counted.
#[derive(Clone)]
pub struct BillingContext {
    pub accounts: Arc<dyn AccountRepository>,
    pub ledger: Arc<dyn Ledger>,
    pub calls: Arc<dyn CallRecordRepository>,
    pub rating: Arc<dyn RatingService>,
    pub resources: Arc<dyn ResourceRepository>,
    pub settings: Arc<dyn SettingsStore>,
    pub locks: Arc<dyn LockStore>,
    pub telephony: Arc<dyn TelephonyProvider>,
    pub notifier: Arc<dyn Notifier>,
}

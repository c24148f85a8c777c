//! Account model
//!
//! Represents the payer behind calls and provisioned numbers. Accounts
//! are either prepaid (balance may never be driven negative by the
//! billing jobs) or postpaid (balance may go negative and is flagged
//! overdue instead).

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Account type enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AccountType {
    /// Prepaid account - must have positive balance
    #[default]
    Prepaid,
    /// Postpaid account - can use credit up to limit
    Postpaid,
}

impl fmt::Display for AccountType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AccountType::Prepaid => write!(f, "prepaid"),
            AccountType::Postpaid => write!(f, "postpaid"),
        }
    }
}

impl AccountType {
    /// Parse from string (case-insensitive)
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "prepaid" => Some(AccountType::Prepaid),
            "postpaid" => Some(AccountType::Postpaid),
            _ => None,
        }
    }
}

/// Account entity
///
/// `balance` is a cache of the signed sum of the account's ledger
/// transactions; it is only ever mutated through the ledger's atomic
/// charge operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    /// Unique identifier
    pub id: i32,

    /// Account number (unique identifier for external systems)
    pub account_number: String,

    /// Customer name
    pub account_name: Option<String>,

    /// Associated phone number for ANI matching
    pub customer_phone: Option<String>,

    /// Account billing type
    pub account_type: AccountType,

    /// Current balance (positive for prepaid, can be negative for postpaid)
    pub balance: Decimal,

    /// Credit limit for postpaid accounts
    pub credit_limit: Decimal,

    /// Currency code (ISO 4217)
    pub currency: String,

    /// Whether the monitor may hang up this account's calls once the
    /// balance is exhausted
    pub auto_terminate: bool,

    /// Creation timestamp
    pub created_at: DateTime<Utc>,

    /// Last update timestamp
    pub updated_at: DateTime<Utc>,
}

impl Account {
    #[inline]
    pub fn is_prepaid(&self) -> bool {
        self.account_type == AccountType::Prepaid
    }

    /// Get available balance
    ///
    /// For prepaid: current balance
    /// For postpaid: balance + credit_limit
    #[inline]
    pub fn available_balance(&self) -> Decimal {
        match self.account_type {
            AccountType::Prepaid => self.balance,
            AccountType::Postpaid => self.balance + self.credit_limit,
        }
    }

    /// Amount that can be debited right now without breaking the
    /// account's negative-balance policy
    ///
    /// Prepaid accounts are capped at their positive balance; postpaid
    /// accounts are never capped.
    pub fn collectable(&self, amount: Decimal) -> Decimal {
        if self.is_prepaid() {
            amount.min(self.balance.max(Decimal::ZERO))
        } else {
            amount
        }
    }

    /// Whether the monitor is allowed to terminate this account's calls
    pub fn may_auto_terminate(&self, exempt_postpaid: bool) -> bool {
        if !self.auto_terminate {
            return false;
        }
        !(exempt_postpaid && self.account_type == AccountType::Postpaid)
    }

    /// Normalize phone number for matching
    pub fn normalize_phone(phone: &str) -> String {
        phone.chars().filter(|c| c.is_ascii_digit()).collect()
    }
}

impl Default for Account {
    fn default() -> Self {
        Self {
            id: 0,
            account_number: String::new(),
            account_name: None,
            customer_phone: None,
            account_type: AccountType::Prepaid,
            balance: Decimal::ZERO,
            credit_limit: Decimal::ZERO,
            currency: "USD".to_string(),
            auto_terminate: true,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }
}

//! Balance ledger models
//!
//! A `BalanceTransaction` is an immutable ledger entry. The only way to
//! create one is a [`ChargeRequest`] passed to the ledger's atomic charge
//! operation, which appends the entry and moves the cached account balance
//! in the same unit of work.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::AppError;

/// Direction of a ledger entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Reduces the balance
    Debit,
    /// Increases the balance
    Credit,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Debit => write!(f, "debit"),
            Direction::Credit => write!(f, "credit"),
        }
    }
}

impl Direction {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "debit" => Some(Direction::Debit),
            "credit" => Some(Direction::Credit),
            _ => None,
        }
    }

    /// Apply an unsigned amount to a balance
    #[inline]
    pub fn apply(&self, balance: Decimal, amount: Decimal) -> Decimal {
        match self {
            Direction::Debit => balance - amount,
            Direction::Credit => balance + amount,
        }
    }
}

/// What a ledger entry was booked for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReferenceType {
    /// Final settlement of a call from its CDR
    CallRecord,
    /// Incremental charge by the real-time monitor
    CallIncrement,
    /// Monthly charge for a billable resource
    RecurringCharge,
    /// Manual adjustment
    Adjustment,
    /// Balance an account was provisioned with
    OpeningBalance,
}

impl fmt::Display for ReferenceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReferenceType::CallRecord => write!(f, "call_record"),
            ReferenceType::CallIncrement => write!(f, "call_increment"),
            ReferenceType::RecurringCharge => write!(f, "recurring_charge"),
            ReferenceType::Adjustment => write!(f, "adjustment"),
            ReferenceType::OpeningBalance => write!(f, "opening_balance"),
        }
    }
}

impl ReferenceType {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "call_record" => Some(ReferenceType::CallRecord),
            "call_increment" => Some(ReferenceType::CallIncrement),
            "recurring_charge" => Some(ReferenceType::RecurringCharge),
            "adjustment" => Some(ReferenceType::Adjustment),
            "opening_balance" => Some(ReferenceType::OpeningBalance),
            _ => None,
        }
    }
}

/// Immutable ledger entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BalanceTransaction {
    /// Unique identifier, increasing in creation order
    pub id: i64,

    /// Associated account ID
    pub account_id: i32,

    /// Unsigned amount
    pub amount: Decimal,

    /// Debit or credit
    pub direction: Direction,

    /// Balance before transaction
    pub balance_before: Decimal,

    /// Balance after transaction
    pub balance_after: Decimal,

    /// Reason/description
    pub reason: String,

    /// Kind of originating entity
    pub reference_type: ReferenceType,

    /// Identifier of the originating entity (call id, resource id)
    pub reference_id: String,

    /// De-duplication key; unique across the ledger
    pub idempotency_key: String,

    /// Creation timestamp
    pub created_at: DateTime<Utc>,
}

impl BalanceTransaction {
    /// Build the entry a charge request produces against `balance_before`
    pub fn from_request(id: i64, request: &ChargeRequest, balance_before: Decimal) -> Self {
        Self {
            id,
            account_id: request.account_id,
            amount: request.amount,
            direction: request.direction,
            balance_before,
            balance_after: request.direction.apply(balance_before, request.amount),
            reason: request.reason.clone(),
            reference_type: request.reference_type,
            reference_id: request.reference_id.clone(),
            idempotency_key: request.idempotency_key.clone(),
            created_at: Utc::now(),
        }
    }

    /// Amount with the sign it has on the balance
    #[inline]
    pub fn signed_amount(&self) -> Decimal {
        match self.direction {
            Direction::Debit => -self.amount,
            Direction::Credit => self.amount,
        }
    }

    pub fn is_debit(&self) -> bool {
        self.direction == Direction::Debit
    }
}

/// Request to move an account balance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChargeRequest {
    pub account_id: i32,
    /// Unsigned amount; must be positive
    pub amount: Decimal,
    pub direction: Direction,
    pub reason: String,
    pub reference_type: ReferenceType,
    pub reference_id: String,
    pub idempotency_key: String,
}

impl ChargeRequest {
    pub fn debit(
        account_id: i32,
        amount: Decimal,
        reason: impl Into<String>,
        reference_type: ReferenceType,
        reference_id: impl Into<String>,
        idempotency_key: impl Into<String>,
    ) -> Self {
        Self {
            account_id,
            amount,
            direction: Direction::Debit,
            reason: reason.into(),
            reference_type,
            reference_id: reference_id.into(),
            idempotency_key: idempotency_key.into(),
        }
    }

    pub fn credit(
        account_id: i32,
        amount: Decimal,
        reason: impl Into<String>,
        reference_type: ReferenceType,
        reference_id: impl Into<String>,
        idempotency_key: impl Into<String>,
    ) -> Self {
        Self {
            direction: Direction::Credit,
            ..Self::debit(
                account_id,
                amount,
                reason,
                reference_type,
                reference_id,
                idempotency_key,
            )
        }
    }

    /// The first transaction of an account provisioned with `balance`
    ///
    /// Returns `None` for a zero balance.
    pub fn opening(account_id: i32, balance: Decimal) -> Option<Self> {
        Self::settle(
            account_id,
            -balance,
            "Opening balance",
            ReferenceType::OpeningBalance,
            account_id.to_string(),
            format!("opening:{}", account_id),
        )
    }

    /// A signed delta as a debit (positive) or credit (negative)
    ///
    /// Returns `None` for a zero delta.
    pub fn settle(
        account_id: i32,
        delta: Decimal,
        reason: impl Into<String>,
        reference_type: ReferenceType,
        reference_id: impl Into<String>,
        idempotency_key: impl Into<String>,
    ) -> Option<Self> {
        if delta.is_zero() {
            return None;
        }
        let request = Self::debit(
            account_id,
            delta.abs(),
            reason,
            reference_type,
            reference_id,
            idempotency_key,
        );
        Some(if delta.is_sign_negative() {
            Self {
                direction: Direction::Credit,
                ..request
            }
        } else {
            request
        })
    }

    pub fn validate(&self) -> Result<(), AppError> {
        if self.amount <= Decimal::ZERO {
            return Err(AppError::Validation(format!(
                "charge amount must be positive, got {}",
                self.amount
            )));
        }
        if self.idempotency_key.is_empty() {
            return Err(AppError::Validation("missing idempotency key".to_string()));
        }
        Ok(())
    }
}

/// Outcome of an atomic charge
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChargeResult {
    pub success: bool,
    pub balance_before: Decimal,
    pub balance_after: Decimal,
    pub transaction_id: i64,
    /// The idempotency key was already booked; nothing new was written
    pub duplicate: bool,
}

impl ChargeResult {
    pub fn applied(tx: &BalanceTransaction) -> Self {
        Self {
            success: true,
            balance_before: tx.balance_before,
            balance_after: tx.balance_after,
            transaction_id: tx.id,
            duplicate: false,
        }
    }

    pub fn duplicate_of(tx: &BalanceTransaction) -> Self {
        Self {
            duplicate: true,
            ..Self::applied(tx)
        }
    }

    /// Unsigned amount the transaction moved the balance by
    pub fn amount(&self) -> Decimal {
        (self.balance_after - self.balance_before).abs()
    }
}

/// A place where an account's ledger does not add up
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LedgerDiscrepancy {
    /// `balance_after` is not `balance_before` moved by `amount`
    BadArithmetic { transaction_id: i64 },
    /// A transaction does not start where the previous one ended
    BrokenChain {
        transaction_id: i64,
        expected_before: Decimal,
        actual_before: Decimal,
    },
    /// The cached balance differs from the end of the chain
    BalanceDrift { cached: Decimal, computed: Decimal },
}

impl fmt::Display for LedgerDiscrepancy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LedgerDiscrepancy::BadArithmetic { transaction_id } => {
                write!(f, "transaction {} does not add up", transaction_id)
            }
            LedgerDiscrepancy::BrokenChain {
                transaction_id,
                expected_before,
                actual_before,
            } => write!(
                f,
                "transaction {} starts at {} but previous ended at {}",
                transaction_id, actual_before, expected_before
            ),
            LedgerDiscrepancy::BalanceDrift { cached, computed } => {
                write!(f, "cached balance {} differs from ledger {}", cached, computed)
            }
        }
    }
}

/// Check an account's transactions (in creation order) against its
/// cached balance
///
/// The chain is anchored at zero: every account starts empty and an
/// opening balance is itself a transaction.
pub fn verify_chain(
    transactions: &[BalanceTransaction],
    cached_balance: Decimal,
) -> Vec<LedgerDiscrepancy> {
    let mut found = Vec::new();
    let mut previous_after = Decimal::ZERO;

    for tx in transactions {
        if tx.direction.apply(tx.balance_before, tx.amount) != tx.balance_after {
            found.push(LedgerDiscrepancy::BadArithmetic {
                transaction_id: tx.id,
            });
        }
        if previous_after != tx.balance_before {
            found.push(LedgerDiscrepancy::BrokenChain {
                transaction_id: tx.id,
                expected_before: previous_after,
                actual_before: tx.balance_before,
            });
        }
        previous_after = tx.balance_after;
    }

    if previous_after != cached_balance {
        found.push(LedgerDiscrepancy::BalanceDrift {
            cached: cached_balance,
            computed: previous_after,
        });
    }

    found
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn request(amount: Decimal, direction: Direction, key: &str) -> ChargeRequest {
        ChargeRequest {
            account_id: 1,
            amount,
            direction,
            reason: "test".to_string(),
            reference_type: ReferenceType::Adjustment,
            reference_id: "t".to_string(),
            idempotency_key: key.to_string(),
        }
    }

    #[test]
    fn test_debit_and_credit_arithmetic() {
        let debit = BalanceTransaction::from_request(
            1,
            &request(dec!(0.15), Direction::Debit, "a"),
            dec!(10.00),
        );
        assert_eq!(debit.balance_after, dec!(9.85));
        assert_eq!(debit.signed_amount(), dec!(-0.15));

        let credit = BalanceTransaction::from_request(
            2,
            &request(dec!(50.00), Direction::Credit, "b"),
            dec!(100.00),
        );
        assert_eq!(credit.balance_after, dec!(150.00));
        assert!(!credit.is_debit());
    }

    #[test]
    fn test_settle_picks_direction() {
        let debit =
            ChargeRequest::settle(1, dec!(0.05), "x", ReferenceType::CallRecord, "c", "k").unwrap();
        assert_eq!(debit.direction, Direction::Debit);
        assert_eq!(debit.amount, dec!(0.05));

        let credit =
            ChargeRequest::settle(1, dec!(-0.05), "x", ReferenceType::CallRecord, "c", "k")
                .unwrap();
        assert_eq!(credit.direction, Direction::Credit);
        assert_eq!(credit.amount, dec!(0.05));

        assert!(ChargeRequest::settle(1, dec!(0), "x", ReferenceType::CallRecord, "c", "k").is_none());
    }

    #[test]
    fn test_validate_rejects_non_positive() {
        assert!(request(dec!(0), Direction::Debit, "k").validate().is_err());
        assert!(request(dec!(-1), Direction::Debit, "k").validate().is_err());
        assert!(request(dec!(1), Direction::Debit, "").validate().is_err());
        assert!(request(dec!(1), Direction::Debit, "k").validate().is_ok());
    }

    fn opened_with(balance: Decimal) -> BalanceTransaction {
        let request = ChargeRequest::opening(1, balance).unwrap();
        BalanceTransaction::from_request(1, &request, Decimal::ZERO)
    }

    #[test]
    fn test_opening_balance_direction() {
        let positive = ChargeRequest::opening(7, dec!(10.00)).unwrap();
        assert_eq!(positive.direction, Direction::Credit);
        assert_eq!(positive.idempotency_key, "opening:7");

        let negative = ChargeRequest::opening(7, dec!(-2.00)).unwrap();
        assert_eq!(negative.direction, Direction::Debit);
        assert_eq!(negative.amount, dec!(2.00));

        assert!(ChargeRequest::opening(7, Decimal::ZERO).is_none());
    }

    #[test]
    fn test_verify_chain_consistent() {
        let opening = opened_with(dec!(10.00));
        let first = BalanceTransaction::from_request(
            2,
            &request(dec!(1.00), Direction::Debit, "a"),
            opening.balance_after,
        );
        let second = BalanceTransaction::from_request(
            3,
            &request(dec!(0.50), Direction::Credit, "b"),
            first.balance_after,
        );

        assert!(verify_chain(&[opening, first, second], dec!(9.50)).is_empty());
        assert!(verify_chain(&[], Decimal::ZERO).is_empty());
    }

    #[test]
    fn test_verify_chain_anchored_at_zero() {
        // A balance nothing in the ledger accounts for
        assert_eq!(
            verify_chain(&[], dec!(500.00)),
            vec![LedgerDiscrepancy::BalanceDrift {
                cached: dec!(500.00),
                computed: Decimal::ZERO,
            }]
        );

        // A chain that starts mid-air
        let orphan = BalanceTransaction::from_request(
            1,
            &request(dec!(1.00), Direction::Debit, "a"),
            dec!(10.00),
        );
        let found = verify_chain(&[orphan], dec!(9.00));
        assert_eq!(
            found,
            vec![LedgerDiscrepancy::BrokenChain {
                transaction_id: 1,
                expected_before: Decimal::ZERO,
                actual_before: dec!(10.00),
            }]
        );
    }

    #[test]
    fn test_verify_chain_detects_breaks() {
        let opening = opened_with(dec!(10.00));
        let first = BalanceTransaction::from_request(
            2,
            &request(dec!(1.00), Direction::Debit, "a"),
            opening.balance_after,
        );
        let mut second = BalanceTransaction::from_request(
            3,
            &request(dec!(1.00), Direction::Debit, "b"),
            dec!(8.00),
        );
        second.balance_after = dec!(6.00);

        let found = verify_chain(&[opening, first, second], dec!(5.00));
        assert_eq!(found.len(), 3);
        assert!(matches!(found[0], LedgerDiscrepancy::BadArithmetic { transaction_id: 3 }));
        assert!(matches!(found[1], LedgerDiscrepancy::BrokenChain { .. }));
        assert!(matches!(found[2], LedgerDiscrepancy::BalanceDrift { .. }));
    }
}

//! Ledger audit against in-memory stores

mod common;

use common::{prepaid, Harness};
use ledgerline_core::{
    models::{ChargeRequest, LedgerDiscrepancy, ReferenceType, Severity},
    traits::{Ledger, SettingsStore},
};
use ledgerline_services::{watermarks, LedgerAuditor};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::time::Duration;

async fn charge(harness: &Harness, account: i32, key: &str) {
    harness
        .bank
        .charge_account(&ChargeRequest::debit(
            account,
            dec!(1.25),
            "test charge",
            ReferenceType::Adjustment,
            key,
            key,
        ))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_consistent_ledger_passes() {
    let harness = Harness::new(
        vec![prepaid(1, "5551000", dec!(10.00)), prepaid(2, "5552000", dec!(4.00))],
        vec![],
        vec![],
    );
    charge(&harness, 1, "adj:1").await;
    charge(&harness, 1, "adj:2").await;
    charge(&harness, 2, "adj:3").await;

    let summary = LedgerAuditor::new(harness.ctx.clone(), Duration::from_secs(600), false)
        .run()
        .await
        .unwrap();

    assert!(summary.is_consistent());
    assert_eq!(summary.accounts, 2);
    // Two opening balances and three charges
    assert_eq!(summary.transactions, 5);
    assert!(harness.notifier.in_category("ledger.inconsistency").is_empty());
    assert!(harness
        .settings
        .get(watermarks::LAST_LEDGER_AUDIT_AT)
        .await
        .unwrap()
        .is_some());
}

#[tokio::test]
async fn test_drift_is_reported_not_corrected() {
    let harness = Harness::new(vec![prepaid(1, "5551000", dec!(10.00))], vec![], vec![]);
    charge(&harness, 1, "adj:1").await;
    harness.bank.overwrite_balance(1, dec!(50.00));

    let summary = LedgerAuditor::new(harness.ctx.clone(), Duration::from_secs(600), false)
        .run()
        .await
        .unwrap();

    assert!(!summary.is_consistent());
    assert_eq!(
        summary.findings[0].discrepancies,
        vec![LedgerDiscrepancy::BalanceDrift {
            cached: dec!(50.00),
            computed: dec!(8.75),
        }]
    );

    let alerts = harness.notifier.in_category("ledger.inconsistency");
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].severity, Severity::Critical);
    assert_eq!(harness.bank.balance(1), Some(dec!(50.00)));
}

#[tokio::test]
async fn test_balance_without_history_is_drift() {
    let harness = Harness::new(vec![prepaid(1, "5551000", Decimal::ZERO)], vec![], vec![]);
    harness.bank.overwrite_balance(1, dec!(500.00));

    let summary = LedgerAuditor::new(harness.ctx.clone(), Duration::from_secs(600), false)
        .run()
        .await
        .unwrap();

    assert_eq!(summary.transactions, 0);
    assert!(!summary.is_consistent());
    assert_eq!(
        summary.findings[0].discrepancies,
        vec![LedgerDiscrepancy::BalanceDrift {
            cached: dec!(500.00),
            computed: Decimal::ZERO,
        }]
    );
}

//! CDR pipeline against in-memory stores

mod common;

use chrono::Utc;
use common::{answered_cdr, prepaid, rate, Harness};
use ledgerline_cache::keys::lock_key;
use ledgerline_core::{
    config::CdrConfig,
    models::{
        BillingEvent, BillingStatus, CallRecord, CdrCursor, ChargeRequest, LockHolder,
        ReferenceType, Severity,
    },
    traits::{CallRecordRepository, Ledger, LockStore, SettingsStore},
    AppError,
};
use ledgerline_services::{jobs, watermarks, CdrOptions, CdrProcessor};
use rust_decimal_macros::dec;
use std::time::Duration;

fn options() -> CdrOptions {
    CdrOptions {
        batch_pause: Duration::ZERO,
        ..CdrOptions::from(&CdrConfig::default())
    }
}

fn eager_retries() -> CdrOptions {
    CdrOptions {
        retry_cooldown: chrono::Duration::zero(),
        ..options()
    }
}

fn destination(n: usize) -> String {
    format!("51900{:04}", n)
}

fn fifty_calls() -> Harness {
    calls(50)
}

fn calls(count: usize) -> Harness {
    let harness = Harness::new(
        vec![prepaid(1, "5551000", dec!(100.00))],
        vec![rate("519", dec!(0.06), 60)],
        vec![],
    );
    for n in 1..=count {
        harness
            .telephony
            .push_cdr(answered_cdr(&format!("call-{}", n), "5551000", &destination(n), 60));
    }
    harness
}

#[tokio::test]
async fn test_one_failing_record_does_not_stop_the_batch() {
    let harness = fifty_calls();
    harness.rates.fail_for(&destination(23));

    let summary = CdrProcessor::new(harness.ctx.clone(), options())
        .run()
        .await
        .unwrap();

    assert_eq!(summary.new_records.completed, 49);
    assert_eq!(summary.new_records.failed, 1);
    assert!(!summary.exceeds_failure_threshold(50));

    let failed = harness.calls.get("call-23").unwrap();
    assert_eq!(failed.billing_status, BillingStatus::Failed);
    assert_eq!(failed.retry_count, 1);
    assert!(failed.billing_details.last_error.is_some());

    for n in (1..=50).filter(|n| *n != 23) {
        let record = harness.calls.get(&format!("call-{}", n)).unwrap();
        assert_eq!(record.billing_status, BillingStatus::Completed, "call-{}", n);
        assert_eq!(record.cost, Some(dec!(0.06)));
    }

    assert_eq!(harness.bank.balance(1), Some(dec!(97.06)));
    assert_eq!(harness.bank.charges().len(), 49);
}

#[tokio::test]
async fn test_reingesting_never_charges_twice() {
    let harness = fifty_calls();
    harness.rates.fail_for(&destination(23));
    let processor = CdrProcessor::new(harness.ctx.clone(), eager_retries());

    processor.run().await.unwrap();
    harness.rates.heal();
    tokio::time::sleep(Duration::from_millis(5)).await;
    let second = processor.run().await.unwrap();

    // The same 50 CDRs are fetched again; only the failed one is retried
    assert_eq!(second.new_records.skipped, 50);
    assert_eq!(second.retries.completed, 1);

    let retried = harness.calls.get("call-23").unwrap();
    assert_eq!(retried.billing_status, BillingStatus::Completed);
    assert_eq!(retried.retry_count, 1);

    assert_eq!(harness.bank.charges().len(), 50);
    assert_eq!(harness.bank.balance(1), Some(dec!(97.00)));
}

#[tokio::test]
async fn test_retry_count_grows_until_permanent() {
    let harness = Harness::new(vec![prepaid(1, "5551000", dec!(10.00))], vec![], vec![]);
    harness
        .telephony
        .push_cdr(answered_cdr("no-rate", "5551000", "4420700000", 30));
    let processor = CdrProcessor::new(harness.ctx.clone(), eager_retries());

    let mut seen = Vec::new();
    for _ in 0..4 {
        processor.run().await.unwrap();
        seen.push(harness.calls.get("no-rate").unwrap().retry_count);
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    assert_eq!(seen, vec![1, 2, 3, 3]);
    let record = harness.calls.get("no-rate").unwrap();
    assert_eq!(record.billing_status, BillingStatus::PermanentlyFailed);
    assert_eq!(record.billing_details.attempts.len(), 3);

    let alerts = harness.notifier.in_category("cdr.permanently_failed");
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].severity, Severity::Critical);
    assert!(harness.bank.charges().is_empty());
}

#[tokio::test]
async fn test_unanswered_calls_need_no_billing() {
    let harness = Harness::new(
        vec![prepaid(1, "5551000", dec!(10.00))],
        vec![rate("51", dec!(0.05), 60)],
        vec![],
    );
    let mut busy = answered_cdr("busy-1", "5551000", "5114000000", 0);
    busy.answer_time = None;
    busy.disposition = "USER_BUSY".to_string();
    harness.telephony.push_cdr(busy);

    let summary = CdrProcessor::new(harness.ctx.clone(), options())
        .run()
        .await
        .unwrap();

    assert_eq!(summary.new_records.no_billing_required, 1);
    let record = harness.calls.get("busy-1").unwrap();
    assert_eq!(record.billing_status, BillingStatus::NoBillingRequired);
    assert!(harness.bank.charges().is_empty());
}

#[tokio::test]
async fn test_malformed_cdr_is_permanently_failed() {
    let harness = Harness::new(
        vec![prepaid(1, "5551000", dec!(10.00))],
        vec![rate("51", dec!(0.05), 60)],
        vec![],
    );
    let mut broken = answered_cdr("broken-1", "5551000", "5114000000", 30);
    broken.duration = -4;
    broken.billsec = Some(-4);
    harness.telephony.push_cdr(broken);

    let summary = CdrProcessor::new(harness.ctx.clone(), options())
        .run()
        .await
        .unwrap();

    assert_eq!(summary.new_records.permanently_failed, 1);
    let record = harness.calls.get("broken-1").unwrap();
    assert_eq!(record.billing_status, BillingStatus::PermanentlyFailed);
    assert_eq!(harness.notifier.in_category("cdr.permanently_failed").len(), 1);
}

#[tokio::test]
async fn test_dry_run_writes_nothing() {
    let harness = fifty_calls();
    let summary = CdrProcessor::new(
        harness.ctx.clone(),
        CdrOptions {
            dry_run: true,
            ..options()
        },
    )
    .run()
    .await
    .unwrap();

    assert!(summary.dry_run);
    assert_eq!(summary.new_records.completed, 50);
    assert!(harness.calls.all().is_empty());
    assert!(harness.bank.charges().is_empty());
    assert_eq!(harness.bank.balance(1), Some(dec!(100.00)));
}

#[tokio::test]
async fn test_lock_contention_fails_the_run() {
    let harness = fifty_calls();
    let other = LockHolder::for_command(jobs::PROCESS_CDRS);
    assert!(harness
        .locks
        .acquire(&lock_key(jobs::PROCESS_CDRS), Duration::from_secs(3600), &other, false)
        .await
        .unwrap());

    let blocked = CdrProcessor::new(harness.ctx.clone(), options()).run().await;
    assert!(matches!(blocked, Err(AppError::LockContention(_))));
    assert!(harness.calls.all().is_empty());

    let forced = CdrProcessor::new(
        harness.ctx.clone(),
        CdrOptions {
            force: true,
            ..options()
        },
    )
    .run()
    .await
    .unwrap();
    assert_eq!(forced.new_records.completed, 50);
}

async fn stored_cursor(harness: &Harness) -> Option<CdrCursor> {
    harness
        .settings
        .get(watermarks::LAST_CDR_CURSOR)
        .await
        .unwrap()
        .map(|s| serde_json::from_value(s.value).unwrap())
}

#[tokio::test]
async fn test_burst_larger_than_a_page_is_drained_in_one_run() {
    let harness = calls(150);

    let summary = CdrProcessor::new(harness.ctx.clone(), options())
        .run()
        .await
        .unwrap();

    // Two pages of 100 and 50, three batches of 50
    assert_eq!(summary.new_records.selected, 150);
    assert_eq!(summary.new_records.batches, 3);
    assert_eq!(summary.new_records.completed, 150);
    assert_eq!(harness.bank.charges().len(), 150);

    let fetches = harness.telephony.fetches();
    assert_eq!(fetches.len(), 2);
    assert!(fetches[0].is_none());
    assert!(fetches[1].is_some());
    assert!(stored_cursor(&harness).await.is_some());
}

#[tokio::test]
async fn test_exhausted_budget_finishes_the_batch_and_resumes_from_the_cursor() {
    let harness = calls(150);

    // The budget runs out during the pause before the second batch: that
    // batch still completes, the third never starts
    let short = CdrProcessor::new(
        harness.ctx.clone(),
        CdrOptions {
            timeout: Duration::from_millis(200),
            batch_pause: Duration::from_millis(300),
            ..options()
        },
    )
    .run()
    .await
    .unwrap();
    assert!(short.budget_exhausted);
    assert_eq!(short.new_records.batches, 2);
    assert_eq!(short.new_records.completed, 100);
    assert_eq!(short.backlog, Default::default());

    let cursor = stored_cursor(&harness).await.unwrap();
    assert_eq!(harness.calls.all().len(), 100);
    assert!(harness.calls.get(&cursor.call_id).is_some());

    // Even with a window that no longer reaches those CDRs, the next run
    // picks up after the cursor
    let resumed = CdrProcessor::new(
        harness.ctx.clone(),
        CdrOptions {
            window: chrono::Duration::seconds(30),
            ..options()
        },
    )
    .run()
    .await
    .unwrap();
    assert_eq!(resumed.new_records.completed, 50);
    assert_eq!(resumed.new_records.skipped, 0);
    assert_eq!(harness.telephony.fetches().last().unwrap().as_ref(), Some(&cursor));
    assert_eq!(harness.bank.charges().len(), 150);
    assert_eq!(harness.bank.balance(1), Some(dec!(91.00)));
}

#[tokio::test]
async fn test_stale_processing_record_is_recovered_without_a_second_charge() {
    let harness = Harness::new(
        vec![prepaid(1, "5551000", dec!(10.00))],
        vec![rate("51", dec!(0.05), 60)],
        vec![],
    );
    let crashed = answered_cdr("crashed-1", "5551000", "5114000000", 90);
    let fresh = answered_cdr("fresh-1", "5551000", "5114000000", 90);

    // A run charged both calls and died before marking them completed
    for cdr in [&crashed, &fresh] {
        let mut record = harness
            .calls
            .insert(&CallRecord::from_raw_cdr(cdr))
            .await
            .unwrap()
            .unwrap();
        record.apply(BillingEvent::Claim).unwrap();
        harness.calls.save(&record).await.unwrap();
        harness
            .bank
            .charge_account(&ChargeRequest::debit(
                1,
                dec!(0.10),
                "call",
                ReferenceType::CallRecord,
                &record.call_id,
                record.settlement_key(),
            ))
            .await
            .unwrap();
    }
    harness.calls.update_with("crashed-1", |r| {
        r.updated_at = Utc::now() - chrono::Duration::hours(2);
    });
    harness.telephony.push_cdr(crashed);
    harness.telephony.push_cdr(fresh);

    let summary = CdrProcessor::new(harness.ctx.clone(), options())
        .run()
        .await
        .unwrap();

    // The CDRs themselves are skipped; the backlog reclaims only the stale one
    assert_eq!(summary.new_records.skipped, 2);
    assert_eq!(summary.backlog.completed, 1);

    let recovered = harness.calls.get("crashed-1").unwrap();
    assert_eq!(recovered.billing_status, BillingStatus::Completed);
    assert_eq!(recovered.charged_amount, dec!(0.10));
    assert_eq!(
        harness.calls.get("fresh-1").unwrap().billing_status,
        BillingStatus::Processing
    );

    assert_eq!(harness.bank.charges().len(), 2);
    assert_eq!(harness.bank.balance(1), Some(dec!(9.80)));
}

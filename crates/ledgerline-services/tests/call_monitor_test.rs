//! Real-time monitor against scripted calls

mod common;

use chrono::Utc;
use common::{answered_cdr, live_call, postpaid, prepaid, rate, FlakyCalls, Harness};
use ledgerline_core::{
    config::{CdrConfig, MonitorConfig},
    models::{BillingStatus, CallStatus, Direction},
    traits::CallRecordRepository,
};
use ledgerline_services::{CallMonitor, CdrOptions, CdrProcessor, MonitorOptions};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::Arc;
use std::time::Duration;

fn options() -> MonitorOptions {
    MonitorOptions::from(&MonitorConfig::default())
}

fn terminating() -> MonitorOptions {
    MonitorOptions {
        terminate: true,
        ..options()
    }
}

fn harness(balance: Decimal) -> Harness {
    Harness::new(
        vec![prepaid(1, "5551000", balance)],
        vec![rate("51", dec!(0.05), 60)],
        vec![],
    )
}

#[tokio::test]
async fn test_first_pass_charges_whole_increments() {
    let harness = harness(dec!(10.00));
    harness
        .telephony
        .set_active(vec![live_call("c-125", "5551000", "5114000000", 125)]);

    let summary = CallMonitor::new(harness.ctx.clone(), options())
        .run()
        .await
        .unwrap();

    assert_eq!(summary.discovered, 1);
    assert_eq!(summary.monitored, 1);
    assert_eq!(summary.charged, dec!(0.15));
    assert_eq!(summary.at_risk, 0);

    let balance = harness.bank.balance(1).unwrap();
    assert!(balance >= dec!(9.85));
    assert_eq!(balance, dec!(9.85));

    let record = harness.calls.get("c-125").unwrap();
    assert_eq!(record.call_status, CallStatus::Connected);
    assert_eq!(record.billing_status, BillingStatus::Pending);
    assert_eq!(record.account_id, Some(1));
    assert_eq!(record.charged_amount, dec!(0.15));
    assert_eq!(record.charged_seconds, 180);

    let txs = harness.bank.charges();
    assert_eq!(txs.len(), 1);
    // Keyed on the charge point the increment starts from
    assert_eq!(txs[0].idempotency_key, "call:c-125:0");
}

#[tokio::test]
async fn test_second_pass_in_same_increment_charges_nothing() {
    let harness = harness(dec!(10.00));
    harness
        .telephony
        .set_active(vec![live_call("c-1", "5551000", "5114000000", 30)]);
    let monitor = CallMonitor::new(harness.ctx.clone(), options());

    monitor.run().await.unwrap();
    let again = monitor.run().await.unwrap();

    assert_eq!(again.discovered, 0);
    assert_eq!(again.increments, 0);
    assert_eq!(harness.bank.charges().len(), 1);
    assert_eq!(harness.bank.balance(1), Some(dec!(9.95)));
}

#[tokio::test]
async fn test_final_cdr_credits_monitor_overcharge() {
    let harness = harness(dec!(10.00));
    harness
        .telephony
        .set_active(vec![live_call("c-2", "5551000", "5114000000", 125)]);
    CallMonitor::new(harness.ctx.clone(), options())
        .run()
        .await
        .unwrap();
    assert_eq!(harness.bank.balance(1), Some(dec!(9.85)));

    // The call actually had 100s of talk time: two increments
    harness.telephony.set_active(vec![]);
    harness
        .telephony
        .push_cdr(answered_cdr("c-2", "5551000", "5114000000", 100));
    let summary = CdrProcessor::new(
        harness.ctx.clone(),
        CdrOptions {
            batch_pause: Duration::ZERO,
            ..CdrOptions::from(&CdrConfig::default())
        },
    )
    .run()
    .await
    .unwrap();

    assert_eq!(summary.new_records.completed, 1);
    let record = harness.calls.get("c-2").unwrap();
    assert_eq!(record.call_status, CallStatus::Ended);
    assert_eq!(record.billing_status, BillingStatus::Completed);
    assert_eq!(record.charged_amount, dec!(0.10));

    let txs = harness.bank.charges();
    assert_eq!(txs.len(), 2);
    assert_eq!(txs[1].direction, Direction::Credit);
    assert_eq!(txs[1].amount, dec!(0.05));
    assert_eq!(harness.bank.balance(1), Some(dec!(9.90)));
}

#[tokio::test]
async fn test_at_risk_call_reported_but_kept_without_terminate() {
    let harness = harness(dec!(0.10));
    harness
        .telephony
        .set_active(vec![live_call("c-3", "5551000", "5114000000", 300)]);

    let summary = CallMonitor::new(harness.ctx.clone(), options())
        .run()
        .await
        .unwrap();

    assert_eq!(summary.at_risk, 1);
    assert_eq!(summary.terminated, 0);
    assert!(harness.telephony.hung_up().is_empty());

    // Prepaid collection stops at zero; the rest is recorded as shortfall
    assert_eq!(harness.bank.balance(1), Some(Decimal::ZERO));
    let record = harness.calls.get("c-3").unwrap();
    assert_eq!(record.charged_amount, dec!(0.10));
    assert!(record.billing_details.shortfall >= dec!(0.15));
    assert_eq!(harness.notifier.in_category("monitor.shortfall").len(), 1);
    assert_eq!(harness.notifier.in_category("monitor.at_risk").len(), 1);
}

#[tokio::test]
async fn test_at_risk_call_terminated_and_settled() {
    let harness = harness(dec!(0.10));
    harness
        .telephony
        .set_active(vec![live_call("c-4", "5551000", "5114000000", 300)]);

    let summary = CallMonitor::new(harness.ctx.clone(), terminating())
        .run()
        .await
        .unwrap();

    assert_eq!(summary.terminated, 1);
    assert_eq!(harness.telephony.hung_up(), vec!["c-4".to_string()]);

    let record = harness.calls.get("c-4").unwrap();
    assert_eq!(record.call_status, CallStatus::Terminated);
    assert_eq!(record.billing_status, BillingStatus::Completed);
    assert!(record.end_time.is_some());
    assert_eq!(
        record.billing_details.termination_reason.as_deref(),
        Some("insufficient_balance")
    );
    assert_eq!(harness.bank.balance(1), Some(Decimal::ZERO));
    assert_eq!(harness.notifier.in_category("monitor.terminated").len(), 1);
}

#[tokio::test]
async fn test_postpaid_exempt_from_balance_termination() {
    let harness = Harness::new(
        vec![postpaid(1, "5551000", Decimal::ZERO, Decimal::ZERO)],
        vec![rate("51", dec!(0.05), 60)],
        vec![],
    );
    harness
        .telephony
        .set_active(vec![live_call("c-5", "5551000", "5114000000", 300)]);

    let summary = CallMonitor::new(harness.ctx.clone(), terminating())
        .run()
        .await
        .unwrap();

    assert_eq!(summary.at_risk, 1);
    assert_eq!(summary.terminated, 0);
    assert!(harness.telephony.hung_up().is_empty());
    // Postpaid is charged in full and may go negative
    assert_eq!(harness.bank.balance(1), Some(dec!(-0.25)));
}

#[tokio::test]
async fn test_duration_ceiling_ignores_balance() {
    let harness = harness(dec!(1000.00));
    harness
        .telephony
        .set_active(vec![live_call("c-6", "5551000", "5114000000", 4_000)]);

    let summary = CallMonitor::new(
        harness.ctx.clone(),
        MonitorOptions {
            max_duration_secs: 3_600,
            ..terminating()
        },
    )
    .run()
    .await
    .unwrap();

    assert_eq!(summary.at_risk, 0);
    assert_eq!(summary.over_duration, 1);
    assert_eq!(summary.terminated, 1);
    let record = harness.calls.get("c-6").unwrap();
    assert_eq!(
        record.billing_details.termination_reason.as_deref(),
        Some("max_duration")
    );
}

#[tokio::test]
async fn test_refused_hangup_is_retried_next_pass() {
    let harness = harness(dec!(0.10));
    harness
        .telephony
        .set_active(vec![live_call("c-7", "5551000", "5114000000", 300)]);
    harness.telephony.refuse_hangups(true);
    let monitor = CallMonitor::new(harness.ctx.clone(), terminating());

    let first = monitor.run().await.unwrap();
    assert_eq!(first.termination_failures, 1);
    let record = harness.calls.get("c-7").unwrap();
    assert_eq!(record.call_status, CallStatus::Connected);
    assert_eq!(record.billing_details.termination_attempts, 1);
    assert_eq!(record.charged_amount, dec!(0.10));

    harness.telephony.refuse_hangups(false);
    let second = monitor.run().await.unwrap();
    assert_eq!(second.terminated, 1);
    let record = harness.calls.get("c-7").unwrap();
    assert_eq!(record.call_status, CallStatus::Terminated);
    assert_eq!(record.billing_details.termination_attempts, 1);
}

#[tokio::test]
async fn test_dry_run_touches_nothing() {
    let harness = harness(dec!(0.10));
    harness
        .telephony
        .set_active(vec![live_call("c-8", "5551000", "5114000000", 300)]);

    let summary = CallMonitor::new(
        harness.ctx.clone(),
        MonitorOptions {
            dry_run: true,
            ..terminating()
        },
    )
    .run()
    .await
    .unwrap();

    assert_eq!(summary.discovered, 1);
    assert_eq!(summary.at_risk, 1);
    assert_eq!(summary.terminated, 0);
    assert!(harness.calls.all().is_empty());
    assert!(harness.bank.charges().is_empty());
    assert!(harness.telephony.hung_up().is_empty());
    assert_eq!(harness.bank.balance(1), Some(dec!(0.10)));
}

/// Move a tracked call's answer time back, as if `secs` had passed
fn age_call(harness: &Harness, call_id: &str, secs: i64) {
    harness.calls.update_with(call_id, |r| {
        let shift = chrono::Duration::seconds(secs);
        r.start_time -= shift;
        r.answer_time = r.answer_time.map(|t| t - shift);
    });
}

#[tokio::test]
async fn test_unrecorded_increment_is_not_charged_twice() {
    let harness = harness(dec!(10.00));
    let calls = Arc::new(FlakyCalls::new(harness.calls.clone()));
    let mut ctx = harness.ctx.clone();
    ctx.calls = calls.clone();
    harness
        .telephony
        .set_active(vec![live_call("c-9", "5551000", "5114000000", 125)]);
    let monitor = CallMonitor::new(ctx, options());

    // The debit lands but recording it on the call fails
    calls.fail_next_charges(1);
    let first = monitor.run().await.unwrap();
    assert_eq!(first.errors, 1);
    assert_eq!(harness.bank.balance(1), Some(dec!(9.85)));
    assert_eq!(harness.calls.get("c-9").unwrap().charged_amount, Decimal::ZERO);

    // 185s: the booked increment is recognised and recorded, not re-charged
    age_call(&harness, "c-9", 60);
    let second = monitor.run().await.unwrap();
    assert_eq!(second.errors, 0);
    assert_eq!(harness.bank.balance(1), Some(dec!(9.85)));
    assert_eq!(harness.bank.charges().len(), 1);
    let record = harness.calls.get("c-9").unwrap();
    assert_eq!(record.charged_amount, dec!(0.15));
    assert_eq!(record.charged_seconds, 240);

    // 245s: the next increment collects what is still owed
    age_call(&harness, "c-9", 60);
    monitor.run().await.unwrap();
    assert_eq!(harness.bank.balance(1), Some(dec!(9.75)));
    let txs = harness.bank.charges();
    assert_eq!(txs.len(), 2);
    assert_eq!(txs[1].idempotency_key, "call:c-9:240");
    assert_eq!(harness.calls.get("c-9").unwrap().charged_amount, dec!(0.25));
}

#[tokio::test]
async fn test_call_without_cdr_is_closed_and_settled() {
    let harness = harness(dec!(10.00));
    harness
        .telephony
        .set_active(vec![live_call("c-10", "5551000", "5114000000", 30)]);
    CallMonitor::new(harness.ctx.clone(), options())
        .run()
        .await
        .unwrap();
    assert_eq!(harness.bank.balance(1), Some(dec!(9.95)));
    assert!(harness.calls.get("c-10").unwrap().billing_details.last_seen_at.is_some());

    // Last seen 230s into the call, then gone from the switch
    age_call(&harness, "c-10", 200);
    harness.telephony.set_active(vec![]);

    // Within the grace period the call waits for its CDR
    let waiting = CallMonitor::new(harness.ctx.clone(), options())
        .run()
        .await
        .unwrap();
    assert_eq!(waiting.closed_without_cdr, 0);
    assert_eq!(harness.calls.get("c-10").unwrap().call_status, CallStatus::Connected);

    let closing = CallMonitor::new(
        harness.ctx.clone(),
        MonitorOptions {
            cdr_grace: chrono::Duration::zero(),
            ..options()
        },
    )
    .run()
    .await
    .unwrap();
    assert_eq!(closing.closed_without_cdr, 1);
    assert_eq!(harness.notifier.in_category("monitor.missing_cdr").len(), 1);

    let record = harness.calls.get("c-10").unwrap();
    assert_eq!(record.call_status, CallStatus::Ended);
    assert_eq!(record.billing_status, BillingStatus::Pending);
    assert!(record.billsec > 180 && record.billsec <= 240, "billsec {}", record.billsec);
    assert!(record.end_time.is_some_and(|t| t <= Utc::now()));

    // The backlog phase settles the remainder
    let summary = CdrProcessor::new(
        harness.ctx.clone(),
        CdrOptions {
            batch_pause: Duration::ZERO,
            ..CdrOptions::from(&CdrConfig::default())
        },
    )
    .run()
    .await
    .unwrap();
    assert_eq!(summary.backlog.completed, 1);

    let record = harness.calls.get("c-10").unwrap();
    assert_eq!(record.billing_status, BillingStatus::Completed);
    assert_eq!(record.charged_amount, dec!(0.20));
    assert_eq!(harness.bank.balance(1), Some(dec!(9.80)));
    assert!(harness.calls.find_connected().await.unwrap().is_empty());
}

//! Credit ledger semantics: pool ordering, atomicity, allocation rollover,
//! and debit-trail-aware refunds.

mod helpers;

use assert_matches::assert_matches;
use chrono::{Duration, Utc};
use pretty_assertions::assert_eq;
use uuid::Uuid;

use helpers::{MockBehavior, TestHarness};
use llm_gateway::credits::CreditLedger;
use llm_gateway::storage::UsageStore;
use llm_gateway::domain::{
    CreditBreakdown, DebitEntry, GatewayError, Operation, Provider, Tier, UsageRecord,
};

fn usage_record(user_id: &str) -> UsageRecord {
    UsageRecord {
        id: Uuid::new_v4(),
        user_id: user_id.to_string(),
        model_id: "gpt-4o".to_string(),
        provider: Provider::OpenAI,
        operation: Operation::Chat,
        prompt_tokens: 100,
        completion_tokens: 50,
        total_tokens: 150,
        cache_creation_tokens: None,
        cache_read_tokens: None,
        cached_prompt_tokens: None,
        credits_used: 0,
        vendor_cost: rust_decimal::Decimal::new(75, 5),
        margin_multiplier: rust_decimal::Decimal::new(15, 1),
        gross_margin: rust_decimal::Decimal::ZERO,
        credit_breakdown: CreditBreakdown::default(),
        cache_hit_rate: 0.0,
        cost_savings_percent: 0.0,
        finish_reason: "stop".to_string(),
        debit_trail: vec![],
        executed_at: Utc::now(),
        duration_ms: 100,
    }
}

async fn harness() -> TestHarness {
    TestHarness::new(Provider::OpenAI, MockBehavior::default()).await
}

#[tokio::test]
async fn deduction_drains_subscription_before_purchased() {
    let h = harness().await;
    h.seed_user("u1", Tier::Pro).await;
    h.allocate_subscription("u1", 5).await;
    h.ledger.add_purchased("u1", "pur-1", 10).await.unwrap();

    let outcome = h.ledger.deduct("u1", 8, usage_record("u1")).await.unwrap();

    assert_eq!(outcome.deducted, 8);
    assert_eq!(outcome.subscription_remaining, 0);
    assert_eq!(outcome.purchased_remaining, 7);
    assert_eq!(outcome.remaining, 7);

    // The trail shows both pools in order.
    assert_eq!(outcome.debit_trail.len(), 2);
    assert_matches!(outcome.debit_trail[0], DebitEntry::Subscription { amount: 5, .. });
    assert_matches!(outcome.debit_trail[1], DebitEntry::Purchased { amount: 3, .. });
}

#[tokio::test]
async fn purchased_pools_drain_oldest_first() {
    let h = harness().await;
    h.seed_user("u2", Tier::Pro).await;
    h.ledger.add_purchased("u2", "first", 3).await.unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    h.ledger.add_purchased("u2", "second", 3).await.unwrap();

    let outcome = h.ledger.deduct("u2", 4, usage_record("u2")).await.unwrap();

    assert_eq!(outcome.debit_trail.len(), 2);
    match (&outcome.debit_trail[0], &outcome.debit_trail[1]) {
        (
            DebitEntry::Purchased {
                purchase_id: p1,
                amount: 3,
            },
            DebitEntry::Purchased {
                purchase_id: p2,
                amount: 1,
            },
        ) => {
            assert_eq!(p1, "first");
            assert_eq!(p2, "second");
        }
        other => panic!("unexpected trail {:?}", other),
    }
}

#[tokio::test]
async fn insufficient_credits_writes_nothing() {
    let h = harness().await;
    h.seed_user("u3", Tier::Free).await;
    h.allocate_subscription("u3", 3).await;

    let err = h
        .ledger
        .deduct("u3", 10, usage_record("u3"))
        .await
        .expect_err("should fail");
    assert_matches!(
        err,
        GatewayError::InsufficientCredits {
            required: 10,
            available: 3
        }
    );

    // Balance untouched, no usage row.
    assert_eq!(h.balance("u3").await.total_available, 3);
    let records = h
        .usage
        .list("u3", &llm_gateway::storage::UsageFilter { limit: 10, ..Default::default() })
        .await
        .unwrap();
    assert!(records.is_empty());
}

#[tokio::test]
async fn usage_record_written_in_same_transaction() {
    let h = harness().await;
    h.seed_user("u4", Tier::Pro).await;
    h.allocate_subscription("u4", 10).await;

    let outcome = h.ledger.deduct("u4", 4, usage_record("u4")).await.unwrap();
    assert_eq!(outcome.deducted, 4);

    let records = h
        .usage
        .list("u4", &llm_gateway::storage::UsageFilter { limit: 10, ..Default::default() })
        .await
        .unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].credits_used, 4);
    assert_eq!(records[0].debit_trail.len(), 1);
}

#[tokio::test]
async fn allocation_demotes_previous_pool() {
    let h = harness().await;
    h.seed_user("u5", Tier::Pro).await;
    h.allocate_subscription("u5", 100).await;
    h.ledger.deduct("u5", 30, usage_record("u5")).await.unwrap();
    assert_eq!(h.balance("u5").await.subscription.remaining, 70);

    // New billing period: fresh pool, old one no longer counts.
    h.ledger
        .allocate(
            "u5",
            "sub-2",
            200,
            Utc::now(),
            Utc::now() + Duration::days(30),
        )
        .await
        .unwrap();

    let balance = h.balance("u5").await;
    assert_eq!(balance.subscription.remaining, 200);
    assert_eq!(balance.subscription.total, 200);
    assert_eq!(balance.total_available, 200);
}

#[tokio::test]
async fn expired_subscription_pool_counts_as_zero() {
    let h = harness().await;
    h.seed_user("u6", Tier::Pro).await;
    h.ledger
        .allocate(
            "u6",
            "sub-old",
            100,
            Utc::now() - Duration::days(60),
            Utc::now() - Duration::days(30),
        )
        .await
        .unwrap();
    h.ledger.add_purchased("u6", "pur", 25).await.unwrap();

    let balance = h.balance("u6").await;
    assert_eq!(balance.subscription.remaining, 0);
    assert_eq!(balance.purchased.remaining, 25);
    assert_eq!(balance.total_available, 25);
}

#[tokio::test]
async fn refund_returns_credits_to_original_pools() {
    let h = harness().await;
    h.seed_user("u7", Tier::Pro).await;
    h.allocate_subscription("u7", 5).await;
    h.ledger.add_purchased("u7", "pur-1", 10).await.unwrap();

    let record = usage_record("u7");
    let usage_id = record.id;
    h.ledger.deduct("u7", 8, record).await.unwrap();
    assert_eq!(h.balance("u7").await.total_available, 7);

    let refunded = h.ledger.refund("u7", usage_id).await.unwrap();
    assert_eq!(refunded, 8);

    let balance = h.balance("u7").await;
    assert_eq!(balance.subscription.remaining, 5);
    assert_eq!(balance.purchased.remaining, 10);
}

#[tokio::test]
async fn refund_after_period_rollover_grants_purchased() {
    let h = harness().await;
    h.seed_user("u8", Tier::Pro).await;
    h.allocate_subscription("u8", 10).await;

    let record = usage_record("u8");
    let usage_id = record.id;
    h.ledger.deduct("u8", 4, record).await.unwrap();

    // Period rolls over: the old pool is demoted.
    h.ledger
        .allocate(
            "u8",
            "sub-next",
            10,
            Utc::now(),
            Utc::now() + Duration::days(30),
        )
        .await
        .unwrap();

    let refunded = h.ledger.refund("u8", usage_id).await.unwrap();
    assert_eq!(refunded, 4);

    // The original pool is gone, so the refund lands in purchased credits.
    let balance = h.balance("u8").await;
    assert_eq!(balance.purchased.remaining, 4);
}

#[tokio::test]
async fn concurrent_deductions_never_double_spend() {
    let h = harness().await;
    h.seed_user("u9", Tier::Pro).await;
    h.allocate_subscription("u9", 10).await;

    let ledger = h.ledger.clone();
    let mut handles = Vec::new();
    for _ in 0..4 {
        let ledger = ledger.clone();
        handles.push(tokio::spawn(async move {
            ledger.deduct("u9", 3, usage_record("u9")).await
        }));
    }

    let mut successes = 0;
    for handle in handles {
        if handle.await.unwrap().is_ok() {
            successes += 1;
        }
    }

    // 10 credits cover exactly three 3-credit deductions.
    assert_eq!(successes, 3);
    assert_eq!(h.balance("u9").await.total_available, 1);
}

//! End-to-end pipeline scenarios against the full stack (mock provider,
//! real SQLite ledger, pricing, registry, and rate limiter).

mod helpers;

use assert_matches::assert_matches;
use futures::StreamExt;
use pretty_assertions::assert_eq;
use std::time::Duration;

use helpers::{auth_context, chat_request, MockBehavior, TestHarness};
use llm_gateway::domain::{GatewayError, Provider, Tier};
use llm_gateway::providers::NormalizedUsage;
use llm_gateway::storage::UsageStore;

#[tokio::test]
async fn unary_happy_path_deducts_one_credit() {
    // Pro user, 500 subscription credits, gpt-4o at $2.50/$10 per million,
    // default 1.5 multiplier. 100 prompt + 50 completion tokens => 1 credit.
    let harness = TestHarness::new(Provider::OpenAI, MockBehavior::default()).await;
    harness.seed_user("alice", Tier::Pro).await;
    harness.seed_model("gpt-4o", Provider::OpenAI, Tier::Free).await;
    harness
        .seed_pricing(Provider::OpenAI, "gpt-4o", "0.0025", "0.01", None, None)
        .await;
    harness.allocate_subscription("alice", 500).await;

    let ctx = auth_context("alice", Tier::Pro);
    let response = harness
        .orchestrator
        .chat(&ctx, chat_request("gpt-4o", serde_json::json!({"max_tokens": 100})))
        .await
        .expect("chat should succeed");

    assert_eq!(response.usage.credits.deducted, 1);
    assert_eq!(response.usage.credits.remaining, 499);
    assert_eq!(response.usage.credits.subscription_remaining, 499);
    assert_eq!(response.usage.credits.purchased_remaining, 0);
    assert_eq!(response.usage.prompt_tokens, 100);
    assert_eq!(response.usage.completion_tokens, 50);
    assert_eq!(response.choices[0].message.content, "Hello there!");

    let balance = harness.balance("alice").await;
    assert_eq!(balance.total_available, 499);

    // Exactly one usage record.
    let records = harness
        .usage
        .list("alice", &default_filter())
        .await
        .unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].credits_used, 1);
    assert_eq!(records[0].finish_reason, "stop");
}

#[tokio::test]
async fn cached_anthropic_request_is_cheap_and_recorded() {
    // Second request against a warm ephemeral cache: input=100,
    // cacheRead=2000, output=50 at $3/$15/$0.30 per million.
    let behavior = MockBehavior {
        usage: NormalizedUsage {
            prompt_tokens: 100,
            completion_tokens: 50,
            total_tokens: 150,
            cache_read_input_tokens: Some(2000),
            ..Default::default()
        },
        ..Default::default()
    };
    let harness = TestHarness::new(Provider::Anthropic, behavior).await;
    harness.seed_user("bob", Tier::Pro).await;
    harness
        .seed_model("claude-sonnet-4", Provider::Anthropic, Tier::Free)
        .await;
    harness
        .seed_pricing(
            Provider::Anthropic,
            "claude-sonnet-4",
            "0.003",
            "0.015",
            Some("0.00375"),
            Some("0.0003"),
        )
        .await;
    harness.allocate_subscription("bob", 100).await;

    let ctx = auth_context("bob", Tier::Pro);
    let response = harness
        .orchestrator
        .chat(&ctx, chat_request("claude-sonnet-4", serde_json::json!({})))
        .await
        .expect("chat should succeed");

    assert_eq!(response.usage.credits.deducted, 1);
    assert_eq!(response.usage.cache_read_input_tokens, Some(2000));

    let records = harness.usage.list("bob", &default_filter()).await.unwrap();
    assert_eq!(records.len(), 1);
    assert!(records[0].cost_savings_percent > 70.0);
    assert!(records[0].cache_hit_rate > 0.9);
    assert_eq!(records[0].cache_read_tokens, Some(2000));
}

#[tokio::test]
async fn insufficient_credits_rejects_before_dispatch() {
    let harness = TestHarness::new(Provider::OpenAI, MockBehavior::default()).await;
    harness.seed_user("carol", Tier::Pro).await;
    harness.seed_model("gpt-4o", Provider::OpenAI, Tier::Free).await;
    // $10/$30 per million.
    harness
        .seed_pricing(Provider::OpenAI, "gpt-4o", "0.01", "0.03", None, None)
        .await;
    harness.allocate_subscription("carol", 2).await;

    let ctx = auth_context("carol", Tier::Pro);
    let err = harness
        .orchestrator
        .chat(
            &ctx,
            chat_request("gpt-4o", serde_json::json!({"max_tokens": 1000})),
        )
        .await
        .expect_err("should reject");

    assert_matches!(
        err,
        GatewayError::InsufficientCredits {
            required: 5,
            available: 2
        }
    );

    // Provider never called, balance untouched, no usage recorded.
    assert_eq!(harness.adapter.call_count(), 0);
    assert_eq!(harness.balance("carol").await.total_available, 2);
    let records = harness.usage.list("carol", &default_filter()).await.unwrap();
    assert!(records.is_empty());
}

#[tokio::test]
async fn free_tier_rate_limit_bounds_requests() {
    let harness = TestHarness::new(Provider::OpenAI, MockBehavior::default()).await;
    harness.seed_user("dave", Tier::Free).await;
    harness.seed_model("gpt-4o-mini", Provider::OpenAI, Tier::Free).await;
    harness
        .seed_pricing(Provider::OpenAI, "gpt-4o-mini", "0.00015", "0.0006", None, None)
        .await;
    harness.allocate_subscription("dave", 100).await;

    let ctx = auth_context("dave", Tier::Free);
    for i in 0..10 {
        harness
            .orchestrator
            .chat(&ctx, chat_request("gpt-4o-mini", serde_json::json!({})))
            .await
            .unwrap_or_else(|e| panic!("request {} should pass: {}", i + 1, e));
    }

    let balance_after_ten = harness.balance("dave").await.total_available;

    let err = harness
        .orchestrator
        .chat(&ctx, chat_request("gpt-4o-mini", serde_json::json!({})))
        .await
        .expect_err("11th request should be limited");

    match err {
        GatewayError::RateLimitExceeded {
            retry_after_secs,
            limit,
            ..
        } => {
            assert_eq!(limit, 10);
            assert!(retry_after_secs >= 1 && retry_after_secs <= 60);
        }
        other => panic!("expected rate limit error, got {:?}", other),
    }

    // Credits untouched by the denied request.
    assert_eq!(harness.adapter.call_count(), 10);
    assert_eq!(harness.balance("dave").await.total_available, balance_after_ten);
}

#[tokio::test]
async fn tier_restricted_model_rejects_free_user() {
    let harness = TestHarness::new(Provider::OpenAI, MockBehavior::default()).await;
    harness.seed_user("erin", Tier::Free).await;
    harness.seed_model("gpt-4o", Provider::OpenAI, Tier::Pro).await;
    harness
        .seed_pricing(Provider::OpenAI, "gpt-4o", "0.0025", "0.01", None, None)
        .await;
    harness.allocate_subscription("erin", 100).await;

    let ctx = auth_context("erin", Tier::Free);
    let err = harness
        .orchestrator
        .chat(&ctx, chat_request("gpt-4o", serde_json::json!({})))
        .await
        .expect_err("should reject");

    match err {
        GatewayError::TierRestricted {
            model_id,
            required_tier,
            current_tier,
        } => {
            assert_eq!(model_id, "gpt-4o");
            assert_eq!(required_tier, "pro");
            assert_eq!(current_tier, "free");
        }
        other => panic!("expected tier restriction, got {:?}", other),
    }
    assert_eq!(harness.adapter.call_count(), 0);
}

#[tokio::test]
async fn upstream_5xx_retries_once_then_succeeds() {
    let behavior = MockBehavior {
        fail_status: Some(503),
        fail_first_call: true,
        ..Default::default()
    };
    let harness = TestHarness::new(Provider::OpenAI, behavior).await;
    harness.seed_user("frank", Tier::Pro).await;
    harness.seed_model("gpt-4o", Provider::OpenAI, Tier::Free).await;
    harness
        .seed_pricing(Provider::OpenAI, "gpt-4o", "0.0025", "0.01", None, None)
        .await;
    harness.allocate_subscription("frank", 100).await;

    let ctx = auth_context("frank", Tier::Pro);
    let response = harness
        .orchestrator
        .chat(&ctx, chat_request("gpt-4o", serde_json::json!({})))
        .await
        .expect("retry should recover");

    assert_eq!(harness.adapter.call_count(), 2);
    assert_eq!(response.usage.credits.deducted, 1);
}

#[tokio::test]
async fn upstream_4xx_is_fatal_and_uncharged() {
    let behavior = MockBehavior {
        fail_status: Some(400),
        ..Default::default()
    };
    let harness = TestHarness::new(Provider::OpenAI, behavior).await;
    harness.seed_user("grace", Tier::Pro).await;
    harness.seed_model("gpt-4o", Provider::OpenAI, Tier::Free).await;
    harness
        .seed_pricing(Provider::OpenAI, "gpt-4o", "0.0025", "0.01", None, None)
        .await;
    harness.allocate_subscription("grace", 100).await;

    let ctx = auth_context("grace", Tier::Pro);
    let err = harness
        .orchestrator
        .chat(&ctx, chat_request("gpt-4o", serde_json::json!({})))
        .await
        .expect_err("4xx should propagate");

    assert_matches!(err, GatewayError::UpstreamRejected { status: 400, .. });
    // No retry for fatal errors, nothing charged.
    assert_eq!(harness.adapter.call_count(), 1);
    assert_eq!(harness.balance("grace").await.total_available, 100);
    assert!(harness
        .usage
        .list("grace", &default_filter())
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn streaming_final_frame_matches_unary_charge() {
    // Same inputs streamed and unary must charge the same credits.
    let harness = TestHarness::new(Provider::OpenAI, MockBehavior::default()).await;
    harness.seed_user("henry", Tier::Pro).await;
    harness.seed_model("gpt-4o", Provider::OpenAI, Tier::Free).await;
    harness
        .seed_pricing(Provider::OpenAI, "gpt-4o", "0.0025", "0.01", None, None)
        .await;
    harness.allocate_subscription("henry", 500).await;

    let ctx = auth_context("henry", Tier::Pro);
    let unary = harness
        .orchestrator
        .chat(&ctx, chat_request("gpt-4o", serde_json::json!({})))
        .await
        .expect("unary");

    let response = harness
        .orchestrator
        .clone()
        .chat_stream(&ctx, chat_request("gpt-4o", serde_json::json!({})))
        .await
        .expect("stream start");

    let body = read_full_body(response).await;
    assert!(body.contains("data: [DONE]"));

    let usage_frame = body
        .lines()
        .filter(|l| l.starts_with("data: {"))
        .map(|l| l.trim_start_matches("data: "))
        .filter_map(|l| serde_json::from_str::<serde_json::Value>(l).ok())
        .find(|v| v.get("usage").map_or(false, |u| !u.is_null()))
        .expect("one frame must carry usage");

    assert_eq!(
        usage_frame["usage"]["credits"]["deducted"],
        serde_json::json!(unary.usage.credits.deducted)
    );
    assert_eq!(usage_frame["usage"]["promptTokens"], 100);

    // Two requests, two records, same charge.
    let records = harness.usage.list("henry", &default_filter()).await.unwrap();
    assert_eq!(records.len(), 2);
    assert_eq!(records[0].credits_used, records[1].credits_used);
}

#[tokio::test]
async fn stream_cancel_charges_partial_usage() {
    // Client disconnects after a few frames; the provider had already
    // reported partial usage (80 prompt + 20 completion), so that is charged
    // with finish_reason=canceled and no [DONE] is written.
    let behavior = MockBehavior {
        usage: NormalizedUsage {
            prompt_tokens: 80,
            completion_tokens: 20,
            total_tokens: 100,
            ..Default::default()
        },
        stream_deltas: (0..50).map(|i| format!("tok{} ", i)).collect(),
        stream_delay: Duration::from_millis(20),
        usage_on_first_chunk: true,
        ..Default::default()
    };
    let harness = TestHarness::new(Provider::OpenAI, behavior).await;
    harness.seed_user("iris", Tier::Pro).await;
    harness.seed_model("gpt-4o", Provider::OpenAI, Tier::Free).await;
    harness
        .seed_pricing(Provider::OpenAI, "gpt-4o", "0.0025", "0.01", None, None)
        .await;
    harness.allocate_subscription("iris", 500).await;

    let ctx = auth_context("iris", Tier::Pro);
    let response = harness
        .orchestrator
        .clone()
        .chat_stream(&ctx, chat_request("gpt-4o", serde_json::json!({})))
        .await
        .expect("stream start");

    // Read a few frames, then drop the body (client disconnect).
    let mut stream = response.into_body().into_data_stream();
    let mut seen = String::new();
    for _ in 0..3 {
        if let Some(Ok(bytes)) = stream.next().await {
            seen.push_str(&String::from_utf8_lossy(&bytes));
        }
    }
    drop(stream);
    assert!(!seen.contains("[DONE]"));

    // The spawned pipeline notices the disconnect, cancels upstream, and
    // charges the partial usage.
    let mut recorded = None;
    for _ in 0..40 {
        tokio::time::sleep(Duration::from_millis(50)).await;
        let records = harness.usage.list("iris", &default_filter()).await.unwrap();
        if !records.is_empty() {
            recorded = Some(records[0].clone());
            break;
        }
    }
    let record = recorded.expect("canceled stream must still record usage");
    assert_eq!(record.finish_reason, "canceled");
    assert_eq!(record.prompt_tokens, 80);
    assert_eq!(record.completion_tokens, 20);
    assert_eq!(record.credits_used, 1);
    assert_eq!(harness.balance("iris").await.total_available, 499);
}

#[tokio::test]
async fn unsupported_params_are_dropped_not_fatal() {
    let harness = TestHarness::new(Provider::OpenAI, MockBehavior::default()).await;
    harness.seed_user("judy", Tier::Pro).await;
    harness
        .seed_model_with_meta(
            "gpt-4o",
            Provider::OpenAI,
            Tier::Free,
            serde_json::json!({
                "parameterConstraints": {
                    "logit_bias": { "supported": false },
                    "temperature": { "min": 0.0, "max": 2.0 }
                }
            }),
        )
        .await;
    harness
        .seed_pricing(Provider::OpenAI, "gpt-4o", "0.0025", "0.01", None, None)
        .await;
    harness.allocate_subscription("judy", 100).await;

    let ctx = auth_context("judy", Tier::Pro);

    // Dropped unsupported param: succeeds.
    harness
        .orchestrator
        .chat(
            &ctx,
            chat_request(
                "gpt-4o",
                serde_json::json!({"logit_bias": {"50256": -100}}),
            ),
        )
        .await
        .expect("unsupported param is dropped, not fatal");

    // Out-of-range param: validation error before admission or dispatch.
    let err = harness
        .orchestrator
        .chat(
            &ctx,
            chat_request("gpt-4o", serde_json::json!({"temperature": 9.0})),
        )
        .await
        .expect_err("range breach rejects");
    assert_matches!(err, GatewayError::Validation(_));
}

fn default_filter() -> llm_gateway::storage::UsageFilter {
    llm_gateway::storage::UsageFilter {
        limit: 50,
        ..Default::default()
    }
}

async fn read_full_body(response: axum::response::Response) -> String {
    let mut stream = response.into_body().into_data_stream();
    let mut out = String::new();
    while let Some(chunk) = stream.next().await {
        out.push_str(&String::from_utf8_lossy(&chunk.expect("body chunk")));
    }
    out
}

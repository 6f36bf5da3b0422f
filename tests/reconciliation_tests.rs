//! Exactly-once billing, relaxed exactly once: when deduction fails after a
//! successful inference, the client still gets the content and a
//! reconciliation record flags the uncharged usage.

mod helpers;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use uuid::Uuid;

use helpers::{auth_context, chat_request, MockAdapter, MockBehavior};
use llm_gateway::config::Config;
use llm_gateway::credits::CreditLedger;
use llm_gateway::domain::{
    DeductionOutcome, DetailedBalance, GatewayError, ModelRecord, Provider, Result, Tier,
    TierMultiplier, UsageRecord, VendorPricing,
};
use llm_gateway::orchestrator::Orchestrator;
use llm_gateway::pricing::PricingEngine;
use llm_gateway::providers::ProviderAdapter;
use llm_gateway::ratelimit::RateLimiter;
use llm_gateway::registry::ModelRegistry;
use llm_gateway::storage::{ModelStore, PricingStore, ReconciliationStore};
use rust_decimal::Decimal;

struct StaticModelStore(ModelRecord);

#[async_trait]
impl ModelStore for StaticModelStore {
    async fn get(&self, id: &str) -> Result<Option<ModelRecord>> {
        Ok((self.0.id == id).then(|| self.0.clone()))
    }
    async fn list(&self, _include_archived: bool) -> Result<Vec<ModelRecord>> {
        Ok(vec![self.0.clone()])
    }
}

struct StaticPricingStore(VendorPricing);

#[async_trait]
impl PricingStore for StaticPricingStore {
    async fn get_active(
        &self,
        _provider: Provider,
        _model: &str,
        _at: DateTime<Utc>,
    ) -> Result<Option<VendorPricing>> {
        Ok(Some(self.0.clone()))
    }
    async fn candidate_multipliers(
        &self,
        _tier: Tier,
        _provider: Provider,
        _model: &str,
    ) -> Result<Vec<TierMultiplier>> {
        Ok(vec![])
    }
}

/// Passes the pre-flight balance check, then fails every deduction.
struct BrokenLedger {
    deduct_attempts: AtomicUsize,
}

#[async_trait]
impl CreditLedger for BrokenLedger {
    async fn get_detailed(&self, _user_id: &str) -> Result<DetailedBalance> {
        Ok(DetailedBalance {
            subscription: llm_gateway::domain::SubscriptionBalance {
                remaining: 100,
                total: 100,
                period_end: None,
            },
            purchased: Default::default(),
            total_available: 100,
            last_updated: Utc::now(),
        })
    }

    async fn has_available(&self, _user_id: &str, _amount: i64) -> Result<bool> {
        Ok(true)
    }

    async fn deduct(
        &self,
        _user_id: &str,
        _amount: i64,
        _usage: UsageRecord,
    ) -> Result<DeductionOutcome> {
        self.deduct_attempts.fetch_add(1, Ordering::SeqCst);
        Err(GatewayError::Database(sqlx::Error::PoolTimedOut))
    }

    async fn allocate(
        &self,
        _user_id: &str,
        _subscription_id: &str,
        _amount: i64,
        _period_start: DateTime<Utc>,
        _period_end: DateTime<Utc>,
    ) -> Result<()> {
        Ok(())
    }

    async fn add_purchased(&self, _user_id: &str, _purchase_id: &str, _amount: i64) -> Result<()> {
        Ok(())
    }

    async fn refund(&self, _user_id: &str, _usage_id: Uuid) -> Result<i64> {
        Ok(0)
    }
}

#[derive(Default)]
struct RecordingReconciliation {
    records: Mutex<Vec<(String, UsageRecord, String)>>,
}

#[async_trait]
impl ReconciliationStore for RecordingReconciliation {
    async fn record(&self, user_id: &str, usage: &UsageRecord, reason: &str) -> Result<Uuid> {
        self.records
            .lock()
            .await
            .push((user_id.to_string(), usage.clone(), reason.to_string()));
        Ok(Uuid::new_v4())
    }
}

fn test_model() -> ModelRecord {
    ModelRecord {
        id: "gpt-4o".to_string(),
        provider: Provider::OpenAI,
        display_name: "GPT-4o".to_string(),
        capabilities: vec!["chat".to_string()],
        context_window: 128_000,
        max_output_tokens: 4096,
        meta: serde_json::Value::Null,
        is_available: true,
        is_legacy: false,
        is_archived: false,
        required_tier: Tier::Free,
        tier_restriction_mode: Default::default(),
        allowed_tiers: vec![],
        created_at: Utc::now(),
        updated_at: Utc::now(),
    }
}

fn test_pricing() -> VendorPricing {
    VendorPricing {
        id: 1,
        provider: Provider::OpenAI,
        model: "gpt-4o".to_string(),
        input_price_per_1k: Decimal::new(25, 4),
        output_price_per_1k: Decimal::new(1, 2),
        cache_write_price_per_1k: None,
        cache_read_price_per_1k: None,
        context_threshold_tokens: None,
        input_price_per_1k_high_context: None,
        output_price_per_1k_high_context: None,
        cache_write_price_per_1k_high_context: None,
        cache_read_price_per_1k_high_context: None,
        effective_from: Utc::now() - chrono::Duration::days(1),
        effective_until: None,
        is_active: true,
    }
}

#[tokio::test]
async fn deduction_failure_still_returns_content_and_reconciles() {
    let adapter = Arc::new(MockAdapter::new(Provider::OpenAI, MockBehavior::default()));
    let mut adapters: HashMap<Provider, Arc<dyn ProviderAdapter>> = HashMap::new();
    adapters.insert(Provider::OpenAI, adapter.clone());

    let ledger = Arc::new(BrokenLedger {
        deduct_attempts: AtomicUsize::new(0),
    });
    let reconciliation = Arc::new(RecordingReconciliation::default());

    let orchestrator = Orchestrator::new(
        Arc::new(ModelRegistry::new(Arc::new(StaticModelStore(test_model())))),
        Arc::new(RateLimiter::in_memory(&Config::default())),
        Arc::new(PricingEngine::new(Arc::new(StaticPricingStore(
            test_pricing(),
        )))),
        ledger.clone(),
        reconciliation.clone(),
        adapters,
        Duration::from_secs(600),
    );

    let ctx = auth_context("alice", Tier::Pro);
    let response = orchestrator
        .chat(&ctx, chat_request("gpt-4o", serde_json::json!({})))
        .await
        .expect("content must still reach the client");

    // The inference answer is intact.
    assert_eq!(response.choices[0].message.content, "Hello there!");
    // The intended charge is reported even though nothing was deducted.
    assert_eq!(response.usage.credits.deducted, 1);

    // One retry happened, then the uncharged usage was flagged.
    assert_eq!(ledger.deduct_attempts.load(Ordering::SeqCst), 2);
    let records = reconciliation.records.lock().await;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].0, "alice");
    assert_eq!(records[0].1.credits_used, 1);
}

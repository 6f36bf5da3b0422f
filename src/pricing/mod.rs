//! Pricing engine: vendor cost from normalized usage, margin multiplier
//! resolution, and USD -> credit conversion.
//!
//! Cost computation is a pure function of the pricing row and token counts so
//! the same inputs always price identically, streamed or unary.

use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::debug;

use crate::domain::{
    CreditBreakdown, GatewayError, Provider, Result, Tier, TierMultiplier, VendorPricing,
};
use crate::storage::PricingStore;

/// Fallback margin when no multiplier row matches: 1.5x.
pub fn default_multiplier() -> Decimal {
    Decimal::new(15, 1)
}

/// Token counts relevant to pricing, already normalized by the adapters.
/// At most one of the three cache-read style fields is non-zero per request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TokenCounts {
    pub input_tokens: u64,
    pub output_tokens: u64,
    /// Anthropic ephemeral cache write.
    pub cache_creation_tokens: u64,
    /// Anthropic ephemeral cache read.
    pub cache_read_tokens: u64,
    /// OpenAI automatic prefix cache.
    pub cached_prompt_tokens: u64,
    /// Google cached content.
    pub cached_content_tokens: u64,
}

impl TokenCounts {
    /// All tokens on the prompt side, cached or not.
    pub fn prompt_side_tokens(&self) -> u64 {
        self.input_tokens
            + self.cache_creation_tokens
            + self.cache_read_tokens
            + self.cached_prompt_tokens
            + self.cached_content_tokens
    }

    pub fn cached_tokens(&self) -> u64 {
        self.cache_read_tokens + self.cached_prompt_tokens + self.cached_content_tokens
    }
}

/// USD cost split into billing buckets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VendorCost {
    pub input_cost: Decimal,
    pub output_cost: Decimal,
    pub cache_write_cost: Decimal,
    pub cache_read_cost: Decimal,
    pub total: Decimal,
    /// What the prompt side would have cost with no cache at all.
    pub hypothetical_no_cache: Decimal,
}

impl VendorCost {
    pub fn savings_percent(&self) -> f64 {
        if self.hypothetical_no_cache <= Decimal::ZERO {
            return 0.0;
        }
        let saved = (self.hypothetical_no_cache - self.total) / self.hypothetical_no_cache
            * Decimal::from(100);
        saved.to_f64().unwrap_or(0.0).max(0.0)
    }
}

/// Final billing outcome for a request.
#[derive(Debug, Clone)]
pub struct CostOutcome {
    pub vendor_cost: Decimal,
    pub multiplier: Decimal,
    pub credits: i64,
    pub breakdown: CreditBreakdown,
    pub cache_hit_rate: f64,
    pub cost_savings_percent: f64,
    pub gross_margin: Decimal,
    pub pricing_id: i64,
}

const PER_1K: u64 = 1000;

fn per_1k(tokens: u64, price: Decimal) -> Decimal {
    Decimal::from(tokens) * price / Decimal::from(PER_1K)
}

/// Pure cost formula. Context-threshold pricing switches the whole prompt to
/// the high-context columns once `input_tokens` exceeds the threshold; each
/// high-context column falls back to its base column when absent.
pub fn compute_vendor_cost(pricing: &VendorPricing, tokens: &TokenCounts) -> VendorCost {
    let high = pricing.is_high_context(tokens.input_tokens);

    let p_in = if high {
        pricing
            .input_price_per_1k_high_context
            .unwrap_or(pricing.input_price_per_1k)
    } else {
        pricing.input_price_per_1k
    };
    let p_out = if high {
        pricing
            .output_price_per_1k_high_context
            .unwrap_or(pricing.output_price_per_1k)
    } else {
        pricing.output_price_per_1k
    };
    let p_cw = if high {
        pricing
            .cache_write_price_per_1k_high_context
            .or(pricing.cache_write_price_per_1k)
    } else {
        pricing.cache_write_price_per_1k
    };
    let p_cr = if high {
        pricing
            .cache_read_price_per_1k_high_context
            .or(pricing.cache_read_price_per_1k)
    } else {
        pricing.cache_read_price_per_1k
    };

    let input_cost = per_1k(tokens.input_tokens, p_in);
    let output_cost = per_1k(tokens.output_tokens, p_out);
    let cache_write_cost = per_1k(tokens.cache_creation_tokens, p_cw.unwrap_or(p_in));

    // Exactly one cache-read branch applies per request; provider defaults
    // differ (Anthropic 0.1x, OpenAI 0.5x, Google 0.1x of the input rate).
    let tenth = Decimal::new(1, 1); // 0.1
    let half = Decimal::new(5, 1); // 0.5
    let cache_read_cost = if tokens.cache_read_tokens > 0 {
        per_1k(tokens.cache_read_tokens, p_cr.unwrap_or(p_in * tenth))
    } else if tokens.cached_prompt_tokens > 0 {
        per_1k(tokens.cached_prompt_tokens, p_cr.unwrap_or(p_in * half))
    } else if tokens.cached_content_tokens > 0 {
        per_1k(tokens.cached_content_tokens, p_cr.unwrap_or(p_in * tenth))
    } else {
        Decimal::ZERO
    };

    let total = input_cost + output_cost + cache_write_cost + cache_read_cost;
    let hypothetical_no_cache = per_1k(tokens.prompt_side_tokens(), p_in) + output_cost;

    VendorCost {
        input_cost,
        output_cost,
        cache_write_cost,
        cache_read_cost,
        total,
        hypothetical_no_cache,
    }
}

/// USD -> credits: ceiling at 100 credits per dollar, floor of one credit.
pub fn credits_from_usd(usd: Decimal, multiplier: Decimal) -> i64 {
    let credits = (usd * multiplier * Decimal::from(100)).ceil();
    credits.to_i64().unwrap_or(i64::MAX).max(1)
}

/// Per-bucket attribution: same ceiling per bucket, zero stays zero. The
/// bucket sum may exceed the reported total by at most the bucket count.
fn bucket_credits(usd: Decimal, multiplier: Decimal) -> i64 {
    if usd <= Decimal::ZERO {
        return 0;
    }
    (usd * multiplier * Decimal::from(100))
        .ceil()
        .to_i64()
        .unwrap_or(i64::MAX)
}

/// Pick the most specific approved multiplier; ties resolve to largest id.
pub fn resolve_multiplier(
    candidates: &[TierMultiplier],
    tier: Tier,
    provider: Provider,
    model: &str,
) -> Decimal {
    candidates
        .iter()
        .filter(|m| m.matches(tier, provider, model))
        .max_by_key(|m| (m.specificity(), m.id))
        .map(|m| m.multiplier)
        .unwrap_or_else(default_multiplier)
}

pub struct PricingEngine {
    store: Arc<dyn PricingStore>,
}

impl PricingEngine {
    pub fn new(store: Arc<dyn PricingStore>) -> Self {
        Self { store }
    }

    async fn active_pricing(
        &self,
        provider: Provider,
        model: &str,
        at: DateTime<Utc>,
    ) -> Result<VendorPricing> {
        self.store
            .get_active(provider, model, at)
            .await?
            .ok_or_else(|| GatewayError::PricingNotFound {
                provider: provider.to_string(),
                model: model.to_string(),
            })
    }

    pub async fn multiplier(
        &self,
        tier: Tier,
        provider: Provider,
        model: &str,
    ) -> Result<Decimal> {
        let candidates = self
            .store
            .candidate_multipliers(tier, provider, model)
            .await?;
        Ok(resolve_multiplier(&candidates, tier, provider, model))
    }

    /// Final cost from real usage. Deterministic for a given
    /// (timestamp, usage, model, provider) against the pricing store.
    pub async fn finalize(
        &self,
        provider: Provider,
        model: &str,
        tier: Tier,
        tokens: &TokenCounts,
        at: DateTime<Utc>,
    ) -> Result<CostOutcome> {
        let pricing = self.active_pricing(provider, model, at).await?;
        let multiplier = self.multiplier(tier, provider, model).await?;

        let cost = compute_vendor_cost(&pricing, tokens);
        let credits = credits_from_usd(cost.total, multiplier);

        let breakdown = CreditBreakdown {
            input_credits: bucket_credits(cost.input_cost, multiplier),
            output_credits: bucket_credits(cost.output_cost, multiplier),
            cache_write_credits: bucket_credits(cost.cache_write_cost, multiplier),
            cache_read_credits: bucket_credits(cost.cache_read_cost, multiplier),
        };

        let prompt_side = tokens.prompt_side_tokens();
        let cache_hit_rate = if prompt_side == 0 {
            0.0
        } else {
            tokens.cached_tokens() as f64 / prompt_side as f64
        };

        let customer_usd = Decimal::from(credits) / Decimal::from(100);
        let gross_margin = customer_usd - cost.total;

        debug!(
            provider = %provider,
            model = model,
            vendor_cost = %cost.total,
            %multiplier,
            credits,
            "cost finalized"
        );

        Ok(CostOutcome {
            vendor_cost: cost.total,
            multiplier,
            credits,
            breakdown,
            cache_hit_rate,
            cost_savings_percent: cost.savings_percent(),
            gross_margin,
            pricing_id: pricing.id,
        })
    }

    /// Pre-flight upper bound in credits, cache-blind. Only used for the
    /// balance check before dispatch.
    pub async fn estimate_credits(
        &self,
        provider: Provider,
        model: &str,
        tier: Tier,
        input_tokens: u64,
        estimated_output_tokens: u64,
    ) -> Result<i64> {
        let pricing = self.active_pricing(provider, model, Utc::now()).await?;
        let multiplier = self.multiplier(tier, provider, model).await?;

        let tokens = TokenCounts {
            input_tokens,
            output_tokens: estimated_output_tokens,
            ..Default::default()
        };
        let cost = compute_vendor_cost(&pricing, &tokens);
        Ok(credits_from_usd(cost.total, multiplier))
    }
}

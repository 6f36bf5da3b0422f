use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::provider::Provider;
use super::tier::Tier;

/// One row of the append-only vendor pricing history. Prices are USD per
/// 1 000 tokens. At most one row is active for a (provider, model, instant).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VendorPricing {
    pub id: i64,
    pub provider: Provider,
    pub model: String,

    pub input_price_per_1k: Decimal,
    pub output_price_per_1k: Decimal,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_write_price_per_1k: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_read_price_per_1k: Option<Decimal>,

    /// Once the prompt exceeds this many tokens the high-context columns
    /// apply to the whole prompt.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context_threshold_tokens: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_price_per_1k_high_context: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_price_per_1k_high_context: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_write_price_per_1k_high_context: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_read_price_per_1k_high_context: Option<Decimal>,

    pub effective_from: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub effective_until: Option<DateTime<Utc>>,
    pub is_active: bool,
}

impl VendorPricing {
    pub fn applies_at(&self, at: &DateTime<Utc>) -> bool {
        if !self.is_active || self.effective_from > *at {
            return false;
        }
        match &self.effective_until {
            Some(until) => until >= at,
            None => true,
        }
    }

    pub fn is_high_context(&self, input_tokens: u64) -> bool {
        matches!(self.context_threshold_tokens, Some(t) if input_tokens > t)
    }
}

/// Approval lifecycle for a margin multiplier row.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MultiplierStatus {
    Pending,
    Approved,
    Inactive,
}

impl MultiplierStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MultiplierStatus::Pending => "pending",
            MultiplierStatus::Approved => "approved",
            MultiplierStatus::Inactive => "inactive",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "approved" => MultiplierStatus::Approved,
            "inactive" => MultiplierStatus::Inactive,
            _ => MultiplierStatus::Pending,
        }
    }
}

/// Margin multiplier rule. Specificity resolves ties:
/// (tier,provider,model) > model > provider > tier > default.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TierMultiplier {
    pub id: i64,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub tier: Option<Tier>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<Provider>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    /// Must stay within [1.0, 3.0].
    pub multiplier: Decimal,
    pub status: MultiplierStatus,
}

impl TierMultiplier {
    pub fn matches(&self, tier: Tier, provider: Provider, model: &str) -> bool {
        if self.status != MultiplierStatus::Approved {
            return false;
        }
        self.tier.map_or(true, |t| t == tier)
            && self.provider.map_or(true, |p| p == provider)
            && self.model.as_deref().map_or(true, |m| m == model)
    }

    /// Higher wins. Mirrors the documented priority order.
    pub fn specificity(&self) -> u8 {
        match (
            self.tier.is_some(),
            self.provider.is_some(),
            self.model.is_some(),
        ) {
            (true, true, true) => 5,
            (_, _, true) => 4,
            (_, true, false) => 3,
            (true, false, false) => 2,
            _ => 1,
        }
    }
}

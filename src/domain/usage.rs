use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::provider::Provider;

/// The operation a usage record was billed for.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Completion,
    Chat,
    Embedding,
    FunctionCall,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Completion => "completion",
            Operation::Chat => "chat",
            Operation::Embedding => "embedding",
            Operation::FunctionCall => "function_call",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "completion" => Some(Operation::Completion),
            "chat" => Some(Operation::Chat),
            "embedding" => Some(Operation::Embedding),
            "function_call" => Some(Operation::FunctionCall),
            _ => None,
        }
    }
}

/// Which pool a deduction slice was drawn from, kept so refunds can return
/// credits to the right place.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", tag = "pool")]
pub enum DebitEntry {
    Subscription { credit_id: String, amount: i64 },
    Purchased { purchase_id: String, amount: i64 },
}

impl DebitEntry {
    pub fn amount(&self) -> i64 {
        match self {
            DebitEntry::Subscription { amount, .. } => *amount,
            DebitEntry::Purchased { amount, .. } => *amount,
        }
    }
}

/// Per-bucket credit attribution. Buckets round up individually for display,
/// so their sum may exceed `credits_used` by at most the bucket count.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CreditBreakdown {
    pub input_credits: i64,
    pub output_credits: i64,
    pub cache_write_credits: i64,
    pub cache_read_credits: i64,
}

/// Append-only billing record, one per charged inference.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageRecord {
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,

    pub user_id: String,
    pub model_id: String,
    pub provider: Provider,
    pub operation: Operation,

    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,

    /// Anthropic ephemeral cache write.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_creation_tokens: Option<u64>,

    /// Anthropic ephemeral cache read.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_read_tokens: Option<u64>,

    /// OpenAI automatic prefix cache.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cached_prompt_tokens: Option<u64>,

    pub credits_used: i64,
    pub vendor_cost: Decimal,
    pub margin_multiplier: Decimal,
    pub gross_margin: Decimal,

    pub credit_breakdown: CreditBreakdown,

    /// cached tokens / total prompt-side tokens, 0.0 when nothing cached.
    pub cache_hit_rate: f64,
    pub cost_savings_percent: f64,

    pub finish_reason: String,

    #[serde(default)]
    pub debit_trail: Vec<DebitEntry>,

    pub executed_at: DateTime<Utc>,
    pub duration_ms: u64,
}

impl UsageRecord {
    /// Total prompt-side tokens that hit any provider cache.
    pub fn cached_tokens(&self) -> u64 {
        self.cache_read_tokens
            .or(self.cached_prompt_tokens)
            .unwrap_or(0)
    }
}

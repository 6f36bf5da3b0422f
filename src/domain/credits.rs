use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::usage::DebitEntry;

/// Subscription-pool slice of a balance view.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionBalance {
    pub remaining: i64,
    pub total: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub period_end: Option<DateTime<Utc>>,
}

/// Purchased-pool slice of a balance view.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct PurchasedBalance {
    pub remaining: i64,
    pub total: i64,
}

/// Full balance view returned by `/v1/credits/me`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DetailedBalance {
    pub subscription: SubscriptionBalance,
    pub purchased: PurchasedBalance,
    pub total_available: i64,
    pub last_updated: DateTime<Utc>,
}

impl DetailedBalance {
    pub fn empty() -> Self {
        Self {
            subscription: SubscriptionBalance::default(),
            purchased: PurchasedBalance::default(),
            total_available: 0,
            last_updated: Utc::now(),
        }
    }
}

/// Result of an atomic deduction, echoed back to the client inside
/// `usage.credits`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeductionOutcome {
    pub deducted: i64,
    pub remaining: i64,
    pub subscription_remaining: i64,
    pub purchased_remaining: i64,
    #[serde(default, skip_serializing)]
    pub debit_trail: Vec<DebitEntry>,
}

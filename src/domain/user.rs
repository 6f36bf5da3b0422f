use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::tier::Tier;

/// Read-only view of an end user. The identity store owns the row; the core
/// never mutates it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    pub id: String,
    pub email: String,
    pub email_verified: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub picture: Option<String>,
    pub is_active: bool,
    pub role: String,
    pub tier: Tier,
    pub updated_at: DateTime<Utc>,
}

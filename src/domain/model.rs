use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::provider::Provider;
use super::tier::Tier;

/// A model catalog entry. The `meta` map is the extensibility point: display
/// info, parameter constraints, and legacy metadata all live there and are
/// parsed through typed accessors.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelRecord {
    pub id: String,
    pub provider: Provider,

    #[serde(default)]
    pub display_name: String,

    /// Capability flags, e.g. "chat", "completion", "vision", "tools".
    #[serde(default)]
    pub capabilities: Vec<String>,

    pub context_window: u32,
    pub max_output_tokens: u32,

    /// Free-form metadata, validated on ingress by the admin path.
    #[serde(default)]
    pub meta: serde_json::Value,

    pub is_available: bool,
    pub is_legacy: bool,
    pub is_archived: bool,

    pub required_tier: Tier,
    pub tier_restriction_mode: TierRestrictionMode,

    /// Only consulted in `whitelist` mode.
    #[serde(default)]
    pub allowed_tiers: Vec<Tier>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum TierRestrictionMode {
    #[default]
    Minimum,
    Exact,
    Whitelist,
}

impl TierRestrictionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            TierRestrictionMode::Minimum => "minimum",
            TierRestrictionMode::Exact => "exact",
            TierRestrictionMode::Whitelist => "whitelist",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "exact" => TierRestrictionMode::Exact,
            "whitelist" => TierRestrictionMode::Whitelist,
            _ => TierRestrictionMode::Minimum,
        }
    }
}

/// Access verdict for a (model, user tier) pair.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AccessStatus {
    Allowed,
    Restricted,
    UpgradeRequired,
}

/// Deprecation metadata for legacy models, surfaced in listings.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct LegacyInfo {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub replacement_model_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deprecation_notice: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sunset_date: Option<DateTime<Utc>>,
}

/// Per-parameter rule carried in `meta.parameterConstraints`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParameterConstraint {
    #[serde(default = "default_true")]
    pub supported: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub default: Option<serde_json::Value>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub allowed_values: Option<Vec<serde_json::Value>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub mutually_exclusive_with: Option<Vec<String>>,

    /// Provider wants this field under a different name
    /// (e.g. `max_tokens` -> `max_completion_tokens`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alternative_name: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

fn default_true() -> bool {
    true
}

/// Parsed view of `meta.parameterConstraints` + `meta.customParameters`.
#[derive(Debug, Clone, Default)]
pub struct ModelConstraints {
    pub parameters: HashMap<String, ParameterConstraint>,
    pub custom_parameters: HashMap<String, ParameterConstraint>,
}

impl ModelRecord {
    /// Availability gate for dispatch. Legacy is informational only.
    pub fn is_dispatchable(&self) -> bool {
        self.is_available && !self.is_archived
    }

    pub fn access_status(&self, user_tier: Tier) -> AccessStatus {
        match self.tier_restriction_mode {
            TierRestrictionMode::Minimum => {
                if user_tier >= self.required_tier {
                    AccessStatus::Allowed
                } else {
                    AccessStatus::UpgradeRequired
                }
            }
            TierRestrictionMode::Exact => {
                if user_tier == self.required_tier {
                    AccessStatus::Allowed
                } else {
                    AccessStatus::Restricted
                }
            }
            TierRestrictionMode::Whitelist => {
                if self.allowed_tiers.contains(&user_tier) {
                    AccessStatus::Allowed
                } else {
                    AccessStatus::Restricted
                }
            }
        }
    }

    pub fn supports(&self, capability: &str) -> bool {
        self.capabilities.iter().any(|c| c == capability)
    }

    /// Parse the constraint block out of `meta`. Missing or malformed blocks
    /// mean "no constraints" so admin typos never block inference.
    pub fn constraints(&self) -> ModelConstraints {
        let parameters = self
            .meta
            .get("parameterConstraints")
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or_default();
        let custom_parameters = self
            .meta
            .get("customParameters")
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or_default();

        ModelConstraints {
            parameters,
            custom_parameters,
        }
    }

    pub fn legacy_info(&self) -> Option<LegacyInfo> {
        if !self.is_legacy {
            return None;
        }
        self.meta
            .get("legacyInfo")
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .or(Some(LegacyInfo::default()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn model(mode: TierRestrictionMode, required: Tier, allowed: Vec<Tier>) -> ModelRecord {
        ModelRecord {
            id: "gpt-4o".to_string(),
            provider: Provider::OpenAI,
            display_name: "GPT-4o".to_string(),
            capabilities: vec!["chat".to_string()],
            context_window: 128_000,
            max_output_tokens: 16_384,
            meta: serde_json::Value::Null,
            is_available: true,
            is_legacy: false,
            is_archived: false,
            required_tier: required,
            tier_restriction_mode: mode,
            allowed_tiers: allowed,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_minimum_mode() {
        let m = model(TierRestrictionMode::Minimum, Tier::Pro, vec![]);
        assert_eq!(m.access_status(Tier::Free), AccessStatus::UpgradeRequired);
        assert_eq!(m.access_status(Tier::Pro), AccessStatus::Allowed);
        assert_eq!(m.access_status(Tier::EnterpriseMax), AccessStatus::Allowed);
    }

    #[test]
    fn test_exact_mode() {
        let m = model(TierRestrictionMode::Exact, Tier::Pro, vec![]);
        assert_eq!(m.access_status(Tier::Free), AccessStatus::Restricted);
        assert_eq!(m.access_status(Tier::Pro), AccessStatus::Allowed);
        assert_eq!(m.access_status(Tier::ProMax), AccessStatus::Restricted);
    }

    #[test]
    fn test_whitelist_mode() {
        let m = model(
            TierRestrictionMode::Whitelist,
            Tier::Free,
            vec![Tier::Pro, Tier::Perpetual],
        );
        assert_eq!(m.access_status(Tier::Pro), AccessStatus::Allowed);
        assert_eq!(m.access_status(Tier::Perpetual), AccessStatus::Allowed);
        assert_eq!(m.access_status(Tier::Free), AccessStatus::Restricted);
    }

    #[test]
    fn test_dispatchable_gate() {
        let mut m = model(TierRestrictionMode::Minimum, Tier::Free, vec![]);
        assert!(m.is_dispatchable());
        m.is_archived = true;
        assert!(!m.is_dispatchable());
        m.is_archived = false;
        m.is_available = false;
        assert!(!m.is_dispatchable());
    }

    #[test]
    fn test_constraints_parsing() {
        let mut m = model(TierRestrictionMode::Minimum, Tier::Free, vec![]);
        m.meta = json!({
            "parameterConstraints": {
                "temperature": { "supported": true, "min": 0.0, "max": 2.0, "default": 1.0 },
                "logit_bias": { "supported": false, "reason": "not exposed" },
                "max_tokens": { "alternativeName": "max_completion_tokens" }
            }
        });

        let constraints = m.constraints();
        assert_eq!(constraints.parameters.len(), 3);
        assert!(!constraints.parameters["logit_bias"].supported);
        assert_eq!(
            constraints.parameters["max_tokens"].alternative_name.as_deref(),
            Some("max_completion_tokens")
        );
        assert_eq!(constraints.parameters["temperature"].max, Some(2.0));
    }

    #[test]
    fn test_legacy_info_only_for_legacy_models() {
        let mut m = model(TierRestrictionMode::Minimum, Tier::Free, vec![]);
        assert!(m.legacy_info().is_none());

        m.is_legacy = true;
        m.meta = json!({
            "legacyInfo": { "replacementModelId": "gpt-4o", "deprecationNotice": "use gpt-4o" }
        });
        let info = m.legacy_info().unwrap();
        assert_eq!(info.replacement_model_id.as_deref(), Some("gpt-4o"));
    }
}

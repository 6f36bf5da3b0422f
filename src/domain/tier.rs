use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Subscription tiers, ordered lowest to highest. The ordering is load-bearing
/// for `minimum` tier restrictions, so the derive order must not change.
#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    #[default]
    Free,
    Pro,
    ProMax,
    EnterprisePro,
    EnterpriseMax,
    Perpetual,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Free => "free",
            Tier::Pro => "pro",
            Tier::ProMax => "pro_max",
            Tier::EnterprisePro => "enterprise_pro",
            Tier::EnterpriseMax => "enterprise_max",
            Tier::Perpetual => "perpetual",
        }
    }

    pub fn all() -> &'static [Tier] {
        &[
            Tier::Free,
            Tier::Pro,
            Tier::ProMax,
            Tier::EnterprisePro,
            Tier::EnterpriseMax,
            Tier::Perpetual,
        ]
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Tier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "free" => Ok(Tier::Free),
            "pro" => Ok(Tier::Pro),
            "pro_max" | "promax" => Ok(Tier::ProMax),
            "enterprise_pro" => Ok(Tier::EnterprisePro),
            "enterprise_max" => Ok(Tier::EnterpriseMax),
            "perpetual" => Ok(Tier::Perpetual),
            other => Err(format!("unknown tier: {}", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tier_ordering() {
        assert!(Tier::Free < Tier::Pro);
        assert!(Tier::Pro < Tier::ProMax);
        assert!(Tier::ProMax < Tier::EnterprisePro);
        assert!(Tier::EnterprisePro < Tier::EnterpriseMax);
        assert!(Tier::EnterpriseMax < Tier::Perpetual);
    }

    #[test]
    fn test_tier_parsing() {
        assert_eq!(Tier::from_str("pro"), Ok(Tier::Pro));
        assert_eq!(Tier::from_str("PRO_MAX"), Ok(Tier::ProMax));
        assert!(Tier::from_str("platinum").is_err());
    }

    #[test]
    fn test_tier_serialization() {
        let json = serde_json::to_string(&Tier::EnterprisePro).unwrap();
        assert_eq!(json, "\"enterprise_pro\"");
        let back: Tier = serde_json::from_str(&json).unwrap();
        assert_eq!(back, Tier::EnterprisePro);
    }
}

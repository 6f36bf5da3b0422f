use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::domain::Tier;

/// Claims carried by a gateway access token. `scope` is space-separated per
/// RFC 8693; `tier` and `role` are issued at token time and may be absent on
/// tokens minted by an external issuer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessClaims {
    pub sub: String,
    pub iss: String,
    pub aud: String,
    pub exp: i64,
    pub iat: i64,
    pub jti: String,
    pub scope: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub tier: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

impl AccessClaims {
    pub fn scopes(&self) -> Vec<String> {
        self.scope
            .split_whitespace()
            .map(str::to_string)
            .collect()
    }

    pub fn tier(&self) -> Option<Tier> {
        self.tier.as_deref().and_then(|t| Tier::from_str(t).ok())
    }
}

/// Authenticated request context attached by the middleware.
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub user_id: String,
    pub scopes: Vec<String>,
    pub tier: Tier,
    pub role: String,
}

impl AuthContext {
    pub fn has_scope(&self, scope: &str) -> bool {
        self.scopes.iter().any(|s| s == scope || s == "*")
    }

    pub fn require_scope(&self, scope: &str) -> crate::domain::Result<()> {
        if self.has_scope(scope) {
            Ok(())
        } else {
            Err(crate::domain::GatewayError::InsufficientScope {
                required: scope.to_string(),
            })
        }
    }

    pub fn is_admin(&self) -> bool {
        self.has_scope("admin") || self.role == "admin"
    }
}

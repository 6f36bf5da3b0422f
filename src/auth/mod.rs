//! Auth gateway: RS256 bearer validation, revocation, and the role cache
//! backing the admin fallback.

pub mod claims;
pub mod jwks;
pub mod middleware;

pub use claims::{AccessClaims, AuthContext};
pub use jwks::{JwksCache, KeySource};
pub use middleware::{auth_middleware, AuthState};

use jsonwebtoken::{decode, decode_header, Algorithm, Validation};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

use crate::domain::{GatewayError, Result, Tier};
use crate::storage::IdentityStore;

/// Revoked access-token ids, consulted on every validation. Entries expire
/// with the longest possible token lifetime.
#[derive(Clone, Default)]
pub struct RevocationList {
    revoked: Arc<RwLock<HashSet<String>>>,
}

impl RevocationList {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn revoke(&self, jti: &str) {
        self.revoked.write().await.insert(jti.to_string());
    }

    pub async fn is_revoked(&self, jti: &str) -> bool {
        self.revoked.read().await.contains(jti)
    }
}

/// Validates bearer tokens and produces the request auth context.
pub struct TokenValidator {
    keys: KeySource,
    issuer: String,
    audience: String,
    revocations: RevocationList,
}

impl TokenValidator {
    pub fn new(
        keys: KeySource,
        issuer: String,
        audience: String,
        revocations: RevocationList,
    ) -> Self {
        Self {
            keys,
            issuer,
            audience,
            revocations,
        }
    }

    pub async fn validate(&self, token: &str) -> Result<AccessClaims> {
        let header = decode_header(token)
            .map_err(|e| GatewayError::unauthorized(format!("malformed token: {}", e)))?;

        if header.alg != Algorithm::RS256 {
            return Err(GatewayError::unauthorized("unsupported token algorithm"));
        }

        let key = self.keys.key_for(header.kid.as_deref()).await?;

        let mut validation = Validation::new(Algorithm::RS256);
        validation.set_issuer(&[self.issuer.clone()]);
        validation.set_audience(&[self.audience.clone()]);

        let data = decode::<AccessClaims>(token, &key, &validation).map_err(|e| {
            match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => {
                    GatewayError::unauthorized("token expired")
                }
                _ => GatewayError::unauthorized(format!("token validation failed: {}", e)),
            }
        })?;

        if self.revocations.is_revoked(&data.claims.jti).await {
            return Err(GatewayError::unauthorized("token revoked"));
        }

        Ok(data.claims)
    }
}

/// Server-side (tier, role) lookup with a 5-minute cache, used when the
/// token does not carry the claims.
pub struct RoleCache {
    identity: Arc<dyn IdentityStore>,
    cache: RwLock<std::collections::HashMap<String, (Tier, String, Instant)>>,
    ttl: Duration,
}

impl RoleCache {
    pub fn new(identity: Arc<dyn IdentityStore>) -> Self {
        Self {
            identity,
            cache: RwLock::new(std::collections::HashMap::new()),
            ttl: Duration::from_secs(300),
        }
    }

    pub async fn lookup(&self, user_id: &str) -> Result<(Tier, String)> {
        {
            let cache = self.cache.read().await;
            if let Some((tier, role, fetched_at)) = cache.get(user_id) {
                if fetched_at.elapsed() < self.ttl {
                    return Ok((*tier, role.clone()));
                }
            }
        }

        let user = self
            .identity
            .get_user(user_id)
            .await?
            .ok_or_else(|| GatewayError::unauthorized("unknown subject"))?;

        if !user.is_active {
            return Err(GatewayError::Forbidden("account disabled".to_string()));
        }

        let mut cache = self.cache.write().await;
        cache.insert(
            user_id.to_string(),
            (user.tier, user.role.clone(), Instant::now()),
        );
        Ok((user.tier, user.role))
    }
}

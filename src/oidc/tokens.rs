//! RS256 token issuance for the gateway-as-issuer path.

use chrono::{Duration, Utc};
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use serde::Serialize;
use uuid::Uuid;

use crate::auth::AccessClaims;
use crate::config::AuthConfig;
use crate::domain::{GatewayError, Result, UserProfile};

#[derive(Debug, Serialize)]
struct IdTokenClaims {
    iss: String,
    sub: String,
    aud: String,
    exp: i64,
    iat: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    nonce: Option<String>,
    email: String,
    email_verified: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    picture: Option<String>,
}

pub struct TokenIssuer {
    encoding_key: EncodingKey,
    kid: String,
    issuer: String,
    audience: String,
    access_ttl_secs: i64,
}

impl TokenIssuer {
    pub fn new(config: &AuthConfig) -> Result<Self> {
        let encoding_key = EncodingKey::from_rsa_pem(config.signing_key_pem.as_bytes())
            .map_err(|e| GatewayError::Config(format!("invalid signing key: {}", e)))?;
        Ok(Self {
            encoding_key,
            kid: config.jwk.kid.clone(),
            issuer: config.issuer.clone(),
            audience: config.audience.clone(),
            access_ttl_secs: config.access_token_ttl_secs,
        })
    }

    fn header(&self) -> Header {
        let mut header = Header::new(Algorithm::RS256);
        header.kid = Some(self.kid.clone());
        header
    }

    pub fn access_ttl_secs(&self) -> i64 {
        self.access_ttl_secs
    }

    /// Mint an access token carrying scope, tier, and role so the hot path
    /// never needs a user lookup.
    pub fn issue_access_token(&self, user: &UserProfile, scope: &str) -> Result<String> {
        let now = Utc::now();
        let claims = AccessClaims {
            sub: user.id.clone(),
            iss: self.issuer.clone(),
            aud: self.audience.clone(),
            exp: (now + Duration::seconds(self.access_ttl_secs)).timestamp(),
            iat: now.timestamp(),
            jti: Uuid::new_v4().to_string(),
            scope: scope.to_string(),
            tier: Some(user.tier.as_str().to_string()),
            role: Some(user.role.clone()),
            email: Some(user.email.clone()),
        };

        encode(&self.header(), &claims, &self.encoding_key)
            .map_err(|e| GatewayError::Internal(format!("token encoding failed: {}", e)))
    }

    pub fn issue_id_token(
        &self,
        user: &UserProfile,
        client_id: &str,
        nonce: Option<String>,
    ) -> Result<String> {
        let now = Utc::now();
        let claims = IdTokenClaims {
            iss: self.issuer.clone(),
            sub: user.id.clone(),
            aud: client_id.to_string(),
            exp: (now + Duration::seconds(self.access_ttl_secs)).timestamp(),
            iat: now.timestamp(),
            nonce,
            email: user.email.clone(),
            email_verified: user.email_verified,
            name: user.name.clone(),
            picture: user.picture.clone(),
        };

        encode(&self.header(), &claims, &self.encoding_key)
            .map_err(|e| GatewayError::Internal(format!("id token encoding failed: {}", e)))
    }
}

//! JWKS key material with a 5-minute soft-refresh cache: a stale key set is
//! served while the refresh runs, so validation never blocks on the issuer.

use jsonwebtoken::DecodingKey;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::warn;

use crate::config::JwkConfig;
use crate::domain::{GatewayError, Result};

pub const JWKS_TTL: Duration = Duration::from_secs(300);

#[derive(Debug, Deserialize)]
struct JwksDocument {
    keys: Vec<Jwk>,
}

#[derive(Debug, Deserialize)]
struct Jwk {
    #[serde(default)]
    kid: String,
    #[serde(default)]
    kty: String,
    #[serde(default)]
    n: String,
    #[serde(default)]
    e: String,
}

/// Where RS256 verification keys come from.
pub enum KeySource {
    /// The gateway's own signing key (it is the issuer).
    Local { kid: String, key: DecodingKey },
    /// A remote issuer's JWKS endpoint.
    Remote(JwksCache),
}

impl KeySource {
    pub fn local(jwk: &JwkConfig) -> Result<Self> {
        let key = DecodingKey::from_rsa_components(&jwk.n, &jwk.e)
            .map_err(|e| GatewayError::Config(format!("invalid jwk components: {}", e)))?;
        Ok(KeySource::Local {
            kid: jwk.kid.clone(),
            key,
        })
    }

    pub fn remote(url: String) -> Result<Self> {
        Ok(KeySource::Remote(JwksCache::new(url)?))
    }

    pub async fn key_for(&self, kid: Option<&str>) -> Result<DecodingKey> {
        match self {
            KeySource::Local { kid: local_kid, key } => {
                if let Some(kid) = kid {
                    if kid != local_kid {
                        return Err(GatewayError::unauthorized(format!(
                            "unknown key id: {}",
                            kid
                        )));
                    }
                }
                Ok(key.clone())
            }
            KeySource::Remote(cache) => cache.key_for(kid).await,
        }
    }
}

struct CachedKeys {
    keys: HashMap<String, DecodingKey>,
    fetched_at: Instant,
}

pub struct JwksCache {
    url: String,
    http: reqwest::Client,
    cached: Arc<RwLock<Option<CachedKeys>>>,
    ttl: Duration,
}

impl JwksCache {
    pub fn new(url: String) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .map_err(|e| GatewayError::Internal(format!("jwks client build failed: {}", e)))?;
        Ok(Self {
            url,
            http,
            cached: Arc::new(RwLock::new(None)),
            ttl: JWKS_TTL,
        })
    }

    async fn fetch(&self) -> Result<HashMap<String, DecodingKey>> {
        let document: JwksDocument = self
            .http
            .get(&self.url)
            .send()
            .await
            .map_err(|e| GatewayError::UpstreamUnavailable(format!("jwks fetch: {}", e)))?
            .json()
            .await
            .map_err(|e| GatewayError::UpstreamUnavailable(format!("jwks parse: {}", e)))?;

        let mut keys = HashMap::new();
        for jwk in document.keys {
            if jwk.kty != "RSA" {
                continue;
            }
            match DecodingKey::from_rsa_components(&jwk.n, &jwk.e) {
                Ok(key) => {
                    keys.insert(jwk.kid, key);
                }
                Err(e) => warn!(kid = %jwk.kid, error = %e, "skipping unparseable jwk"),
            }
        }
        Ok(keys)
    }

    /// Look up a key, refreshing past the TTL. A failed refresh serves the
    /// stale set rather than rejecting traffic.
    pub async fn key_for(&self, kid: Option<&str>) -> Result<DecodingKey> {
        let needs_refresh = {
            let cached = self.cached.read().await;
            match cached.as_ref() {
                Some(c) => c.fetched_at.elapsed() >= self.ttl,
                None => true,
            }
        };

        if needs_refresh {
            match self.fetch().await {
                Ok(keys) => {
                    let mut cached = self.cached.write().await;
                    *cached = Some(CachedKeys {
                        keys,
                        fetched_at: Instant::now(),
                    });
                }
                Err(e) => {
                    let cached = self.cached.read().await;
                    if cached.is_none() {
                        return Err(e);
                    }
                    warn!(error = %e, "jwks refresh failed, serving stale keys");
                }
            }
        }

        let cached = self.cached.read().await;
        let keys = &cached
            .as_ref()
            .ok_or_else(|| GatewayError::unauthorized("no jwks available"))?
            .keys;

        match kid {
            Some(kid) => keys
                .get(kid)
                .cloned()
                .ok_or_else(|| GatewayError::unauthorized(format!("unknown key id: {}", kid))),
            // No kid in the header: a single-key set is unambiguous.
            None if keys.len() == 1 => Ok(keys.values().next().unwrap().clone()),
            None => Err(GatewayError::unauthorized("token missing key id")),
        }
    }
}

//! Configuration loaded from a TOML file with `GATEWAY_*` environment
//! overrides layered on top.

use figment::providers::{Env, Format, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

use crate::domain::{GatewayError, Result, Tier};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub shared_store: SharedStoreConfig,
    pub auth: AuthConfig,
    pub providers: ProvidersConfig,
    pub ratelimit: RateLimitConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Unary request ceiling.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    /// Streaming request ceiling.
    #[serde(default = "default_stream_timeout")]
    pub stream_timeout_secs: u64,
    #[serde(default = "default_true")]
    pub enable_cors: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_database_url")]
    pub url: String,
    #[serde(default = "default_pool_size")]
    pub pool_size: u32,
    /// Ceiling on deduction transaction lifetime.
    #[serde(default = "default_txn_timeout")]
    pub deduction_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SharedStoreConfig {
    #[serde(default)]
    pub url: Option<String>,
    /// When set, a dead shared store is a boot failure instead of a
    /// degraded-mode fallback.
    #[serde(default)]
    pub required: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    pub issuer: String,
    #[serde(default = "default_audience")]
    pub audience: String,

    /// RS256 private key (PEM) used to sign tokens this gateway issues.
    #[serde(default)]
    pub signing_key_pem: String,

    /// Public JWK components matching the signing key, served at jwks_uri.
    #[serde(default)]
    pub jwk: JwkConfig,

    /// Validate against an external JWKS instead of the local key.
    #[serde(default)]
    pub jwks_url: Option<String>,

    #[serde(default = "default_access_ttl")]
    pub access_token_ttl_secs: i64,
    #[serde(default = "default_refresh_ttl")]
    pub refresh_token_ttl_secs: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct JwkConfig {
    pub kid: String,
    /// Base64url modulus.
    pub n: String,
    /// Base64url exponent.
    pub e: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ProvidersConfig {
    pub openai: ProviderConfig,
    pub anthropic: ProviderConfig,
    pub google: ProviderConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default = "default_provider_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_pool_per_host")]
    pub max_connections: usize,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            base_url: None,
            timeout_secs: default_provider_timeout(),
            max_connections: default_pool_per_host(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Per-tier requests-per-minute overrides, keyed by tier name.
    #[serde(default)]
    pub rpm_overrides: HashMap<String, u64>,
    /// Requests/min allowed per IP on unauthenticated OAuth endpoints.
    #[serde(default = "default_ip_rpm")]
    pub oauth_ip_rpm: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            rpm_overrides: HashMap::new(),
            oauth_ip_rpm: default_ip_rpm(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            request_timeout_secs: default_request_timeout(),
            stream_timeout_secs: default_stream_timeout(),
            enable_cors: true,
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: default_database_url(),
            pool_size: default_pool_size(),
            deduction_timeout_secs: default_txn_timeout(),
        }
    }
}

impl Default for SharedStoreConfig {
    fn default() -> Self {
        Self {
            url: None,
            required: false,
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            issuer: "http://localhost:8080".to_string(),
            audience: default_audience(),
            signing_key_pem: String::new(),
            jwk: JwkConfig::default(),
            jwks_url: None,
            access_token_ttl_secs: default_access_ttl(),
            refresh_token_ttl_secs: default_refresh_ttl(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8080
}
fn default_request_timeout() -> u64 {
    30
}
fn default_stream_timeout() -> u64 {
    600
}
fn default_true() -> bool {
    true
}
fn default_database_url() -> String {
    "sqlite:gateway.db".to_string()
}
fn default_pool_size() -> u32 {
    10
}
fn default_txn_timeout() -> u64 {
    15
}
fn default_audience() -> String {
    "llm-gateway".to_string()
}
fn default_access_ttl() -> i64 {
    3600
}
fn default_refresh_ttl() -> i64 {
    30 * 24 * 3600
}
fn default_provider_timeout() -> u64 {
    600
}
fn default_pool_per_host() -> usize {
    32
}
fn default_ip_rpm() -> u64 {
    30
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    /// Load from a TOML file, then apply `GATEWAY_`-prefixed environment
    /// overrides (e.g. `GATEWAY_DATABASE__URL`).
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();
        if let Some(path) = path {
            figment = figment.merge(Toml::file(path));
        }
        figment
            .merge(Env::prefixed("GATEWAY_").split("__"))
            .extract()
            .map_err(|e| GatewayError::Config(e.to_string()))
    }

    /// RPM override for a tier, if configured.
    pub fn rpm_override(&self, tier: Tier) -> Option<u64> {
        self.ratelimit.rpm_overrides.get(tier.as_str()).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.server.request_timeout_secs, 30);
        assert_eq!(config.server.stream_timeout_secs, 600);
        assert_eq!(config.database.pool_size, 10);
        assert!(!config.shared_store.required);
    }

    #[test]
    fn test_rpm_override_lookup() {
        let mut config = Config::default();
        config
            .ratelimit
            .rpm_overrides
            .insert("pro".to_string(), 120);
        assert_eq!(config.rpm_override(Tier::Pro), Some(120));
        assert_eq!(config.rpm_override(Tier::Free), None);
    }

    #[test]
    fn test_load_from_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gateway.toml");
        std::fs::write(
            &path,
            r#"
[server]
port = 9000

[database]
url = "sqlite::memory:"

[auth]
issuer = "https://id.example.com"

[auth.jwk]
kid = "key-1"
n = "abc"
e = "AQAB"
"#,
        )
        .unwrap();

        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.auth.issuer, "https://id.example.com");
        assert_eq!(config.auth.jwk.kid, "key-1");
    }
}

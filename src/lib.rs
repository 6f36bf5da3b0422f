//! llm-gateway - Multi-tenant LLM inference gateway.
//!
//! Authenticates clients via OAuth 2.0 / OIDC, meters usage against
//! subscription and purchased credit pools, enforces tier-aware rate limits,
//! proxies chat and text completions (unary and streamed) to OpenAI,
//! Anthropic, and Google, and records cache-aware billing.

pub mod api;
pub mod auth;
pub mod config;
pub mod credits;
pub mod domain;
pub mod observability;
pub mod oidc;
pub mod orchestrator;
pub mod pricing;
pub mod providers;
pub mod ratelimit;
pub mod registry;
pub mod storage;

// Re-export commonly used types
pub use domain::{
    GatewayError, ModelRecord, Operation, Provider, Result, Tier, UsageRecord, UserProfile,
};

pub use api::{AppState, ApiServer};
pub use auth::{AccessClaims, AuthContext, KeySource, RevocationList, RoleCache, TokenValidator};
pub use config::Config;
pub use credits::{CreditLedger, SqliteCreditLedger};
pub use oidc::{OidcState, SqliteOidcStore, TokenIssuer};
pub use orchestrator::Orchestrator;
pub use pricing::{PricingEngine, TokenCounts};
pub use providers::{
    ChatMessage, ChatRequest, CompletionRequest, FinishReason, NormalizedUsage, ProviderAdapter,
    ProviderResponse, ProviderStream, StreamChunk,
};
pub use ratelimit::{Admission, RateLimiter, RedisRateStore, TierLimits};
pub use registry::{ModelFilter, ModelListing, ModelRegistry};
pub use storage::{
    Database, IdentityStore, ModelStore, PricingStore, ReconciliationStore, UsageStore,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

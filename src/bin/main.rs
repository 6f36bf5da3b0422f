//! Gateway binary: `gateway serve` and `gateway migrate`.
//!
//! Exit codes: 0 success, 1 fatal configuration error, 2 database
//! unavailable at boot, 3 shared store unavailable when it is required.
//! By default a dead shared store only degrades the limiter.

use clap::{Parser, Subcommand};
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, warn};

use llm_gateway::api::{build_router, ApiServer, AppState};
use llm_gateway::auth::{AuthState, KeySource, RevocationList, RoleCache, TokenValidator};
use llm_gateway::config::Config;
use llm_gateway::credits::SqliteCreditLedger;
use llm_gateway::domain::Provider;
use llm_gateway::oidc::{OidcState, SqliteOidcStore, TokenIssuer};
use llm_gateway::orchestrator::Orchestrator;
use llm_gateway::pricing::PricingEngine;
use llm_gateway::providers::{
    anthropic::AnthropicAdapter, google::GoogleAdapter, openai::OpenAiAdapter, ProviderAdapter,
};
use llm_gateway::ratelimit::{RateLimiter, RateStore, RedisRateStore};
use llm_gateway::registry::ModelRegistry;
use llm_gateway::storage::{
    Database, SqliteIdentityStore, SqliteModelStore, SqlitePricingStore,
    SqliteReconciliationStore, SqliteUsageStore,
};

#[derive(Parser)]
#[command(name = "gateway", version, about = "Multi-tenant LLM inference gateway")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the gateway server.
    Serve {
        /// Path to the TOML configuration file.
        #[arg(short, long, env = "GATEWAY_CONFIG")]
        config: Option<PathBuf>,
    },
    /// Apply database migrations and exit.
    Migrate {
        #[arg(short, long, env = "GATEWAY_CONFIG")]
        config: Option<PathBuf>,
    },
}

const EXIT_CONFIG: u8 = 1;
const EXIT_DATABASE: u8 = 2;
const EXIT_SHARED_STORE: u8 = 3;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match cli.command {
        Command::Serve { config } => serve(config).await,
        Command::Migrate { config } => migrate(config).await,
    }
}

fn load_config(path: Option<PathBuf>) -> Result<Config, ExitCode> {
    match Config::load(path.as_deref()) {
        Ok(config) => Ok(config),
        Err(e) => {
            eprintln!("configuration error: {}", e);
            Err(ExitCode::from(EXIT_CONFIG))
        }
    }
}

async fn migrate(config: Option<PathBuf>) -> ExitCode {
    let config = match load_config(config) {
        Ok(c) => c,
        Err(code) => return code,
    };
    llm_gateway::observability::init_tracing(&config.logging);

    let database = match Database::connect(&config.database).await {
        Ok(db) => db,
        Err(e) => {
            error!(error = %e, "database unavailable");
            return ExitCode::from(EXIT_DATABASE);
        }
    };
    if let Err(e) = database.migrate().await {
        error!(error = %e, "migration failed");
        return ExitCode::from(EXIT_DATABASE);
    }
    ExitCode::SUCCESS
}

async fn serve(config: Option<PathBuf>) -> ExitCode {
    let config = match load_config(config) {
        Ok(c) => c,
        Err(code) => return code,
    };
    llm_gateway::observability::init_tracing(&config.logging);

    // Database is required at boot.
    let database = match Database::connect(&config.database).await {
        Ok(db) => db,
        Err(e) => {
            error!(error = %e, "database unavailable at boot");
            return ExitCode::from(EXIT_DATABASE);
        }
    };
    if let Err(e) = database.migrate().await {
        error!(error = %e, "migration failed");
        return ExitCode::from(EXIT_DATABASE);
    }
    let pool = database.pool().clone();

    // Shared store: required only by policy; otherwise the limiter degrades.
    let shared_store: Option<Arc<dyn RateStore>> = match &config.shared_store.url {
        Some(url) => match RedisRateStore::new(url) {
            Ok(store) => match store.ping().await {
                Ok(()) => Some(Arc::new(store)),
                Err(e) if config.shared_store.required => {
                    error!(error = %e, "shared store unavailable at boot");
                    return ExitCode::from(EXIT_SHARED_STORE);
                }
                Err(e) => {
                    warn!(error = %e, "shared store unreachable, limiter starts in fallback mode");
                    Some(Arc::new(store))
                }
            },
            Err(e) if config.shared_store.required => {
                error!(error = %e, "shared store misconfigured");
                return ExitCode::from(EXIT_SHARED_STORE);
            }
            Err(e) => {
                warn!(error = %e, "shared store misconfigured, using in-memory limiter");
                None
            }
        },
        None => None,
    };

    // Composition root: leaves first.
    let limiter = Arc::new(RateLimiter::new(shared_store, &config));
    let pricing = Arc::new(PricingEngine::new(Arc::new(SqlitePricingStore::new(
        pool.clone(),
    ))));
    let ledger = Arc::new(SqliteCreditLedger::new(pool.clone()));
    let registry = Arc::new(ModelRegistry::new(Arc::new(SqliteModelStore::new(
        pool.clone(),
    ))));
    let reconciliation = Arc::new(SqliteReconciliationStore::new(pool.clone()));
    let usage_store = Arc::new(SqliteUsageStore::new(pool.clone()));
    let identity = Arc::new(SqliteIdentityStore::new(pool.clone()));

    let mut adapters: HashMap<Provider, Arc<dyn ProviderAdapter>> = HashMap::new();
    match OpenAiAdapter::new(&config.providers.openai) {
        Ok(adapter) => {
            adapters.insert(Provider::OpenAI, Arc::new(adapter));
        }
        Err(e) => {
            eprintln!("openai adapter: {}", e);
            return ExitCode::from(EXIT_CONFIG);
        }
    }
    match AnthropicAdapter::new(&config.providers.anthropic) {
        Ok(adapter) => {
            adapters.insert(Provider::Anthropic, Arc::new(adapter));
        }
        Err(e) => {
            eprintln!("anthropic adapter: {}", e);
            return ExitCode::from(EXIT_CONFIG);
        }
    }
    match GoogleAdapter::new(&config.providers.google) {
        Ok(adapter) => {
            adapters.insert(Provider::Google, Arc::new(adapter));
        }
        Err(e) => {
            eprintln!("google adapter: {}", e);
            return ExitCode::from(EXIT_CONFIG);
        }
    }

    let orchestrator = Arc::new(Orchestrator::new(
        registry.clone(),
        limiter.clone(),
        pricing,
        ledger.clone(),
        reconciliation,
        adapters,
        Duration::from_secs(config.server.stream_timeout_secs),
    ));

    // Auth: validate against an external JWKS when configured, otherwise
    // against our own signing key.
    let revocations = RevocationList::new();
    let key_source = match &config.auth.jwks_url {
        Some(url) => KeySource::remote(url.clone()),
        None => KeySource::local(&config.auth.jwk),
    };
    let key_source = match key_source {
        Ok(source) => source,
        Err(e) => {
            eprintln!("auth key configuration error: {}", e);
            return ExitCode::from(EXIT_CONFIG);
        }
    };
    let validator = Arc::new(TokenValidator::new(
        key_source,
        config.auth.issuer.clone(),
        config.auth.audience.clone(),
        revocations.clone(),
    ));
    let roles = Arc::new(RoleCache::new(identity.clone()));
    let auth_state = AuthState {
        validator: validator.clone(),
        roles,
    };

    let token_issuer = match TokenIssuer::new(&config.auth) {
        Ok(issuer) => Arc::new(issuer),
        Err(e) => {
            eprintln!("signing key error: {}", e);
            return ExitCode::from(EXIT_CONFIG);
        }
    };
    let oidc_state = OidcState {
        auth_config: Arc::new(config.auth.clone()),
        identity,
        store: Arc::new(SqliteOidcStore::new(pool.clone())),
        issuer: token_issuer,
        validator,
        revocations,
        limiter: limiter.clone(),
    };

    let app_state = AppState {
        orchestrator,
        registry,
        ledger,
        usage: usage_store,
        limiter,
    };

    let router = build_router(app_state, auth_state, oidc_state, &config.server);
    let server = ApiServer::new(config.server.clone(), router);

    if let Err(e) = server.run().await {
        error!(error = %e, "server exited with error");
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}

//! HTTP surface: router assembly, middleware stack, and the server.

pub mod error;
pub mod handlers;
pub mod types;

pub use error::{ApiError, ApiResult};

use axum::extract::Request;
use axum::http::HeaderValue;
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{get, post};
use axum::Router;
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::auth::{auth_middleware, AuthContext, AuthState};
use crate::config::ServerConfig;
use crate::credits::CreditLedger;
use crate::oidc::OidcState;
use crate::orchestrator::Orchestrator;
use crate::ratelimit::RateLimiter;
use crate::registry::ModelRegistry;
use crate::storage::UsageStore;

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    pub registry: Arc<ModelRegistry>,
    pub ledger: Arc<dyn CreditLedger>,
    pub usage: Arc<dyn UsageStore>,
    pub limiter: Arc<RateLimiter>,
}

/// Attach `X-RateLimit-*` to every authenticated `/v1` response. Runs inside
/// the auth middleware so the context extension is present.
async fn rate_limit_headers(
    axum::extract::State(state): axum::extract::State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let ctx = request.extensions().get::<AuthContext>().cloned();
    let mut response = next.run(request).await;

    if let Some(ctx) = ctx {
        let status = state.limiter.status(&ctx.user_id, ctx.tier).await;
        let headers = response.headers_mut();
        if let Ok(value) = HeaderValue::from_str(&status.requests_per_minute.to_string()) {
            headers.insert("x-ratelimit-limit", value);
        }
        if let Ok(value) = HeaderValue::from_str(&status.requests_remaining.to_string()) {
            headers.insert("x-ratelimit-remaining", value);
        }
        if let Ok(value) = HeaderValue::from_str(&status.reset_at.to_string()) {
            headers.insert("x-ratelimit-reset", value);
        }
    }

    response
}

/// The authenticated `/v1` API plus the OIDC provider surface.
pub fn build_router(
    state: AppState,
    auth_state: AuthState,
    oidc_state: OidcState,
    config: &ServerConfig,
) -> Router {
    let v1 = Router::new()
        .route("/v1/models", get(handlers::list_models))
        .route("/v1/models/:id", get(handlers::get_model))
        .route("/v1/completions", post(handlers::completions))
        .route("/v1/chat/completions", post(handlers::chat_completions))
        .route("/v1/credits/me", get(handlers::credits_me))
        .route("/v1/usage", get(handlers::list_usage))
        .route("/v1/usage/stats", get(handlers::usage_stats))
        .route("/v1/rate-limit", get(handlers::rate_limit_status))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            rate_limit_headers,
        ))
        .layer(middleware::from_fn_with_state(auth_state, auth_middleware))
        .with_state(state);

    let mut router = Router::new()
        .route("/health", get(handlers::health_check))
        .merge(v1)
        .merge(crate::oidc::router(oidc_state));

    let stack = ServiceBuilder::new()
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::new(Duration::from_secs(
            config.request_timeout_secs,
        )));
    router = router.layer(stack);

    if config.enable_cors {
        router = router.layer(CorsLayer::permissive());
    }

    router
}

pub struct ApiServer {
    config: ServerConfig,
    router: Router,
}

impl ApiServer {
    pub fn new(config: ServerConfig, router: Router) -> Self {
        Self { config, router }
    }

    pub async fn run(self) -> crate::domain::Result<()> {
        let addr = format!("{}:{}", self.config.host, self.config.port);
        info!(%addr, "starting gateway server");

        let listener = tokio::net::TcpListener::bind(&addr).await?;
        axum::serve(listener, self.router)
            .await
            .map_err(|e| crate::domain::GatewayError::Internal(format!("server error: {}", e)))?;
        Ok(())
    }
}

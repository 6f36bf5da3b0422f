//! `/v1` handlers. Thin: scope check, call the service, serialize.

use axum::extract::{Path, Query, State};
use axum::response::Response;
use axum::{Extension, Json};
use serde_json::json;

use super::error::ApiResult;
use super::types::{
    ChatCompletionRequest, ChatCompletionResponse, CompletionApiRequest, CompletionResponse,
    PageMeta, UsagePage, UsageQuery, UsageStatsQuery,
};
use super::AppState;
use crate::auth::AuthContext;
use crate::domain::{GatewayError, UsageRecord};
use crate::ratelimit::RateLimitStatus;
use crate::registry::{ModelFilter, ModelListing};
use crate::storage::UsageStatBucket;

// ===== Health =====

pub async fn health_check() -> Json<serde_json::Value> {
    Json(json!({ "status": "healthy", "version": crate::VERSION }))
}

// ===== Completions =====

pub async fn chat_completions(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Json(request): Json<ChatCompletionRequest>,
) -> ApiResult<Response> {
    ctx.require_scope("llm.inference")?;

    if request.messages.is_empty() {
        return Err(GatewayError::invalid_request("messages must not be empty").into());
    }

    if request.stream {
        Ok(state.orchestrator.clone().chat_stream(&ctx, request).await?)
    } else {
        let response: ChatCompletionResponse = state.orchestrator.chat(&ctx, request).await?;
        Ok(axum::response::IntoResponse::into_response(Json(response)))
    }
}

pub async fn completions(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Json(request): Json<CompletionApiRequest>,
) -> ApiResult<Response> {
    ctx.require_scope("llm.inference")?;

    if request.prompt.is_empty() {
        return Err(GatewayError::invalid_request("prompt must not be empty").into());
    }

    if request.stream {
        Ok(state
            .orchestrator
            .clone()
            .completion_stream(&ctx, request)
            .await?)
    } else {
        let response: CompletionResponse = state.orchestrator.completion(&ctx, request).await?;
        Ok(axum::response::IntoResponse::into_response(Json(response)))
    }
}

// ===== Models =====

pub async fn list_models(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Query(mut filter): Query<ModelFilter>,
) -> ApiResult<Json<serde_json::Value>> {
    ctx.require_scope("models.read")?;

    // include_archived is an admin-only filter.
    if filter.include_archived && !ctx.is_admin() {
        filter.include_archived = false;
    }

    let models = state.registry.list(&filter, ctx.tier).await?;
    Ok(Json(json!({ "data": models, "object": "list" })))
}

pub async fn get_model(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Path(model_id): Path<String>,
) -> ApiResult<Json<ModelListing>> {
    ctx.require_scope("models.read")?;

    let model = state.registry.require(&model_id).await?;
    if model.is_archived && !ctx.is_admin() {
        return Err(GatewayError::NotFound(format!("model not found: {}", model_id)).into());
    }

    let access_status = model.access_status(ctx.tier);
    let legacy_info = model.legacy_info();
    Ok(Json(ModelListing {
        model,
        access_status,
        legacy_info,
    }))
}

// ===== Credits & usage =====

pub async fn credits_me(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
) -> ApiResult<Json<crate::domain::DetailedBalance>> {
    ctx.require_scope("credits.read")?;
    let balance = state.ledger.get_detailed(&ctx.user_id).await?;
    Ok(Json(balance))
}

pub async fn list_usage(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Query(query): Query<UsageQuery>,
) -> ApiResult<Json<UsagePage<UsageRecord>>> {
    ctx.require_scope("credits.read")?;
    validator::Validate::validate(&query)
        .map_err(|e| GatewayError::validation(e.to_string()))?;

    let filter = query.to_filter();
    let records = state.usage.list(&ctx.user_id, &filter).await?;
    let total = state.usage.count(&ctx.user_id, &filter).await?;
    let summary = state.usage.summarize(&ctx.user_id, &filter).await?;

    Ok(Json(UsagePage {
        data: records,
        meta: PageMeta {
            limit: filter.limit,
            offset: filter.offset,
            total,
        },
        summary,
    }))
}

pub async fn usage_stats(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Query(query): Query<UsageStatsQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    ctx.require_scope("credits.read")?;

    if !matches!(query.group_by.as_str(), "day" | "hour" | "model") {
        return Err(GatewayError::validation("group_by must be day, hour, or model").into());
    }

    let filter = crate::storage::UsageFilter {
        start_date: query.start_date,
        end_date: query.end_date,
        limit: 100,
        ..Default::default()
    };
    let buckets: Vec<UsageStatBucket> = state
        .usage
        .stats(&ctx.user_id, &query.group_by, &filter)
        .await?;

    Ok(Json(json!({
        "data": buckets,
        "meta": { "groupBy": query.group_by },
    })))
}

pub async fn rate_limit_status(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
) -> ApiResult<Json<RateLimitStatus>> {
    // Any valid bearer may read its own limits.
    let status = state.limiter.status(&ctx.user_id, ctx.tier).await;
    Ok(Json(status))
}

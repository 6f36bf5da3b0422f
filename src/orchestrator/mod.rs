//! The inference request pipeline: model access, parameter constraints,
//! admission, pre-flight credit check, dispatch, cost finalization, atomic
//! deduction + usage recording, and response shaping.

pub mod params;
pub mod stream;

use chrono::Utc;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::api::types::{
    ChatCompletionRequest, ChatCompletionResponse, CompletionApiRequest, CompletionResponse,
    UsageInfo,
};
use crate::auth::AuthContext;
use crate::credits::CreditLedger;
use crate::domain::{
    AccessStatus, DeductionOutcome, GatewayError, ModelRecord, Operation, Provider, Result,
    UsageRecord,
};
use crate::pricing::PricingEngine;
use crate::providers::{
    retry::with_retry, ChatMessage, ChatRequest, CompletionRequest, FinishReason, NormalizedUsage,
    ProviderAdapter,
};
use crate::ratelimit::{Admission, RateLimiter};
use crate::registry::ModelRegistry;
use crate::storage::ReconciliationStore;

/// Crude prompt-size estimate used only for the pre-flight credit check.
/// Four bytes per token is the usual planning figure.
pub(crate) fn estimate_tokens(text_len: usize) -> u64 {
    (text_len as u64 / 4) + 4
}

fn messages_text_len(messages: &[ChatMessage]) -> usize {
    messages
        .iter()
        .map(|m| match &m.content {
            Value::String(s) => s.len(),
            other => other.to_string().len(),
        })
        .sum()
}

pub struct Orchestrator {
    registry: Arc<ModelRegistry>,
    limiter: Arc<RateLimiter>,
    pricing: Arc<PricingEngine>,
    ledger: Arc<dyn CreditLedger>,
    reconciliation: Arc<dyn ReconciliationStore>,
    adapters: HashMap<Provider, Arc<dyn ProviderAdapter>>,
    stream_timeout: Duration,
}

/// Everything the pipeline needs after the pre-dispatch checks pass.
pub(crate) struct Prepared {
    pub model: ModelRecord,
    pub params: Map<String, Value>,
}

impl Orchestrator {
    pub fn new(
        registry: Arc<ModelRegistry>,
        limiter: Arc<RateLimiter>,
        pricing: Arc<PricingEngine>,
        ledger: Arc<dyn CreditLedger>,
        reconciliation: Arc<dyn ReconciliationStore>,
        adapters: HashMap<Provider, Arc<dyn ProviderAdapter>>,
        stream_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            limiter,
            pricing,
            ledger,
            reconciliation,
            adapters,
            stream_timeout,
        }
    }

    pub(crate) fn adapter(&self, provider: Provider) -> Result<Arc<dyn ProviderAdapter>> {
        self.adapters
            .get(&provider)
            .cloned()
            .ok_or_else(|| GatewayError::internal(format!("no adapter for provider {}", provider)))
    }

    pub(crate) fn stream_timeout(&self) -> Duration {
        self.stream_timeout
    }

    /// Steps 2-5 of the pipeline: model access, parameter constraints,
    /// admission, and the pre-flight credit check. Ordering matters: a
    /// rate-limited request must not open an upstream connection, and a
    /// broke one must fail before dispatch.
    pub(crate) async fn prepare(
        &self,
        ctx: &AuthContext,
        model_id: &str,
        request_params: &Map<String, Value>,
        estimated_input_tokens: u64,
    ) -> Result<Prepared> {
        // Model access gate.
        let model = self.registry.require(model_id).await?;
        if !model.is_dispatchable() {
            return Err(GatewayError::ModelUnavailable(model.id.clone()));
        }
        if model.access_status(ctx.tier) != AccessStatus::Allowed {
            return Err(GatewayError::TierRestricted {
                model_id: model.id.clone(),
                required_tier: model.required_tier.to_string(),
                current_tier: ctx.tier.to_string(),
            });
        }

        // Parameter constraints.
        let filtered = params::filter_params(&model.constraints(), request_params)?;
        for warning in &filtered.warnings {
            debug!(user_id = %ctx.user_id, model_id = %model.id, warning = %warning, "parameter filter");
        }

        // Admission.
        match self.limiter.admit(&ctx.user_id, ctx.tier).await {
            Admission::Allow { .. } => {}
            Admission::Deny {
                retry_after_secs,
                limit,
                remaining,
                reset_at,
            } => {
                return Err(GatewayError::RateLimitExceeded {
                    retry_after_secs,
                    limit,
                    remaining,
                    reset_at,
                });
            }
        }

        // Pre-flight estimate: prompt estimate plus the full output budget.
        let max_output = filtered
            .params
            .get("max_tokens")
            .or_else(|| filtered.params.get("max_completion_tokens"))
            .and_then(|v| v.as_u64())
            .unwrap_or(model.max_output_tokens as u64);

        let required = self
            .pricing
            .estimate_credits(
                model.provider,
                &model.id,
                ctx.tier,
                estimated_input_tokens,
                max_output,
            )
            .await?;

        let balance = self.ledger.get_detailed(&ctx.user_id).await?;
        if balance.total_available < required {
            return Err(GatewayError::InsufficientCredits {
                required,
                available: balance.total_available,
            });
        }

        Ok(Prepared {
            model,
            params: filtered.params,
        })
    }

    /// Steps 7-9: final cost from real usage, atomic deduct + record, and the
    /// reconciliation fallback when charging fails after a successful
    /// inference. The returned outcome is what the client sees in
    /// `usage.credits`.
    pub(crate) async fn finalize_and_charge(
        &self,
        ctx: &AuthContext,
        model: &ModelRecord,
        operation: Operation,
        usage: &NormalizedUsage,
        finish_reason: FinishReason,
        duration_ms: u64,
    ) -> Result<DeductionOutcome> {
        let tokens = usage.token_counts();
        let cost = self
            .pricing
            .finalize(model.provider, &model.id, ctx.tier, &tokens, Utc::now())
            .await?;

        let operation = if finish_reason == FinishReason::ToolCalls {
            Operation::FunctionCall
        } else {
            operation
        };

        let record = UsageRecord {
            id: Uuid::new_v4(),
            user_id: ctx.user_id.clone(),
            model_id: model.id.clone(),
            provider: model.provider,
            operation,
            prompt_tokens: usage.prompt_tokens,
            completion_tokens: usage.completion_tokens,
            total_tokens: usage.total_tokens,
            cache_creation_tokens: usage.cache_creation_input_tokens,
            cache_read_tokens: usage.cache_read_input_tokens,
            cached_prompt_tokens: usage
                .cached_prompt_tokens
                .or(usage.cached_content_token_count),
            credits_used: cost.credits,
            vendor_cost: cost.vendor_cost,
            margin_multiplier: cost.multiplier,
            gross_margin: cost.gross_margin,
            credit_breakdown: cost.breakdown,
            cache_hit_rate: cost.cache_hit_rate,
            cost_savings_percent: cost.cost_savings_percent,
            finish_reason: finish_reason.as_str().to_string(),
            debit_trail: vec![],
            executed_at: Utc::now(),
            duration_ms,
        };

        let outcome = match self
            .ledger
            .deduct(&ctx.user_id, cost.credits, record.clone())
            .await
        {
            Ok(outcome) => outcome,
            Err(first_err) => {
                warn!(
                    user_id = %ctx.user_id,
                    error = %first_err,
                    "deduction failed after successful inference, retrying once"
                );
                match self
                    .ledger
                    .deduct(&ctx.user_id, cost.credits, record.clone())
                    .await
                {
                    Ok(outcome) => outcome,
                    Err(second_err) => {
                        // The only sanctioned relaxation of exactly-once
                        // billing: the content already reached the client, so
                        // flag the uncharged usage for out-of-band repair.
                        error!(
                            user_id = %ctx.user_id,
                            usage_id = %record.id,
                            error = %second_err,
                            "deduction failed twice, writing reconciliation record"
                        );
                        metrics::increment_counter!("gateway_reconciliation_records_total");
                        self.reconciliation
                            .record(&ctx.user_id, &record, &second_err.to_string())
                            .await?;

                        let balance = self
                            .ledger
                            .get_detailed(&ctx.user_id)
                            .await
                            .unwrap_or_else(|_| crate::domain::DetailedBalance::empty());
                        DeductionOutcome {
                            deducted: cost.credits,
                            remaining: balance.total_available,
                            subscription_remaining: balance.subscription.remaining,
                            purchased_remaining: balance.purchased.remaining,
                            debit_trail: vec![],
                        }
                    }
                }
            }
        };

        self.limiter
            .record_usage(&ctx.user_id, usage.total_tokens, outcome.deducted as u64)
            .await;

        metrics::histogram!("gateway_inference_duration_ms", duration_ms as f64);

        Ok(outcome)
    }

    // ===== Unary pipelines =====

    pub async fn chat(
        &self,
        ctx: &AuthContext,
        request: ChatCompletionRequest,
    ) -> Result<ChatCompletionResponse> {
        let estimated_input = estimate_tokens(messages_text_len(&request.messages));
        let prepared = self
            .prepare(ctx, &request.model, &request.params, estimated_input)
            .await?;

        let adapter = self.adapter(prepared.model.provider)?;
        let upstream_request = ChatRequest {
            model: prepared.model.id.clone(),
            messages: request.messages,
            params: prepared.params,
        };

        let started = Instant::now();
        let response = with_retry("chat", || adapter.chat(&upstream_request)).await?;
        let duration_ms = started.elapsed().as_millis() as u64;

        let outcome = self
            .finalize_and_charge(
                ctx,
                &prepared.model,
                Operation::Chat,
                &response.usage,
                response.finish_reason,
                duration_ms,
            )
            .await?;

        Ok(ChatCompletionResponse::new(
            prepared.model.id,
            response.content,
            response.finish_reason,
            UsageInfo::build(&response.usage, &outcome),
        ))
    }

    pub async fn completion(
        &self,
        ctx: &AuthContext,
        request: CompletionApiRequest,
    ) -> Result<CompletionResponse> {
        let estimated_input = estimate_tokens(request.prompt.len());
        let prepared = self
            .prepare(ctx, &request.model, &request.params, estimated_input)
            .await?;

        let adapter = self.adapter(prepared.model.provider)?;
        let upstream_request = CompletionRequest {
            model: prepared.model.id.clone(),
            prompt: request.prompt,
            params: prepared.params,
        };

        let started = Instant::now();
        let response = with_retry("completion", || adapter.completion(&upstream_request)).await?;
        let duration_ms = started.elapsed().as_millis() as u64;

        let outcome = self
            .finalize_and_charge(
                ctx,
                &prepared.model,
                Operation::Completion,
                &response.usage,
                response.finish_reason,
                duration_ms,
            )
            .await?;

        Ok(CompletionResponse::new(
            prepared.model.id,
            response.content,
            response.finish_reason,
            UsageInfo::build(&response.usage, &outcome),
        ))
    }

    // ===== Streaming pipelines =====

    pub async fn chat_stream(
        self: Arc<Self>,
        ctx: &AuthContext,
        request: ChatCompletionRequest,
    ) -> Result<axum::response::Response> {
        let estimated_input = estimate_tokens(messages_text_len(&request.messages));
        let prepared = self
            .prepare(ctx, &request.model, &request.params, estimated_input)
            .await?;

        let adapter = self.adapter(prepared.model.provider)?;
        let upstream_request = ChatRequest {
            model: prepared.model.id.clone(),
            messages: request.messages,
            params: prepared.params,
        };
        let upstream = with_retry("chat_stream", || adapter.chat_stream(&upstream_request)).await?;

        Ok(stream::serve(
            self.clone(),
            ctx.clone(),
            prepared.model,
            Operation::Chat,
            true,
            upstream,
        ))
    }

    pub async fn completion_stream(
        self: Arc<Self>,
        ctx: &AuthContext,
        request: CompletionApiRequest,
    ) -> Result<axum::response::Response> {
        let estimated_input = estimate_tokens(request.prompt.len());
        let prepared = self
            .prepare(ctx, &request.model, &request.params, estimated_input)
            .await?;

        let adapter = self.adapter(prepared.model.provider)?;
        let upstream_request = CompletionRequest {
            model: prepared.model.id.clone(),
            prompt: request.prompt,
            params: prepared.params,
        };
        let upstream = with_retry("completion_stream", || {
            adapter.completion_stream(&upstream_request)
        })
        .await?;

        Ok(stream::serve(
            self.clone(),
            ctx.clone(),
            prepared.model,
            Operation::Completion,
            false,
            upstream,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_estimation() {
        assert_eq!(estimate_tokens(0), 4);
        assert_eq!(estimate_tokens(400), 104);
    }

    #[test]
    fn test_messages_text_len_handles_parts() {
        let messages = vec![
            ChatMessage {
                role: "user".to_string(),
                content: Value::String("hello".to_string()),
                name: None,
            },
            ChatMessage {
                role: "user".to_string(),
                content: serde_json::json!([{"type": "text", "text": "world"}]),
                name: None,
            },
        ];
        let len = messages_text_len(&messages);
        assert!(len >= 5 + 5);
    }
}
